//! Component status reporting.
//!
//! Components report under a fixed key ("RPC Listeners", "Advertiser",
//! "Task Manager"). A map report keeps entries from the previous map that
//! the new one does not mention, so a component can update one field at a
//! time.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;

/// One reported status value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Status {
    Text(String),
    Map(BTreeMap<String, String>),
}

impl Status {
    pub fn text(s: impl Into<String>) -> Self {
        Status::Text(s.into())
    }

    pub fn map<K, V, I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Status::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

#[derive(Debug, Default)]
pub struct StatusManager {
    entries: DashMap<String, Status>,
}

impl StatusManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self, key: &str, status: Status) {
        let mut slot = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Status::Map(BTreeMap::new()));
        match (&mut *slot, status) {
            (Status::Map(previous), Status::Map(update)) => previous.extend(update),
            (current, status) => *current = status,
        }
    }

    pub fn get(&self, key: &str) -> Option<Status> {
        self.entries.get(key).map(|s| s.clone())
    }

    /// Every reported status as a JSON object, keys sorted.
    pub fn snapshot(&self) -> serde_json::Value {
        let sorted: BTreeMap<String, Status> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        serde_json::to_value(sorted).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_reports_merge() {
        let manager = StatusManager::new();
        manager.report(
            "RPC Listeners",
            Status::map([("TCP", "running"), ("P2P", "not running")]),
        );
        manager.report("RPC Listeners", Status::map([("P2P", "running")]));
        assert_eq!(
            manager.get("RPC Listeners"),
            Some(Status::map([("P2P", "running"), ("TCP", "running")]))
        );
    }

    #[test]
    fn test_text_replaces() {
        let manager = StatusManager::new();
        manager.report("Advertiser", Status::map([("a", "b")]));
        manager.report("Advertiser", Status::text("running"));
        assert_eq!(manager.get("Advertiser"), Some(Status::text("running")));
        manager.report("Advertiser", Status::map([("c", "d")]));
        assert_eq!(manager.get("Advertiser"), Some(Status::map([("c", "d")])));
        assert_eq!(manager.get("missing"), None);
    }

    #[test]
    fn test_snapshot_json() {
        let manager = StatusManager::new();
        manager.report("Task Manager", Status::text("2 tasks"));
        manager.report("RPC Listeners", Status::map([("P2P", "running")]));
        let snap = manager.snapshot();
        assert_eq!(
            snap,
            serde_json::json!({
                "RPC Listeners": { "P2P": "running" },
                "Task Manager": "2 tasks",
            })
        );
    }
}
