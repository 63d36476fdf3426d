//! Node configuration from `~/.peerlink/config.toml`.
//!
//! A config file may list other TOML files under `include`. They are merged
//! in order before the file itself, so the including file always wins.

use crate::error::{KernelError, KernelResult};
use peerlink_types::config::NodeConfig;
use peerlink_types::PeerlinkError;
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};

/// Maximum include nesting depth.
const MAX_INCLUDE_DEPTH: u32 = 10;

/// Load the node configuration, falling back to defaults on any problem.
///
/// A missing file is normal; unreadable or malformed files are logged.
pub fn load_config(path: Option<&Path>) -> NodeConfig {
    let config_path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(path = %config_path.display(), "Config file not found, using defaults");
        return NodeConfig::default();
    }

    match read_config(&config_path) {
        Ok(config) => {
            info!(path = %config_path.display(), "Loaded configuration");
            config
        }
        Err(e) => {
            warn!(error = %e, path = %config_path.display(), "Invalid config, using defaults");
            NodeConfig::default()
        }
    }
}

/// Read, merge includes and deserialize one config file.
///
/// An include that cannot be resolved is logged and skipped as a whole; the
/// root file is still used.
pub fn read_config(config_path: &Path) -> Result<NodeConfig, String> {
    let contents = std::fs::read_to_string(config_path)
        .map_err(|e| format!("failed to read config file: {e}"))?;
    let mut root: toml::Value =
        toml::from_str(&contents).map_err(|e| format!("failed to parse config: {e}"))?;

    let config_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
    let mut visited = HashSet::new();
    visited.insert(std::fs::canonicalize(config_path).unwrap_or_else(|_| config_path.to_path_buf()));

    let without_includes = strip_include(root.clone());
    match merge_includes(&root, config_dir, &mut visited, 0) {
        Ok(Some(mut merged)) => {
            deep_merge_toml(&mut merged, &without_includes);
            root = merged;
        }
        Ok(None) => root = without_includes,
        Err(e) => {
            warn!(error = %e, "Config include resolution failed, using root config only");
            root = without_includes;
        }
    }

    root.try_into::<NodeConfig>()
        .map_err(|e| format!("failed to deserialize merged config: {e}"))
}

fn strip_include(mut value: toml::Value) -> toml::Value {
    if let toml::Value::Table(ref mut tbl) = value {
        tbl.remove("include");
    }
    value
}

fn include_list(value: &toml::Value) -> Vec<String> {
    value
        .get("include")
        .and_then(toml::Value::as_array)
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default()
}

/// Validate one include entry and resolve it inside `config_dir`.
fn resolve_include(entry: &str, config_dir: &Path) -> Result<PathBuf, String> {
    let rel = Path::new(entry);
    if rel.is_absolute() {
        return Err(format!("absolute include path rejected: {entry}"));
    }
    if rel.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(format!("include path traversal rejected: {entry}"));
    }
    let canonical = std::fs::canonicalize(config_dir.join(rel))
        .map_err(|e| format!("include '{entry}' cannot be resolved: {e}"))?;
    let canonical_dir = std::fs::canonicalize(config_dir)
        .map_err(|e| format!("config dir cannot be canonicalized: {e}"))?;
    if !canonical.starts_with(&canonical_dir) {
        return Err(format!("include '{entry}' escapes the config directory"));
    }
    Ok(canonical)
}

/// Merge the files `value` includes, in order, recursing into their own
/// includes. Returns `None` when there is nothing to include.
fn merge_includes(
    value: &toml::Value,
    config_dir: &Path,
    visited: &mut HashSet<PathBuf>,
    depth: u32,
) -> Result<Option<toml::Value>, String> {
    if depth > MAX_INCLUDE_DEPTH {
        return Err(format!("include depth exceeded maximum of {MAX_INCLUDE_DEPTH}"));
    }
    let includes = include_list(value);
    if includes.is_empty() {
        return Ok(None);
    }

    let mut merged = toml::Value::Table(toml::map::Map::new());
    for entry in &includes {
        let path = resolve_include(entry, config_dir)?;
        if !visited.insert(path.clone()) {
            return Err(format!("circular include detected: {entry}"));
        }
        info!(include = %entry, "Loading config include");

        let contents = std::fs::read_to_string(&path)
            .map_err(|e| format!("failed to read include '{entry}': {e}"))?;
        let included: toml::Value = toml::from_str(&contents)
            .map_err(|e| format!("failed to parse include '{entry}': {e}"))?;

        let include_dir = path.parent().unwrap_or(config_dir).to_path_buf();
        let mut layer = merge_includes(&included, &include_dir, visited, depth + 1)?
            .unwrap_or_else(|| toml::Value::Table(toml::map::Map::new()));
        deep_merge_toml(&mut layer, &strip_include(included));
        deep_merge_toml(&mut merged, &layer);
    }
    Ok(Some(merged))
}

/// Deep-merge two TOML values. Tables merge key by key; anything else is
/// replaced by `overlay`.
pub fn deep_merge_toml(base: &mut toml::Value, overlay: &toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_tbl), toml::Value::Table(overlay_tbl)) => {
            for (key, overlay_val) in overlay_tbl {
                match base_tbl.get_mut(key) {
                    Some(base_val) => deep_merge_toml(base_val, overlay_val),
                    None => {
                        base_tbl.insert(key.clone(), overlay_val.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Write `config` to `path` as TOML. Refuses to overwrite unless `force`.
pub fn write_config(path: &Path, config: &NodeConfig, force: bool) -> KernelResult<()> {
    if path.exists() && !force {
        return Err(KernelError::Peerlink(PeerlinkError::Config(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        ))));
    }
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(PeerlinkError::from)?;
    }
    let text = toml::to_string_pretty(config)
        .map_err(|e| PeerlinkError::Serialization(e.to_string()))?;
    std::fs::write(path, text).map_err(PeerlinkError::from)?;
    info!(path = %path.display(), "Wrote configuration");
    Ok(())
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    peerlink_home().join("config.toml")
}

/// Get the peerlink home directory.
pub fn peerlink_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".peerlink")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write(path: &Path, lines: &[&str]) {
        let mut f = std::fs::File::create(path).unwrap();
        for line in lines {
            writeln!(f, "{line}").unwrap();
        }
    }

    #[test]
    fn test_load_config_missing_file() {
        let config = load_config(Some(Path::new("/nonexistent/config.toml")));
        assert_eq!(config.log_level, "info");
        assert_eq!(config.services, vec!["peerlink".to_string()]);
    }

    #[test]
    fn test_malformed_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("config.toml");
        write(&root, &["log_level = ", "[p2p"]);
        assert_eq!(load_config(Some(&root)).log_level, "info");
    }

    #[test]
    fn test_deep_merge_nested_tables() {
        let mut base: toml::Value = toml::from_str(
            r#"
            [discovery]
            advertise_ttl_secs = 60
            retry_backoff_secs = 5
        "#,
        )
        .unwrap();
        let overlay: toml::Value = toml::from_str(
            r#"
            [discovery]
            advertise_ttl_secs = 120
        "#,
        )
        .unwrap();
        deep_merge_toml(&mut base, &overlay);
        let disc = base["discovery"].as_table().unwrap();
        assert_eq!(disc["advertise_ttl_secs"].as_integer(), Some(120));
        assert_eq!(disc["retry_backoff_secs"].as_integer(), Some(5));
    }

    #[test]
    fn test_include_merges_under_root() {
        let dir = tempfile::tempdir().unwrap();
        write(
            &dir.path().join("base.toml"),
            &[
                "log_level = \"debug\"",
                "[static_addresses]",
                "svc1 = \"localhost:10081\"",
            ],
        );
        let root = dir.path().join("config.toml");
        write(
            &root,
            &[
                "include = [\"base.toml\"]",
                "log_level = \"warn\"",
                "[static_addresses]",
                "svc2 = \"/tmp/svc2.sock\"",
            ],
        );

        let config = load_config(Some(&root));
        assert_eq!(config.log_level, "warn");
        assert_eq!(config.static_addresses.len(), 2);
        assert_eq!(config.static_addresses["svc1"], "localhost:10081");
    }

    #[test]
    fn test_nested_include_root_wins() {
        let dir = tempfile::tempdir().unwrap();
        write(
            &dir.path().join("grandchild.toml"),
            &["log_level = \"trace\"", "services = [\"deep\"]"],
        );
        write(
            &dir.path().join("child.toml"),
            &["include = [\"grandchild.toml\"]", "log_level = \"debug\""],
        );
        let root = dir.path().join("config.toml");
        write(&root, &["include = [\"child.toml\"]", "log_level = \"info\""]);

        let config = load_config(Some(&root));
        assert_eq!(config.log_level, "info");
        assert_eq!(config.services, vec!["deep".to_string()]);
    }

    #[test]
    fn test_circular_include_keeps_root() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.toml");
        write(&a, &["include = [\"b.toml\"]", "log_level = \"debug\""]);
        write(&dir.path().join("b.toml"), &["include = [\"a.toml\"]"]);

        let config = load_config(Some(&a));
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_traversal_and_absolute_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("config.toml");
        write(&root, &["include = [\"../etc/passwd\"]"]);
        assert_eq!(load_config(Some(&root)).log_level, "info");

        write(&root, &["include = [\"/etc/shadow\"]", "log_level = \"warn\""]);
        assert_eq!(load_config(Some(&root)).log_level, "warn");
    }

    #[test]
    fn test_max_depth_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..12 {
            let path = dir.path().join(format!("level{i}.toml"));
            let next = format!("include = [\"level{}.toml\"]", i + 1);
            let level = format!("log_level = \"level{i}\"");
            if i < 11 {
                write(&path, &[&next, &level]);
            } else {
                write(&path, &[&level]);
            }
        }
        let config = load_config(Some(&dir.path().join("level0.toml")));
        assert_eq!(config.log_level, "level0");
    }

    #[test]
    fn test_write_config_respects_force() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = NodeConfig::default();
        config.log_level = "debug".into();

        write_config(&path, &config, false).unwrap();
        assert_eq!(load_config(Some(&path)).log_level, "debug");

        assert!(write_config(&path, &NodeConfig::default(), false).is_err());
        write_config(&path, &NodeConfig::default(), true).unwrap();
        assert_eq!(load_config(Some(&path)).log_level, "info");
    }
}
