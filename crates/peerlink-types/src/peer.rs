//! Peer identities and addresses.

use crate::error::PeerlinkError;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// PeerId
// ---------------------------------------------------------------------------

/// Stable identifier of a peer, independent of its network addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Wrap an existing identifier without validation.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new random PeerId.
    pub fn random() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for PeerId {
    type Err = PeerlinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(PeerlinkError::InvalidInput("empty peer id".into()));
        }
        if s.chars().any(|c| c.is_whitespace() || c == '@' || c == '/') {
            return Err(PeerlinkError::InvalidInput(format!(
                "peer id contains a reserved character: {s}"
            )));
        }
        Ok(Self(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// PeerAddr
// ---------------------------------------------------------------------------

/// A peer identity together with the socket addresses it can be reached on.
///
/// The textual form is `<id>@<addr>[,<addr>...]`, e.g.
/// `4f1c...@10.0.0.2:7401,127.0.0.1:7401`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddr {
    /// The peer's identifier.
    pub id: PeerId,
    /// Known dialable addresses, in preference order.
    #[serde(default)]
    pub addrs: Vec<SocketAddr>,
}

impl PeerAddr {
    pub fn new(id: PeerId, addrs: Vec<SocketAddr>) -> Self {
        Self { id, addrs }
    }
}

impl std::fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@", self.id)?;
        for (i, addr) in self.addrs.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{addr}")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for PeerAddr {
    type Err = PeerlinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, addrs) = s
            .split_once('@')
            .ok_or_else(|| PeerlinkError::InvalidInput(format!("expected <id>@<addr>: {s}")))?;
        let id: PeerId = id.parse()?;
        let addrs = addrs
            .split(',')
            .filter(|a| !a.trim().is_empty())
            .map(|a| {
                a.trim().parse::<SocketAddr>().map_err(|e| {
                    PeerlinkError::InvalidInput(format!("bad socket address '{a}': {e}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        if addrs.is_empty() {
            return Err(PeerlinkError::InvalidInput(format!(
                "peer {id} has no addresses"
            )));
        }
        Ok(Self { id, addrs })
    }
}
