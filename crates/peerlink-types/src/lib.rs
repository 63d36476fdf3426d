//! Core types shared across the peerlink workspace.
//!
//! This crate defines peer identities, peer addresses, the node configuration
//! model and the shared error type. It contains no networking logic.

pub mod config;
pub mod error;
pub mod peer;

pub use error::{PeerlinkError, PeerlinkResult};
pub use peer::{PeerAddr, PeerId};
