//! Composition root for a peerlink node.
//!
//! Loads the configuration, builds the peer host, protocols, listener mux,
//! advertiser and client resolver, and shuts them down again.

pub mod config;
pub mod error;
pub mod node;
pub mod status;
pub mod supervisor;

pub use error::{KernelError, KernelResult};
pub use node::Node;
pub use status::{Status, StatusManager};
pub use supervisor::Supervisor;
