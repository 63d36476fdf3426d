//! peerlink transport and discovery layer.
//!
//! Serves RPC traffic from several listeners at once (TCP, Unix socket and
//! peer streams), finds service providers through discovery and carries small
//! framed request/response protocols between peers.
//!
//! ## Architecture
//!
//! - **Mux**: fans connections from many tagged listeners into one accept queue
//! - **PeerHost**: opens and accepts authenticated protocol streams between peers
//! - **P2pListener / P2pDialer**: peer streams presented as ordinary connections
//! - **Advertiser**: keeps this node's services announced on a discovery backend
//! - **ClientResolver**: turns a service name into a connection
//! - **ProtocolsService**: registers framed request/response protocols (mesher, rendezvous)
//! - **TaskScheduler**: runs every long-lived loop with a cancel token

pub mod cancel;
pub mod conn;
pub mod discovery;
pub mod error;
pub mod framing;
pub mod host;
pub mod mesher;
pub mod message;
pub mod mux;
pub mod p2p;
pub mod protocols;
pub mod registry;
pub mod rendezvous;
pub mod resolver;
pub mod scheduler;
pub mod transport;

pub use cancel::CancelToken;
pub use conn::{Conn, ConnAddr};
pub use discovery::{Advertiser, DiscoveryProvider, MemoryDiscovery, Registrations};
pub use error::{
    DiscoveryError, FramingError, HostError, ProtocolError, ResolveError, SchedulerError,
    TransportError,
};
pub use framing::{read_msg, write_msg, Json, Message};
pub use host::{PeerHost, PeerStream, TcpHostConfig, TcpPeerHost};
pub use mesher::Mesher;
pub use mux::{ListenerStatus, Mux};
pub use p2p::{P2pDialer, P2pListener, RPC_PROTOCOL_ID};
pub use protocols::{Protocol, ProtocolsService, Sender};
pub use registry::{PeerEntry, PeerRegistry};
pub use rendezvous::Rendezvous;
pub use resolver::{ChainResolver, ClientResolver, PeerResolver, StaticResolver};
pub use scheduler::{Task, TaskScheduler, TokioScheduler};
pub use transport::{DialOptions, Listener, TaggedListener};
