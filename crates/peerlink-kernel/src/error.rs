//! Kernel-specific error types.

use peerlink_types::error::PeerlinkError;
use peerlink_wire::error::{
    DiscoveryError, HostError, ResolveError, SchedulerError, TransportError,
};
use thiserror::Error;

/// Kernel error type wrapping PeerlinkError with kernel-specific context.
#[derive(Error, Debug)]
pub enum KernelError {
    /// A wrapped PeerlinkError.
    #[error(transparent)]
    Peerlink(#[from] PeerlinkError),

    /// The node failed to boot.
    #[error("Boot failed: {0}")]
    BootFailed(String),

    /// An optional part of the node was not configured.
    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Host(#[from] HostError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// Alias for kernel results.
pub type KernelResult<T> = Result<T, KernelError>;
