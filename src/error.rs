//! Canonical error and result types for the crate.
//!
//! `ServerSrcError` is the single surface returned by [`crate::source`]
//! operations. Startup variants are terminal for the instance; per-pull
//! failures are recoverable on the next pull.

use thiserror::Error;

use crate::{
    assembler::FrameAssemblyError,
    config::ConfigError,
    discovery::DiscoveryError,
    source::SourceState,
    transport::TransportError,
};

/// Top-level error type exposed by `tensor_query`.
#[derive(Debug, Error)]
pub enum ServerSrcError {
    /// A required configuration value was invalid.
    #[error("configuration rejected: {0}")]
    ConfigurationRejected(#[from] ConfigError),
    /// Publishing the topic to the discovery broker failed.
    #[error("discovery registration failed: {0}")]
    Discovery(#[from] DiscoveryError),
    /// The transport could not be created, bound or started.
    #[error("transport failed to start: {0}")]
    TransportStart(#[source] TransportError),
    /// No downstream consumer attached before the readiness deadline.
    #[error("no consumer attached to server {id} within {waited_ms} ms")]
    ReadinessTimeout {
        /// Textual instance id of the server context.
        id: String,
        /// How long the source waited.
        waited_ms: u128,
    },
    /// A received message could not be turned into a frame.
    #[error("frame assembly failed: {0}")]
    FrameAssembly(#[from] FrameAssemblyError),
    /// The negotiated caps could not be written to the transport.
    #[error("failed to relay caps: {0}")]
    CapsRelay(#[source] TransportError),
    /// The source was shut down while a pull was pending.
    #[error("source is flushing")]
    Flushing,
    /// The operation is not valid in the current lifecycle state.
    #[error("operation not permitted in state {0:?}")]
    InvalidState(SourceState),
}

impl ServerSrcError {
    /// Returns true if the caller may issue another pull after this error.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::FrameAssembly(_) | Self::CapsRelay(_))
    }
}

/// Canonical result alias used by `tensor_query` public APIs.
pub type Result<T> = std::result::Result<T, ServerSrcError>;
