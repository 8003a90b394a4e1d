//! Network transport abstraction.
//!
//! A [`Transport`] owns one endpoint. The server source publishes its
//! connection details through the transport's info map, registers a single
//! event callback and starts it. The callback may run on any thread the
//! transport chooses.

use std::{io, net::SocketAddr, sync::Arc};

use thiserror::Error;

use crate::{
    config::{Protocol, ServerSrcConfig},
    frame::ClientId,
    message::BoxedMessage,
};

pub mod memory;
pub mod tcp;

pub use memory::{MemoryTransport, MemoryTransportFactory};
pub use tcp::{ServerHello, TcpClient, TcpTransport, TcpTransportFactory, WireData};

/// Info key holding the listen host.
pub const INFO_IP: &str = "IP";
/// Info key holding the listen port.
pub const INFO_PORT: &str = "PORT";
/// Info key holding the discovery topic.
pub const INFO_TOPIC: &str = "TOPIC";
/// Info key holding the negotiated capabilities.
pub const INFO_CAPS: &str = "CAPS";

/// Errors raised by transports.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport does not implement the requested protocol.
    #[error("protocol {0} is not supported by this transport")]
    UnsupportedProtocol(Protocol),
    /// `IP`/`PORT` did not form a usable address.
    #[error("invalid listen address {0:?}")]
    InvalidAddress(String),
    /// Binding the listener failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that could not be bound.
        addr: SocketAddr,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// Building the I/O runtime failed.
    #[error("failed to build transport runtime: {0}")]
    Runtime(#[source] io::Error),
    /// `start` was called twice.
    #[error("transport already started")]
    AlreadyStarted,
    /// The transport refused the operation.
    #[error("transport refused: {0}")]
    Refused(String),
}

/// Events delivered to the registered callback.
pub enum TransportEvent {
    /// A complete message arrived from a client.
    NewDataReceived(BoxedMessage),
    /// A client connected.
    ClientConnected(ClientId),
    /// A client disconnected.
    ClientDisconnected(ClientId),
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NewDataReceived(_) => f.write_str("NewDataReceived(..)"),
            Self::ClientConnected(id) => write!(f, "ClientConnected({id})"),
            Self::ClientDisconnected(id) => write!(f, "ClientDisconnected({id})"),
        }
    }
}

/// Callback invoked for each transport event.
pub type EventCallback = Arc<dyn Fn(TransportEvent) + Send + Sync + 'static>;

/// One network endpoint.
pub trait Transport: Send + Sync {
    /// Store an info value exchanged with peers.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the value is refused.
    fn set_info(&self, key: &str, value: &str) -> Result<(), TransportError>;

    /// Read an info value.
    fn info(&self, key: &str) -> Option<String>;

    /// Register the event callback, replacing any previous one.
    fn set_event_callback(&self, callback: EventCallback);

    /// Begin accepting connections.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the endpoint cannot be started.
    fn start(&self) -> Result<(), TransportError>;

    /// Stop accepting connections and release the endpoint.
    fn stop(&self);

    /// Address actually bound, once started.
    fn local_addr(&self) -> Option<SocketAddr> { None }
}

/// Creates transports for server contexts.
pub trait TransportFactory: Send + Sync {
    /// Build a transport for `config`.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the configured protocol is unsupported.
    fn create(&self, config: &ServerSrcConfig) -> Result<Arc<dyn Transport>, TransportError>;
}

impl<F> TransportFactory for F
where
    F: Fn(&ServerSrcConfig) -> Result<Arc<dyn Transport>, TransportError> + Send + Sync,
{
    fn create(&self, config: &ServerSrcConfig) -> Result<Arc<dyn Transport>, TransportError> {
        self(config)
    }
}
