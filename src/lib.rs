#![doc(html_root_url = "https://docs.rs/tensor-query/latest")]
//! Public API for the `tensor_query` library.
//!
//! This crate provides the server side of a tensor query pipeline: a source
//! that accepts client connections, turns received multi-segment messages
//! into frames tagged with the sender's identity, and hands them to a
//! consumer through a blocking pull interface.

pub mod assembler;
pub mod caps;
pub mod config;
pub mod discovery;
pub mod error;
pub mod frame;
pub mod message;
pub mod metrics;
pub mod queue;
pub mod registry;
pub mod sink;
pub mod source;
pub mod transport;

pub use assembler::{FrameAssemblyError, assemble};
pub use caps::{Caps, CapsInjector, CapsQuery, CapsStructure, CapsValue, SERVER_CAPS_DELIMITER};
pub use config::{ConfigError, Protocol, ServerSrcConfig};
pub use discovery::{Broker, DiscoveryError, DiscoveryRegistration, InMemoryBroker, NodeAddress};
/// Result type alias re-exported for convenience.
pub use error::{Result, ServerSrcError};
pub use frame::{ClientId, Frame};
pub use message::{BoxedMessage, CLIENT_ID_KEY, EdgeData, EdgeMessage, MessageError};
pub use metrics::{ASSEMBLY_ERRORS_TOTAL, FRAMES_TOTAL, MESSAGES_DROPPED_TOTAL, QUEUE_DEPTH};
pub use queue::{MessageQueue, QueueClosed};
pub use registry::{ConsumerGuard, ServerContext, ServerRegistry, init};
pub use sink::TensorSink;
pub use source::{PushSource, ServerSource, ShutdownHandle, SourceState};
pub use transport::{Transport, TransportError, TransportEvent, TransportFactory};
