//! Test utilities for `tensor_query`.
//!
//! Provides a serialised log capture fixture and helpers for driving a
//! [`ServerSource`](tensor_query::ServerSource) over the in-memory transport.
//!
//! ```rust
//! use tensor_query_testing::{MemoryServer, tagged_message};
//!
//! let server = MemoryServer::new();
//! let _guard = server.attach_consumer(&server.config());
//! assert!(!server.transport().deliver(tagged_message(1, &[b"payload"])));
//! ```

pub mod integration_helpers;
pub mod logging;

pub use integration_helpers::{MemoryServer, memory_server, tagged_message, untagged_message};
pub use logging::{LoggerHandle, logger};
