//! Shared helpers for integration testing a server source.
//!
//! [`MemoryServer`] bundles a registry whose every context shares one
//! [`MemoryTransport`], so tests can inject messages into whichever source
//! they start.

use std::{sync::Arc, time::Duration};

use rstest::fixture;
use tensor_query::{
    CLIENT_ID_KEY,
    Caps,
    ConsumerGuard,
    EdgeData,
    ServerRegistry,
    ServerSource,
    ServerSrcConfig,
    transport::{MemoryTransport, MemoryTransportFactory},
};

/// Registry and transport pair for in-process tests.
pub struct MemoryServer {
    registry: Arc<ServerRegistry>,
    transport: Arc<MemoryTransport>,
}

impl Default for MemoryServer {
    fn default() -> Self { Self::new() }
}

impl MemoryServer {
    #[must_use]
    pub fn new() -> Self {
        let factory = MemoryTransportFactory::new();
        let transport = factory.transport();
        Self {
            registry: Arc::new(ServerRegistry::new(factory)),
            transport,
        }
    }

    #[must_use]
    pub fn registry(&self) -> Arc<ServerRegistry> { Arc::clone(&self.registry) }

    #[must_use]
    pub fn transport(&self) -> Arc<MemoryTransport> { Arc::clone(&self.transport) }

    /// Default configuration with a short readiness deadline.
    #[must_use]
    pub fn config(&self) -> ServerSrcConfig {
        let mut config = ServerSrcConfig::default();
        config.set_ready_timeout(Duration::from_millis(100));
        config
    }

    /// Attach a consumer to the context for `config`'s id.
    ///
    /// # Panics
    ///
    /// Panics if the context cannot be created.
    #[must_use]
    pub fn attach_consumer(&self, config: &ServerSrcConfig) -> ConsumerGuard {
        self.registry
            .get_or_create(&config.id().to_string(), config)
            .expect("memory transport is always available")
            .attach_consumer()
    }

    /// Build a source for `config` whose consumer negotiated `caps`.
    ///
    /// # Panics
    ///
    /// Panics if `config` is invalid.
    #[must_use]
    pub fn source(&self, config: ServerSrcConfig, caps: Caps) -> ServerSource {
        ServerSource::new(config, self.registry(), Arc::new(caps)).expect("valid config")
    }
}

#[allow(
    unused_braces,
    reason = "rustc false positive for single line rstest fixtures"
)]
#[fixture]
pub fn memory_server() -> MemoryServer { MemoryServer::new() }

/// Message from `client_id` carrying `segments`.
#[must_use]
pub fn tagged_message(client_id: u64, segments: &[&[u8]]) -> EdgeData {
    untagged_message(segments).with_info(CLIENT_ID_KEY, client_id.to_string())
}

/// Message without a client identity.
#[must_use]
pub fn untagged_message(segments: &[&[u8]]) -> EdgeData {
    segments.iter().fold(EdgeData::new(), |message, segment| {
        message.with_segment(bytes::Bytes::copy_from_slice(segment))
    })
}
