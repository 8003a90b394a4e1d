//! Registry of server contexts shared between a source and its consumers.
//!
//! A server context is looked up by the textual instance id. The source
//! obtains its transport through the context, and consumers attach to it
//! so the source can wait until someone will read its frames.

use std::{
    sync::{Arc, Condvar, Mutex, OnceLock, PoisonError},
    time::Duration,
};

use dashmap::{DashMap, mapref::entry::Entry};
use log::{debug, info};

use crate::{
    config::ServerSrcConfig,
    transport::{TcpTransportFactory, Transport, TransportError, TransportFactory},
};

#[cfg(test)]
mod tests;

/// Shared state for one server instance id.
pub struct ServerContext {
    id: String,
    transport: Arc<dyn Transport>,
    consumers: Mutex<usize>,
    attached: Condvar,
}

impl ServerContext {
    fn new(id: &str, transport: Arc<dyn Transport>) -> Self {
        Self {
            id: id.to_owned(),
            transport,
            consumers: Mutex::new(0),
            attached: Condvar::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str { &self.id }

    #[must_use]
    pub fn transport(&self) -> Arc<dyn Transport> { Arc::clone(&self.transport) }

    /// Register a consumer; it stays attached until the guard is dropped.
    #[must_use]
    pub fn attach_consumer(self: &Arc<Self>) -> ConsumerGuard {
        let mut consumers = self.consumers.lock().unwrap_or_else(PoisonError::into_inner);
        *consumers += 1;
        drop(consumers);
        self.attached.notify_all();
        debug!("consumer attached: server_id={}", self.id);
        ConsumerGuard {
            context: Arc::clone(self),
        }
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        *self.consumers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until at least one consumer is attached or `timeout` elapses.
    ///
    /// Returns `true` if a consumer is attached.
    #[must_use]
    pub fn wait_for_consumer(&self, timeout: Duration) -> bool {
        let consumers = self.consumers.lock().unwrap_or_else(PoisonError::into_inner);
        let (consumers, _) = self
            .attached
            .wait_timeout_while(consumers, timeout, |count| *count == 0)
            .unwrap_or_else(PoisonError::into_inner);
        *consumers > 0
    }

    fn detach_consumer(&self) {
        let mut consumers = self.consumers.lock().unwrap_or_else(PoisonError::into_inner);
        *consumers = consumers.saturating_sub(1);
        debug!("consumer detached: server_id={}", self.id);
    }
}

/// Keeps a consumer attached to a [`ServerContext`].
pub struct ConsumerGuard {
    context: Arc<ServerContext>,
}

impl ConsumerGuard {
    #[must_use]
    pub fn context(&self) -> &Arc<ServerContext> { &self.context }
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) { self.context.detach_consumer(); }
}

/// Concurrent map of server contexts keyed by instance id.
pub struct ServerRegistry {
    contexts: DashMap<String, Arc<ServerContext>>,
    factory: Arc<dyn TransportFactory>,
}

impl ServerRegistry {
    /// Create a registry building transports with `factory`.
    #[must_use]
    pub fn new(factory: impl TransportFactory + 'static) -> Self {
        Self {
            contexts: DashMap::new(),
            factory: Arc::new(factory),
        }
    }

    /// The process-wide registry, using TCP transports.
    #[must_use]
    pub fn global() -> Arc<ServerRegistry> { Arc::clone(init()) }

    /// Return the context for `id`, creating it and its transport if absent.
    ///
    /// # Errors
    ///
    /// Returns the factory's [`TransportError`] if a new transport cannot be
    /// created.
    pub fn get_or_create(
        &self,
        id: &str,
        config: &ServerSrcConfig,
    ) -> Result<Arc<ServerContext>, TransportError> {
        match self.contexts.entry(id.to_owned()) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let transport = self.factory.create(config)?;
                let context = Arc::new(ServerContext::new(id, transport));
                entry.insert(Arc::clone(&context));
                debug!("server context created: server_id={id}");
                Ok(context)
            }
        }
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<ServerContext>> {
        self.contexts.get(id).map(|c| Arc::clone(c.value()))
    }

    /// Drop the registry's reference to `id`.
    pub fn remove(&self, id: &str) -> Option<Arc<ServerContext>> {
        self.contexts.remove(id).map(|(_, context)| context)
    }

    #[must_use]
    pub fn len(&self) -> usize { self.contexts.len() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.contexts.is_empty() }
}

static GLOBAL_REGISTRY: OnceLock<Arc<ServerRegistry>> = OnceLock::new();

/// One-time process initialisation.
///
/// Creates the global [`ServerRegistry`]. Safe to call any number of times
/// from any thread; only the first call has an effect.
pub fn init() -> &'static Arc<ServerRegistry> {
    GLOBAL_REGISTRY.get_or_init(|| {
        info!("tensor query server registry initialised");
        Arc::new(ServerRegistry::new(TcpTransportFactory))
    })
}
