//! In-process transport.
//!
//! `MemoryTransport` keeps its info map in a `DashMap` and delivers
//! messages injected by the embedder straight to the registered callback
//! on the calling thread.

use std::sync::{
    Arc,
    Mutex,
    PoisonError,
    atomic::{AtomicBool, Ordering},
};

use dashmap::DashMap;
use log::debug;

use super::{EventCallback, Transport, TransportError, TransportEvent, TransportFactory};
use crate::{config::ServerSrcConfig, message::EdgeMessage};

/// Transport that never touches the network.
#[derive(Default)]
pub struct MemoryTransport {
    info: DashMap<String, String>,
    callback: Mutex<Option<EventCallback>>,
    started: AtomicBool,
    start_failure: Mutex<Option<String>>,
}

impl MemoryTransport {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Make the next `start` fail with `reason`.
    pub fn fail_start(&self, reason: impl Into<String>) {
        *self
            .start_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(reason.into());
    }

    #[must_use]
    pub fn is_started(&self) -> bool { self.started.load(Ordering::Acquire) }

    /// Deliver `message` as a `NewDataReceived` event.
    ///
    /// Returns `false` if the transport is not started or has no callback;
    /// the message is dropped in that case.
    pub fn deliver(&self, message: impl EdgeMessage) -> bool {
        self.emit(TransportEvent::NewDataReceived(Box::new(message)))
    }

    /// Deliver an arbitrary event.
    pub fn emit(&self, event: TransportEvent) -> bool {
        if !self.is_started() {
            debug!("event dropped: transport not started, event={event:?}");
            return false;
        }
        let callback = self
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match callback {
            Some(callback) => {
                callback(event);
                true
            }
            None => false,
        }
    }
}

impl Transport for MemoryTransport {
    fn set_info(&self, key: &str, value: &str) -> Result<(), TransportError> {
        self.info.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn info(&self, key: &str) -> Option<String> { self.info.get(key).map(|v| v.value().clone()) }

    fn set_event_callback(&self, callback: EventCallback) {
        *self.callback.lock().unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    fn start(&self) -> Result<(), TransportError> {
        if let Some(reason) = self
            .start_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            return Err(TransportError::Refused(reason));
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(TransportError::AlreadyStarted);
        }
        Ok(())
    }

    fn stop(&self) {
        self.started.store(false, Ordering::Release);
        self.callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// Factory handing out one shared [`MemoryTransport`].
///
/// Tests keep a clone of [`transport`](Self::transport) to inject messages
/// into the source under test.
#[derive(Clone, Default)]
pub struct MemoryTransportFactory {
    transport: Arc<MemoryTransport>,
}

impl MemoryTransportFactory {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    #[must_use]
    pub fn transport(&self) -> Arc<MemoryTransport> { Arc::clone(&self.transport) }
}

impl TransportFactory for MemoryTransportFactory {
    fn create(&self, _config: &ServerSrcConfig) -> Result<Arc<dyn Transport>, TransportError> {
        let transport: Arc<dyn Transport> = self.transport.clone();
        Ok(transport)
    }
}
