//! Passive consumer that reads frames and attaches to a server context.

use std::sync::{
    Arc,
    Mutex,
    PoisonError,
    atomic::{AtomicU64, Ordering},
};

use log::{debug, info};

use crate::{
    caps::{Caps, CapsQuery},
    config::ServerSrcConfig,
    frame::Frame,
    registry::{ConsumerGuard, ServerRegistry},
    transport::TransportError,
};


/// Downstream consumer for a [`ServerSource`](crate::source::ServerSource).
///
/// The sink accepts the caps it was built with, counts rendered frames and,
/// unless silenced, logs each frame's segment sizes.
pub struct TensorSink {
    caps: Caps,
    silent: bool,
    rendered: AtomicU64,
    guard: Mutex<Option<ConsumerGuard>>,
}

impl Default for TensorSink {
    fn default() -> Self { Self::new(Caps::Any) }
}

impl TensorSink {
    #[must_use]
    pub fn new(caps: Caps) -> Self {
        Self {
            caps,
            silent: false,
            rendered: AtomicU64::new(0),
            guard: Mutex::new(None),
        }
    }

    /// Suppress per-frame logging.
    #[must_use]
    pub fn silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    /// Attach to the server context for `config`'s instance id.
    ///
    /// The context is created if the source has not done so yet. Attaching
    /// twice keeps the first attachment.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the context's transport cannot be
    /// created.
    pub fn attach(
        &self,
        registry: &ServerRegistry,
        config: &ServerSrcConfig,
    ) -> Result<(), TransportError> {
        let mut slot = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Ok(());
        }
        let context = registry.get_or_create(&config.id().to_string(), config)?;
        *slot = Some(context.attach_consumer());
        info!("sink attached: server_id={}", context.id());
        Ok(())
    }

    /// Release the attachment, if any.
    pub fn detach(&self) {
        if let Some(guard) = self
            .guard
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            info!("sink detached: server_id={}", guard.context().id());
        }
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.guard
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Consume one frame.
    pub fn render(&self, frame: &Frame) {
        let count = self.rendered.fetch_add(1, Ordering::Relaxed) + 1;
        if self.silent {
            return;
        }
        let sizes: Vec<usize> = frame.segments().iter().map(bytes::Bytes::len).collect();
        debug!(
            "frame rendered: n={count}, client_id={}, segments={sizes:?}, pts={:?}",
            frame.client_id().as_u64(),
            frame.pts()
        );
    }

    /// Number of frames rendered so far.
    #[must_use]
    pub fn rendered(&self) -> u64 { self.rendered.load(Ordering::Relaxed) }
}

impl CapsQuery for TensorSink {
    fn query_caps(&self) -> Caps { self.caps.clone() }
}
