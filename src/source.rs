//! The server source: lifecycle controller and pull interface.
//!
//! [`ServerSource`] sequences startup (configure the transport, publish to
//! the discovery broker, start listening, wait for a consumer) and then
//! hands out one [`Frame`] per pull. Any startup failure is terminal for the
//! instance; a failed pull only loses the offending message.

use std::{net::SocketAddr, sync::Arc, time::Instant};

use log::{debug, error, info, warn};

use crate::{
    assembler::assemble,
    caps::{Caps, CapsInjector, CapsQuery},
    config::ServerSrcConfig,
    discovery::{Broker, DiscoveryError, DiscoveryRegistration, NodeAddress},
    error::{Result, ServerSrcError},
    frame::Frame,
    message::BoxedMessage,
    metrics,
    queue::MessageQueue,
    registry::{ServerContext, ServerRegistry},
    transport::{INFO_IP, INFO_PORT, INFO_TOPIC, Transport, TransportEvent},
};

#[cfg(test)]
mod tests;

/// Lifecycle states of a [`ServerSource`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceState {
    Created,
    Configuring,
    Discovery,
    Listening,
    Ready,
    Streaming,
    Stopped,
    /// A startup step failed; the instance cannot be restarted.
    Failed,
}

/// Start/pull/stop contract of a pipeline source.
///
/// The host calls `start` once, then `create` from a single thread with at
/// most one call in flight, and finally `stop`.
pub trait PushSource {
    /// Run the startup sequence.
    ///
    /// # Errors
    ///
    /// Returns the error of the first failing startup step.
    fn start(&mut self) -> Result<()>;

    /// Produce the next frame, blocking until one is available.
    ///
    /// # Errors
    ///
    /// Returns a recoverable error when one message could not be turned into
    /// a frame, or [`ServerSrcError::Flushing`] once the source shuts down.
    fn create(&mut self) -> Result<Frame>;

    /// Tear down. Safe to call repeatedly.
    fn stop(&mut self);
}

/// Unblocks a pending pull from another thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    queue: Arc<MessageQueue<BoxedMessage>>,
}

impl ShutdownHandle {
    /// Close the queue; a blocked `create` returns
    /// [`ServerSrcError::Flushing`].
    pub fn shutdown(&self) {
        let drained = self.queue.shutdown();
        if drained > 0 {
            warn!("queued messages destroyed at shutdown: count={drained}");
        }
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool { self.queue.is_closed() }
}

/// Server-side endpoint turning received messages into frames.
pub struct ServerSource {
    config: ServerSrcConfig,
    registry: Arc<ServerRegistry>,
    broker: Option<Arc<dyn Broker>>,
    downstream: Arc<dyn CapsQuery>,
    state: SourceState,
    context: Option<Arc<ServerContext>>,
    transport: Option<Arc<dyn Transport>>,
    registration: Option<DiscoveryRegistration>,
    queue: Arc<MessageQueue<BoxedMessage>>,
    injector: CapsInjector,
    streaming_since: Option<Instant>,
}

impl ServerSource {
    /// Create a source reading its consumer's format from `downstream`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerSrcError::ConfigurationRejected`] if `config` is
    /// invalid.
    pub fn new(
        config: ServerSrcConfig,
        registry: Arc<ServerRegistry>,
        downstream: Arc<dyn CapsQuery>,
    ) -> Result<Self> {
        config
            .validate()
            .inspect_err(|e| warn!("configuration rejected: error={e}"))?;
        Ok(Self {
            config,
            registry,
            broker: None,
            downstream,
            state: SourceState::Created,
            context: None,
            transport: None,
            registration: None,
            queue: Arc::new(MessageQueue::new()),
            injector: CapsInjector::new(),
            streaming_since: None,
        })
    }

    /// Use `broker` for topic registration.
    #[must_use]
    pub fn with_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    #[must_use]
    pub fn config(&self) -> &ServerSrcConfig { &self.config }

    /// Mutable access to the configuration before startup.
    ///
    /// # Errors
    ///
    /// Returns [`ServerSrcError::InvalidState`] once `start` has been
    /// called; the running configuration is read-only.
    pub fn config_mut(&mut self) -> Result<&mut ServerSrcConfig> {
        match self.state {
            SourceState::Created => Ok(&mut self.config),
            state => Err(ServerSrcError::InvalidState(state)),
        }
    }

    #[must_use]
    pub fn state(&self) -> SourceState { self.state }

    /// Address clients are told to dial.
    #[must_use]
    pub fn advertised_address(&self) -> NodeAddress {
        NodeAddress::new(self.config.advertised_host(), self.config.advertised_port())
    }

    /// Whether a discovery registration is currently published.
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.registration
            .as_ref()
            .is_some_and(DiscoveryRegistration::is_published)
    }

    /// Caps adopted from the consumer on the first pull, if they were fixed.
    #[must_use]
    pub fn output_caps(&self) -> Option<&Caps> { self.injector.output_caps() }

    /// Whether the capability handshake has run.
    #[must_use]
    pub fn is_configured(&self) -> bool { self.injector.is_configured() }

    /// Transport acquired during startup.
    #[must_use]
    pub fn transport(&self) -> Option<Arc<dyn Transport>> { self.transport.clone() }

    /// Address the transport is bound to, once listening.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.as_ref().and_then(|t| t.local_addr())
    }

    /// Number of received messages waiting for a pull.
    #[must_use]
    pub fn pending(&self) -> usize { self.queue.len() }

    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            queue: Arc::clone(&self.queue),
        }
    }

    fn server_id(&self) -> String { self.config.id().to_string() }

    fn run_startup(&mut self) -> Result<()> {
        self.state = SourceState::Configuring;
        let id = self.server_id();
        let context = self
            .registry
            .get_or_create(&id, &self.config)
            .map_err(ServerSrcError::TransportStart)?;
        let transport = context.transport();
        self.context = Some(Arc::clone(&context));
        self.transport = Some(Arc::clone(&transport));
        transport
            .set_info(INFO_IP, self.config.host())
            .and_then(|()| transport.set_info(INFO_PORT, &self.config.port().to_string()))
            .map_err(ServerSrcError::TransportStart)?;

        if let Some(topic) = self.config.topic().map(str::to_owned) {
            self.state = SourceState::Discovery;
            self.register(topic, transport.as_ref())?;
        } else {
            info!(
                "discovery disabled: server_id={id}, advertised={}",
                self.advertised_address()
            );
        }

        self.state = SourceState::Listening;
        let queue = Arc::clone(&self.queue);
        transport.set_event_callback(Arc::new(move |event| match event {
            TransportEvent::NewDataReceived(message) => {
                if queue.enqueue(message).is_err() {
                    debug!("message received after shutdown");
                }
            }
            other => debug!("transport event ignored: event={other:?}"),
        }));
        transport.start().map_err(ServerSrcError::TransportStart)?;
        info!(
            "server listening: server_id={id}, host={}, port={}",
            self.config.host(),
            transport
                .info(INFO_PORT)
                .unwrap_or_else(|| self.config.port().to_string())
        );

        self.state = SourceState::Ready;
        let timeout = self.config.ready_timeout();
        if !context.wait_for_consumer(timeout) {
            return Err(ServerSrcError::ReadinessTimeout {
                id,
                waited_ms: timeout.as_millis(),
            });
        }
        Ok(())
    }

    fn register(&mut self, topic: String, transport: &dyn Transport) -> Result<()> {
        let broker = self.broker.clone().ok_or(DiscoveryError::NoBroker)?;
        transport
            .set_info(INFO_TOPIC, &topic)
            .map_err(ServerSrcError::TransportStart)?;
        let mut registration = DiscoveryRegistration::new(topic, broker);
        registration.set_node(self.advertised_address());
        registration.set_broker(NodeAddress::new(
            self.config.broker_host(),
            self.config.broker_port(),
        ));
        registration.publish()?;
        self.registration = Some(registration);
        Ok(())
    }

    fn release(&mut self) {
        let drained = self.queue.shutdown();
        if drained > 0 {
            warn!("queued messages destroyed at stop: count={drained}");
        }
        if let Some(transport) = self.transport.take() {
            transport.stop();
        }
        if let Some(context) = self.context.take() {
            self.registry.remove(context.id());
        }
        if let Some(mut registration) = self.registration.take() {
            registration.withdraw();
        }
    }
}

impl PushSource for ServerSource {
    fn start(&mut self) -> Result<()> {
        if self.state != SourceState::Created {
            return Err(ServerSrcError::InvalidState(self.state));
        }
        match self.run_startup() {
            Ok(()) => {
                self.state = SourceState::Streaming;
                self.streaming_since = Some(Instant::now());
                info!("server source streaming: server_id={}", self.server_id());
                Ok(())
            }
            Err(e) => {
                error!(
                    "server source startup failed: server_id={}, state={:?}, error={e}",
                    self.server_id(),
                    self.state
                );
                self.release();
                self.state = SourceState::Failed;
                Err(e)
            }
        }
    }

    fn create(&mut self) -> Result<Frame> {
        if self.state != SourceState::Streaming {
            return Err(ServerSrcError::InvalidState(self.state));
        }
        let Some(transport) = self.transport.as_deref() else {
            return Err(ServerSrcError::InvalidState(self.state));
        };
        if !self.injector.is_configured() {
            self.injector
                .inject(self.downstream.as_ref(), transport)
                .map_err(|e| {
                    error!("caps relay failed: error={e}");
                    ServerSrcError::CapsRelay(e)
                })?;
        }

        let message = self.queue.dequeue().map_err(|_| ServerSrcError::Flushing)?;
        let mut frame = assemble(message).inspect_err(|_| metrics::inc_assembly_errors())?;
        if let Some(since) = self.streaming_since.filter(|_| self.config.is_live()) {
            frame.set_pts(since.elapsed());
        }
        metrics::inc_frames();
        Ok(frame)
    }

    fn stop(&mut self) {
        if matches!(self.state, SourceState::Stopped | SourceState::Failed) {
            return;
        }
        self.release();
        self.state = SourceState::Stopped;
        info!("server source stopped: server_id={}", self.server_id());
    }
}

impl Drop for ServerSource {
    fn drop(&mut self) { self.stop(); }
}
