//! Registration of a server with a discovery broker.
//!
//! When a topic is configured, the source publishes `(topic, node address)`
//! before its transport starts so clients can locate it by topic. The node
//! address is what clients should dial; it may differ from the listen
//! address behind NAT or on multi-homed hosts.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use dashmap::DashMap;
use log::{info, warn};
use thiserror::Error;


/// Errors raised by broker operations.
#[non_exhaustive]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    /// The broker could not be reached.
    #[error("broker {broker} unreachable: {reason}")]
    Unreachable {
        /// Broker address.
        broker: NodeAddress,
        /// Transport-level reason.
        reason: String,
    },
    /// The broker refused the publication.
    #[error("broker rejected topic {topic:?}: {reason}")]
    Rejected {
        /// Topic that was refused.
        topic: String,
        /// Broker-supplied reason.
        reason: String,
    },
    /// No broker address was set before publishing.
    #[error("no broker configured")]
    NoBroker,
}

/// Host and port pair.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Directory service mapping topics to node addresses.
pub trait Broker: Send + Sync {
    /// Announce `node` under `topic` on the broker at `broker`.
    ///
    /// # Errors
    ///
    /// Returns a [`DiscoveryError`] if the broker is unreachable or refuses.
    fn publish(
        &self,
        broker: &NodeAddress,
        topic: &str,
        node: &NodeAddress,
    ) -> Result<(), DiscoveryError>;

    /// Withdraw a previous announcement. Best effort.
    fn unpublish(&self, broker: &NodeAddress, topic: &str, node: &NodeAddress);
}

/// Registration state for one server instance.
pub struct DiscoveryRegistration {
    topic: String,
    broker_addr: Option<NodeAddress>,
    node: Option<NodeAddress>,
    broker: Arc<dyn Broker>,
    published: bool,
}

impl DiscoveryRegistration {
    #[must_use]
    pub fn new(topic: impl Into<String>, broker: Arc<dyn Broker>) -> Self {
        Self {
            topic: topic.into(),
            broker_addr: None,
            node: None,
            broker,
            published: false,
        }
    }

    /// Set the address clients should dial.
    pub fn set_node(&mut self, node: NodeAddress) { self.node = Some(node); }

    /// Set the broker to publish to.
    pub fn set_broker(&mut self, broker: NodeAddress) { self.broker_addr = Some(broker); }

    #[must_use]
    pub fn topic(&self) -> &str { &self.topic }

    #[must_use]
    pub fn node(&self) -> Option<&NodeAddress> { self.node.as_ref() }

    #[must_use]
    pub fn is_published(&self) -> bool { self.published }

    /// Publish `(topic, node)` to the broker. No retry is attempted.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::NoBroker`] if the broker or node address is
    /// unset, or the broker's own error.
    pub fn publish(&mut self) -> Result<(), DiscoveryError> {
        let (Some(broker), Some(node)) = (&self.broker_addr, &self.node) else {
            return Err(DiscoveryError::NoBroker);
        };
        self.broker.publish(broker, &self.topic, node)?;
        self.published = true;
        info!("published topic: topic={}, node={node}, broker={broker}", self.topic);
        Ok(())
    }

    /// Withdraw the announcement if it was published.
    pub fn withdraw(&mut self) {
        if !self.published {
            return;
        }
        if let (Some(broker), Some(node)) = (&self.broker_addr, &self.node) {
            self.broker.unpublish(broker, &self.topic, node);
            info!("withdrew topic: topic={}, node={node}", self.topic);
        }
        self.published = false;
    }
}

impl Drop for DiscoveryRegistration {
    fn drop(&mut self) { self.withdraw(); }
}

/// Broker kept in process memory.
///
/// Entries are keyed by topic; the broker address passed to
/// [`Broker::publish`] is recorded but not dialled.
#[derive(Default)]
pub struct InMemoryBroker {
    topics: DashMap<String, Vec<NodeAddress>>,
    failure: std::sync::Mutex<Option<DiscoveryError>>,
    publish_attempts: AtomicUsize,
}

impl InMemoryBroker {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Make every publish fail with `error` until cleared.
    pub fn fail_with(&self, error: Option<DiscoveryError>) {
        *self
            .failure
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = error;
    }

    /// Number of publish calls received, failed ones included.
    #[must_use]
    pub fn publish_count(&self) -> usize { self.publish_attempts.load(Ordering::SeqCst) }

    /// Nodes currently announced under `topic`.
    #[must_use]
    pub fn lookup(&self, topic: &str) -> Vec<NodeAddress> {
        self.topics
            .get(topic)
            .map(|nodes| nodes.value().clone())
            .unwrap_or_default()
    }
}

impl Broker for InMemoryBroker {
    fn publish(
        &self,
        broker: &NodeAddress,
        topic: &str,
        node: &NodeAddress,
    ) -> Result<(), DiscoveryError> {
        self.publish_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self
            .failure
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
        {
            warn!("broker publish failed: broker={broker}, topic={topic}, error={error}");
            return Err(error);
        }
        let mut nodes = self.topics.entry(topic.to_owned()).or_default();
        if !nodes.contains(node) {
            nodes.push(node.clone());
        }
        Ok(())
    }

    fn unpublish(&self, _broker: &NodeAddress, topic: &str, node: &NodeAddress) {
        let now_empty = match self.topics.get_mut(topic) {
            Some(mut nodes) => {
                nodes.retain(|n| n != node);
                nodes.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.topics.remove_if(topic, |_, nodes| nodes.is_empty());
        }
    }
}
