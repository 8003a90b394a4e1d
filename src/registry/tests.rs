//! Tests for the server context registry.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use rstest::{fixture, rstest};

use super::ServerRegistry;
use crate::{
    config::{Protocol, ServerSrcConfig},
    transport::{MemoryTransport, MemoryTransportFactory, Transport, TransportError},
};

type FactoryResult = Result<Arc<dyn Transport>, TransportError>;

#[expect(
    unused_braces,
    reason = "rustc false positive for single-line rstest fixtures"
)]
#[fixture]
fn registry() -> ServerRegistry { ServerRegistry::new(MemoryTransportFactory::default()) }

#[rstest]
fn same_id_shares_context(registry: ServerRegistry) {
    let config = ServerSrcConfig::default();
    let first = registry.get_or_create("0", &config).expect("context");
    let second = registry.get_or_create("0", &config).expect("context");
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(registry.len(), 1);
}

#[test]
fn factory_runs_once_per_id() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let registry = ServerRegistry::new(move |_: &ServerSrcConfig| -> FactoryResult {
        counter.fetch_add(1, Ordering::SeqCst);
        let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
        Ok(transport)
    });
    let config = ServerSrcConfig::default();
    for id in ["1", "2", "1", "2", "1"] {
        registry.get_or_create(id, &config).expect("context");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn factory_error_leaves_no_entry() {
    let registry = ServerRegistry::new(|config: &ServerSrcConfig| -> FactoryResult {
        Err(TransportError::UnsupportedProtocol(config.protocol()))
    });
    let mut config = ServerSrcConfig::default();
    config.set_protocol(Protocol::Mqtt);
    let err = registry.get_or_create("7", &config).err();
    assert!(matches!(
        err,
        Some(TransportError::UnsupportedProtocol(Protocol::Mqtt))
    ));
    assert!(registry.is_empty());
}

#[rstest]
fn remove_drops_entry(registry: ServerRegistry) {
    let config = ServerSrcConfig::default();
    let context = registry.get_or_create("3", &config).expect("context");
    let removed = registry.remove("3").expect("entry present");
    assert!(Arc::ptr_eq(&context, &removed));
    assert!(registry.get("3").is_none());
}

#[rstest]
fn wait_times_out_without_consumer(registry: ServerRegistry) {
    let context = registry
        .get_or_create("0", &ServerSrcConfig::default())
        .expect("context");
    assert!(!context.wait_for_consumer(Duration::from_millis(20)));
}

#[rstest]
fn guard_tracks_attachment(registry: ServerRegistry) {
    let context = registry
        .get_or_create("0", &ServerSrcConfig::default())
        .expect("context");
    let guard = context.attach_consumer();
    assert_eq!(context.consumer_count(), 1);
    assert!(context.wait_for_consumer(Duration::ZERO));
    drop(guard);
    assert_eq!(context.consumer_count(), 0);
}

#[rstest]
fn attach_wakes_waiter(registry: ServerRegistry) {
    let context = registry
        .get_or_create("0", &ServerSrcConfig::default())
        .expect("context");
    let attacher = Arc::clone(&context);
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        attacher.attach_consumer()
    });
    assert!(context.wait_for_consumer(Duration::from_secs(5)));
    let _guard = handle.join().expect("attacher thread");
}
