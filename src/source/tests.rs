//! Tests for the server source lifecycle and pull path.

use std::{
    sync::Arc,
    thread,
    time::Duration,
};

use rstest::{fixture, rstest};

use super::{PushSource, ServerSource, SourceState};
use crate::{
    caps::{Caps, CapsStructure, CapsValue, SERVER_CAPS_DELIMITER},
    config::ServerSrcConfig,
    discovery::{Broker, DiscoveryError, InMemoryBroker, NodeAddress},
    error::ServerSrcError,
    message::{CLIENT_ID_KEY, EdgeData},
    registry::{ConsumerGuard, ServerRegistry},
    transport::{
        INFO_CAPS,
        INFO_IP,
        INFO_PORT,
        INFO_TOPIC,
        MemoryTransport,
        MemoryTransportFactory,
        Transport,
    },
};

struct Harness {
    registry: Arc<ServerRegistry>,
    transport: Arc<MemoryTransport>,
    broker: Arc<InMemoryBroker>,
}

impl Harness {
    fn source(&self, config: ServerSrcConfig, downstream: Caps) -> ServerSource {
        let broker: Arc<dyn Broker> = self.broker.clone();
        ServerSource::new(config, Arc::clone(&self.registry), Arc::new(downstream))
            .expect("valid config")
            .with_broker(broker)
    }

    fn attach(&self, config: &ServerSrcConfig) -> ConsumerGuard {
        self.registry
            .get_or_create(&config.id().to_string(), config)
            .expect("context")
            .attach_consumer()
    }

    fn deliver(&self, client_id: u64, payload: &'static [u8]) {
        let message = EdgeData::new()
            .with_segment(payload)
            .with_info(CLIENT_ID_KEY, client_id.to_string());
        assert!(self.transport.deliver(message), "transport accepts message");
    }
}

#[fixture]
fn harness() -> Harness {
    let factory = MemoryTransportFactory::new();
    let transport = factory.transport();
    Harness {
        registry: Arc::new(ServerRegistry::new(factory)),
        transport,
        broker: Arc::new(InMemoryBroker::new()),
    }
}

fn quick_config() -> ServerSrcConfig {
    let mut config = ServerSrcConfig::default();
    config.set_ready_timeout(Duration::from_millis(50));
    config
}

fn fixed_caps() -> Caps {
    Caps::new(
        CapsStructure::new("other/tensors")
            .field("num_tensors", CapsValue::Int(1))
            .field("framerate", CapsValue::Fraction(30, 1)),
    )
}

#[rstest]
fn start_without_topic_skips_discovery(harness: Harness) {
    let config = quick_config();
    let _guard = harness.attach(&config);
    let mut source = harness.source(config, Caps::Any);

    source.start().expect("startup succeeds");

    assert_eq!(source.state(), SourceState::Streaming);
    assert_eq!(harness.broker.publish_count(), 0);
    assert!(!source.is_registered());
    assert_eq!(source.advertised_address(), NodeAddress::new("localhost", 3001));
    assert_eq!(harness.transport.info(INFO_IP).as_deref(), Some("localhost"));
    assert_eq!(harness.transport.info(INFO_PORT).as_deref(), Some("3001"));
    assert!(harness.transport.info(INFO_TOPIC).is_none());
    assert!(harness.transport.is_started());
}

#[rstest]
fn any_address_with_empty_topic_starts(harness: Harness) {
    let mut config = ServerSrcConfig::new("0.0.0.0", 0).expect("valid");
    config.set_topic("");
    config.set_ready_timeout(Duration::from_millis(50));
    let _guard = harness.attach(&config);
    let mut source = harness.source(config, Caps::Any);

    source.start().expect("startup succeeds");

    assert_eq!(source.advertised_address(), NodeAddress::new("0.0.0.0", 0));
    assert_eq!(harness.broker.publish_count(), 0);
}

#[rstest]
fn topic_publishes_advertised_address(harness: Harness) {
    let mut config = quick_config();
    config.set_topic("object_detection");
    config.set_advertised(Some("203.0.113.7".into()), Some(4000));
    let _guard = harness.attach(&config);
    let mut source = harness.source(config, Caps::Any);

    source.start().expect("startup succeeds");

    assert!(source.is_registered());
    assert_eq!(
        harness.broker.lookup("object_detection"),
        vec![NodeAddress::new("203.0.113.7", 4000)]
    );
    assert_eq!(
        harness.transport.info(INFO_TOPIC).as_deref(),
        Some("object_detection")
    );

    source.stop();
    assert!(harness.broker.lookup("object_detection").is_empty());
}

#[rstest]
fn broker_failure_prevents_listening(harness: Harness) {
    let mut config = quick_config();
    config.set_topic("object_detection");
    let _guard = harness.attach(&config);
    harness.broker.fail_with(Some(DiscoveryError::Rejected {
        topic: "object_detection".into(),
        reason: "quota".into(),
    }));
    let mut source = harness.source(config, Caps::Any);

    let err = source.start().expect_err("startup fails");

    assert!(matches!(err, ServerSrcError::Discovery(DiscoveryError::Rejected { .. })));
    assert_eq!(source.state(), SourceState::Failed);
    assert!(!harness.transport.is_started());
    assert!(!harness.transport.deliver(EdgeData::new()));
}

#[rstest]
fn topic_without_broker_is_rejected(harness: Harness) {
    let mut config = quick_config();
    config.set_topic("object_detection");
    let mut source =
        ServerSource::new(config, Arc::clone(&harness.registry), Arc::new(Caps::Any))
            .expect("valid config");

    let err = source.start().expect_err("startup fails");
    assert!(matches!(err, ServerSrcError::Discovery(DiscoveryError::NoBroker)));
    assert!(!harness.transport.is_started());
}

#[rstest]
fn transport_start_failure_is_fatal(harness: Harness) {
    let config = quick_config();
    let _guard = harness.attach(&config);
    harness.transport.fail_start("address in use");
    let mut source = harness.source(config, Caps::Any);

    let err = source.start().expect_err("startup fails");

    assert!(matches!(err, ServerSrcError::TransportStart(_)));
    assert_eq!(source.state(), SourceState::Failed);
    assert!(matches!(
        source.create(),
        Err(ServerSrcError::InvalidState(SourceState::Failed))
    ));
}

#[rstest]
fn missing_consumer_times_out(harness: Harness) {
    let mut source = harness.source(quick_config(), Caps::Any);

    let err = source.start().expect_err("startup fails");

    assert!(matches!(err, ServerSrcError::ReadinessTimeout { ref id, .. } if id == "0"));
    assert!(!harness.transport.is_started(), "transport released on failure");
}

#[rstest]
fn late_consumer_unblocks_ready(harness: Harness) {
    let mut config = quick_config();
    config.set_ready_timeout(Duration::from_secs(5));
    let context = harness
        .registry
        .get_or_create("0", &config)
        .expect("context");
    let attacher = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        context.attach_consumer()
    });
    let mut source = harness.source(config, Caps::Any);

    source.start().expect("startup succeeds");
    let _guard = attacher.join().expect("attacher thread");
}

#[rstest]
fn pull_before_start_is_invalid(harness: Harness) {
    let mut source = harness.source(quick_config(), Caps::Any);
    assert!(matches!(
        source.create(),
        Err(ServerSrcError::InvalidState(SourceState::Created))
    ));
}

#[rstest]
fn start_twice_is_invalid(harness: Harness) {
    let config = quick_config();
    let _guard = harness.attach(&config);
    let mut source = harness.source(config, Caps::Any);
    source.start().expect("startup succeeds");
    assert!(matches!(
        source.start(),
        Err(ServerSrcError::InvalidState(SourceState::Streaming))
    ));
}

#[rstest]
fn config_is_read_only_after_start(harness: Harness) {
    let config = quick_config();
    let _guard = harness.attach(&config);
    let mut source = harness.source(config, Caps::Any);
    source.config_mut().expect("editable").set_port(4000);
    source.start().expect("startup succeeds");
    assert!(source.config_mut().is_err());
    assert_eq!(source.config().port(), 4000);
}

#[rstest]
fn frames_follow_arrival_order(harness: Harness) {
    let config = quick_config();
    let _guard = harness.attach(&config);
    let mut source = harness.source(config, Caps::Any);
    source.start().expect("startup succeeds");

    harness.deliver(10, b"first");
    harness.deliver(20, b"second");

    let first = source.create().expect("frame");
    let second = source.create().expect("frame");
    assert_eq!(first.client_id().as_u64(), 10);
    assert_eq!(first.segments()[0].as_ref(), b"first");
    assert_eq!(second.client_id().as_u64(), 20);
    assert_eq!(second.segments()[0].as_ref(), b"second");
}

#[rstest]
fn missing_client_id_fails_one_pull(harness: Harness) {
    let config = quick_config();
    let _guard = harness.attach(&config);
    let mut source = harness.source(config, Caps::Any);
    source.start().expect("startup succeeds");

    assert!(harness.transport.deliver(EdgeData::new().with_segment(&b"orphan"[..])));
    harness.deliver(7, b"ok");

    let err = source.create().expect_err("assembly fails");
    assert!(err.is_recoverable());
    assert!(matches!(err, ServerSrcError::FrameAssembly(_)));
    let frame = source.create().expect("next pull succeeds");
    assert_eq!(frame.client_id().as_u64(), 7);
}

#[rstest]
fn caps_are_injected_once(harness: Harness) {
    let config = quick_config();
    let _guard = harness.attach(&config);
    harness
        .transport
        .set_info(INFO_CAPS, "client-caps")
        .expect("set caps");
    let mut source = harness.source(config, fixed_caps());
    source.start().expect("startup succeeds");

    for id in 1..=3 {
        harness.deliver(id, b"x");
        source.create().expect("frame");
    }

    let expected = format!("client-caps{SERVER_CAPS_DELIMITER}{}", fixed_caps());
    assert_eq!(harness.transport.info(INFO_CAPS), Some(expected));
    assert!(source.is_configured());
    assert_eq!(source.output_caps(), Some(&fixed_caps()));
}

#[rstest]
fn unfixed_caps_are_relayed_but_not_adopted(harness: Harness) {
    let config = quick_config();
    let _guard = harness.attach(&config);
    let mut source = harness.source(config, Caps::Any);
    source.start().expect("startup succeeds");

    harness.deliver(1, b"x");
    source.create().expect("frame");

    assert_eq!(
        harness.transport.info(INFO_CAPS),
        Some(format!("{SERVER_CAPS_DELIMITER}ANY"))
    );
    assert!(source.output_caps().is_none());
}

#[rstest]
#[case(true)]
#[case(false)]
fn live_sources_stamp_frames(harness: Harness, #[case] live: bool) {
    let mut config = quick_config();
    config.set_live(live);
    let _guard = harness.attach(&config);
    let mut source = harness.source(config, Caps::Any);
    source.start().expect("startup succeeds");

    harness.deliver(1, b"x");
    let frame = source.create().expect("frame");
    assert_eq!(frame.pts().is_some(), live);
}

#[rstest]
fn shutdown_unblocks_pending_pull(harness: Harness) {
    let config = quick_config();
    let _guard = harness.attach(&config);
    let mut source = harness.source(config, Caps::Any);
    source.start().expect("startup succeeds");
    let handle = source.shutdown_handle();

    let puller = thread::spawn(move || {
        let result = source.create();
        (source, result)
    });
    thread::sleep(Duration::from_millis(20));
    handle.shutdown();

    let (mut source, result) = puller.join().expect("puller thread");
    assert!(matches!(result, Err(ServerSrcError::Flushing)));
    assert!(handle.is_shutdown());
    source.stop();
    assert_eq!(source.state(), SourceState::Stopped);
}

#[rstest]
fn stop_drains_and_releases(harness: Harness) {
    let config = quick_config();
    let _guard = harness.attach(&config);
    let mut source = harness.source(config, Caps::Any);
    source.start().expect("startup succeeds");
    harness.deliver(1, b"a");
    harness.deliver(2, b"b");
    assert_eq!(source.pending(), 2);

    source.stop();
    source.stop();

    assert_eq!(source.pending(), 0);
    assert_eq!(source.state(), SourceState::Stopped);
    assert!(!harness.transport.is_started());
    assert!(harness.registry.get("0").is_none());
}
