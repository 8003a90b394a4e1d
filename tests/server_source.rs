//! Behavioural tests for the server source over the in-memory transport.

mod common;

use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use proptest::prelude::*;
use rstest::rstest;
use tensor_query::{
    Broker,
    Caps,
    CapsStructure,
    CapsValue,
    DiscoveryError,
    InMemoryBroker,
    NodeAddress,
    PushSource,
    SERVER_CAPS_DELIMITER,
    ServerSrcError,
    SourceState,
    Transport,
    transport::INFO_CAPS,
};
use tensor_query_testing::{MemoryServer, memory_server, tagged_message, untagged_message};

fn tensor_caps() -> Caps {
    Caps::new(
        CapsStructure::new("other/tensors")
            .field("format", CapsValue::Str("static".into()))
            .field("num_tensors", CapsValue::Int(2)),
    )
}

#[rstest]
fn interleaved_clients_are_pulled_in_order(memory_server: MemoryServer) {
    let config = memory_server.config();
    let _guard = memory_server.attach_consumer(&config);
    let mut source = memory_server.source(config, Caps::Any);
    source.start().expect("startup succeeds");

    let transport = memory_server.transport();
    assert!(transport.deliver(tagged_message(10, &[b"from ten"])));
    assert!(transport.deliver(tagged_message(20, &[b"from twenty"])));

    let ids: Vec<u64> = (0..2)
        .map(|_| source.create().expect("frame").client_id().as_u64())
        .collect();
    assert_eq!(ids, vec![10, 20]);
}

#[rstest]
fn unidentified_message_does_not_poison_source(memory_server: MemoryServer) {
    let config = memory_server.config();
    let _guard = memory_server.attach_consumer(&config);
    let mut source = memory_server.source(config, Caps::Any);
    source.start().expect("startup succeeds");

    let transport = memory_server.transport();
    assert!(transport.deliver(untagged_message(&[b"a", b"b"])));
    assert!(transport.deliver(tagged_message(3, &[b"c"])));

    assert!(matches!(
        source.create(),
        Err(ServerSrcError::FrameAssembly(_))
    ));
    assert_eq!(source.state(), SourceState::Streaming);
    let frame = source.create().expect("frame after failure");
    assert_eq!(frame.client_id().as_u64(), 3);
    assert_eq!(frame.segments()[0].as_ref(), b"c");
}

#[rstest]
#[case(None)]
#[case(Some("client-caps"))]
fn caps_value_reflects_first_pull_only(memory_server: MemoryServer, #[case] initial: Option<&str>) {
    let config = memory_server.config();
    let _guard = memory_server.attach_consumer(&config);
    let transport = memory_server.transport();
    if let Some(initial) = initial {
        transport.set_info(INFO_CAPS, initial).expect("set caps");
    }
    let mut source = memory_server.source(config, tensor_caps());
    source.start().expect("startup succeeds");

    for id in 0..5 {
        assert!(transport.deliver(tagged_message(id, &[b"x"])));
        source.create().expect("frame");
    }

    let expected = format!(
        "{}{SERVER_CAPS_DELIMITER}{}",
        initial.unwrap_or_default(),
        tensor_caps()
    );
    assert_eq!(transport.info(INFO_CAPS), Some(expected));
    assert_eq!(source.output_caps(), Some(&tensor_caps()));
}

#[rstest]
fn no_topic_never_contacts_broker(memory_server: MemoryServer) {
    let mut config = memory_server.config();
    config.set_host("0.0.0.0").expect("valid host");
    config.set_port(0);
    config.set_topic("");
    let _guard = memory_server.attach_consumer(&config);
    let broker = Arc::new(InMemoryBroker::new());
    let shared: Arc<dyn Broker> = broker.clone();
    let mut source = memory_server.source(config, Caps::Any).with_broker(shared);

    source.start().expect("startup succeeds");

    assert_eq!(broker.publish_count(), 0);
    assert_eq!(source.advertised_address(), NodeAddress::new("0.0.0.0", 0));
    assert!(!source.is_registered());
}

#[rstest]
fn unreachable_broker_keeps_transport_down(memory_server: MemoryServer) {
    let mut config = memory_server.config();
    config.set_topic("segmentation");
    config.set_broker(Some("broker.invalid".into()), Some(1883));
    let _guard = memory_server.attach_consumer(&config);
    let broker = Arc::new(InMemoryBroker::new());
    broker.fail_with(Some(DiscoveryError::Unreachable {
        broker: NodeAddress::new("broker.invalid", 1883),
        reason: "no route to host".into(),
    }));
    let shared: Arc<dyn Broker> = broker.clone();
    let mut source = memory_server.source(config, Caps::Any).with_broker(shared);

    let err = source.start().expect_err("startup fails");

    assert!(matches!(err, ServerSrcError::Discovery(_)));
    assert!(!err.is_recoverable());
    assert_eq!(broker.publish_count(), 1);
    assert!(!memory_server.transport().is_started());
    assert!(!memory_server.transport().deliver(tagged_message(1, &[b"x"])));
}

#[rstest]
fn teardown_releases_blocked_pull(memory_server: MemoryServer) {
    let config = memory_server.config();
    let _guard = memory_server.attach_consumer(&config);
    let mut source = memory_server.source(config, Caps::Any);
    source.start().expect("startup succeeds");
    let handle = source.shutdown_handle();

    let started = Instant::now();
    let puller = thread::spawn(move || source.create().map(|_| ()));
    thread::sleep(Duration::from_millis(30));
    handle.shutdown();
    let result = puller.join().expect("puller thread");

    assert!(matches!(result, Err(ServerSrcError::Flushing)));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[rstest]
fn two_instances_use_separate_contexts(memory_server: MemoryServer) {
    let mut first = memory_server.config();
    first.set_id(1);
    let mut second = memory_server.config();
    second.set_id(2);
    let _g1 = memory_server.attach_consumer(&first);

    let mut source = memory_server.source(second, Caps::Any);
    let err = source.start().expect_err("second id has no consumer");
    assert!(matches!(err, ServerSrcError::ReadinessTimeout { ref id, .. } if id == "2"));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn frames_match_messages_in_order(
        messages in prop::collection::vec(
            (any::<u64>(), prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 0..4)),
            0..16,
        )
    ) {
        let server = MemoryServer::new();
        let config = server.config();
        let _guard = server.attach_consumer(&config);
        let mut source = server.source(config, Caps::Any);
        source.start().expect("startup succeeds");

        let transport = server.transport();
        for (client_id, segments) in &messages {
            let segments: Vec<&[u8]> = segments.iter().map(Vec::as_slice).collect();
            prop_assert!(transport.deliver(tagged_message(*client_id, &segments)));
        }

        for (client_id, segments) in &messages {
            let frame = source.create().expect("frame");
            prop_assert_eq!(frame.client_id().as_u64(), *client_id);
            let payloads: Vec<&[u8]> = frame.segments().iter().map(AsRef::as_ref).collect();
            let expected: Vec<&[u8]> = segments.iter().map(Vec::as_slice).collect();
            prop_assert_eq!(payloads, expected);
        }
        prop_assert_eq!(source.pending(), 0);
    }
}
