mod common;

use std::time::Duration;

use common::{FakeNode, Step};
use libp2p::{Multiaddr, PeerId};
use peer_identify::{
    config::WorkflowConfig, DhtQueryError, ErrorKind, IdentifyWorkflow, ProgressEvent,
    ProgressQueue, SequenceNumber, SignedPeerRecord, WorkflowEvent,
};
use serde_json::Value;
use tokio::time::Instant;

fn workflow(node: FakeNode) -> IdentifyWorkflow<FakeNode> {
    IdentifyWorkflow::new(node, WorkflowConfig::default())
}

fn drain(queue: &mut ProgressQueue) -> Vec<WorkflowEvent> {
    std::iter::from_fn(|| queue.try_dequeue()).collect()
}

#[tokio::test(start_paused = true)]
async fn address_input_skips_the_dht() {
    let node = FakeNode::new();
    let remote = node.remote_peer_id();
    let workflow = workflow(node);
    let input = format!("/ip4/127.0.0.1/tcp/4001/p2p/{remote}");

    let mut queue = ProgressQueue::new();
    let record = workflow
        .run_identify(&input, &queue.sender())
        .await
        .expect("identify succeeds");

    assert_eq!(record.peer_id, remote.to_string());
    assert_eq!(workflow.node().find_peer_calls(), 0);
    assert_eq!(
        workflow.node().dialed(),
        vec![vec![input.parse::<Multiaddr>().unwrap()]]
    );

    let events = drain(&mut queue);
    assert!(!events
        .iter()
        .any(|event| matches!(event, WorkflowEvent::Searching { .. })));
    assert_eq!(
        events,
        vec![
            WorkflowEvent::Connecting { target: input },
            WorkflowEvent::Handshaking { peer: remote },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn resolved_addresses_get_the_peer_suffix() {
    let node = FakeNode::new();
    let remote = node.remote_peer_id();
    let bare: Multiaddr = "/ip4/1.2.3.4/tcp/4001".parse().unwrap();
    let suffixed: Multiaddr = format!("/ip4/5.6.7.8/tcp/4001/p2p/{remote}").parse().unwrap();
    let node = node.with_lookup(Vec::new(), Ok(vec![bare, suffixed.clone()]));
    let workflow = workflow(node);

    let record = workflow
        .run_identify(&remote.to_string(), &queue_sender())
        .await
        .expect("identify succeeds");

    let expected: Multiaddr = format!("/ip4/1.2.3.4/tcp/4001/p2p/{remote}").parse().unwrap();
    assert_eq!(workflow.node().find_peer_calls(), 1);
    assert_eq!(workflow.node().dialed(), vec![vec![expected, suffixed]]);
    assert_eq!(record.peer_id, remote.to_string());
}

#[tokio::test(start_paused = true)]
async fn sequence_numbers_keep_the_big_integer_marker() {
    let node = FakeNode::new();
    let remote = node.remote_peer_id();
    let node = node.with_response(|response| {
        response.signed_peer_record = Some(SignedPeerRecord {
            seq: SequenceNumber::from(42),
            addresses: vec!["/ip4/198.51.100.1/tcp/4001".parse().unwrap()],
        });
    });
    let workflow = workflow(node);

    let record = workflow
        .run_identify(&format!("/ip4/127.0.0.1/tcp/4001/p2p/{remote}"), &queue_sender())
        .await
        .expect("identify succeeds");

    let value: Value = serde_json::from_str(&record.to_json().unwrap()).unwrap();
    assert_eq!(value["signedPeerRecord"]["seq"], "42n");
    assert_eq!(
        value["signedPeerRecord"]["addresses"][0],
        "/ip4/198.51.100.1/tcp/4001"
    );
}

#[tokio::test(start_paused = true)]
async fn hanging_dial_times_out() {
    let node = FakeNode::new().with_dial_step(Step::Hang);
    let workflow = workflow(node);

    let started = Instant::now();
    let err = workflow
        .run_identify_until(
            "/ip4/127.0.0.1/tcp/4001",
            started + Duration::from_millis(10),
            &queue_sender(),
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::DialTimeout);
    assert!(err.kind().is_timeout());
    assert!(started.elapsed() <= Duration::from_millis(20));
    assert_eq!(workflow.node().identify_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn blank_input_makes_no_network_calls() {
    let workflow = workflow(FakeNode::new());
    let mut queue = ProgressQueue::new();

    for input in ["", "   ", "\t\n"] {
        let err = workflow
            .run_identify(input, &queue.sender())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
    let err = workflow
        .run_identify("not-a-peer-id", &queue.sender())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    let node = workflow.node();
    assert_eq!(node.find_peer_calls(), 0);
    assert_eq!(node.dial_calls(), 0);
    assert_eq!(node.identify_calls(), 0);
    assert!(drain(&mut queue).is_empty());
}

#[tokio::test(start_paused = true)]
async fn input_is_trimmed() {
    let node = FakeNode::new();
    let remote = node.remote_peer_id();
    let workflow = workflow(node);

    let record = workflow
        .run_identify(&format!("  /ip4/127.0.0.1/tcp/4001/p2p/{remote}\n"), &queue_sender())
        .await
        .expect("identify succeeds");
    assert_eq!(record.peer_id, remote.to_string());
}

#[tokio::test(start_paused = true)]
async fn progress_is_reported_in_order() {
    let node = FakeNode::new();
    let remote = node.remote_peer_id();
    let hop = PeerId::random();
    let dht_events = vec![
        ProgressEvent::SendingQuery {
            to: hop,
            query: "FIND_NODE".to_string(),
        },
        ProgressEvent::DialingPeer { peer: hop },
        ProgressEvent::QueryError {
            from: hop,
            code: "ERR_DIAL".to_string(),
            message: "connection refused".to_string(),
        },
        ProgressEvent::Other {
            name: "kad-dht:query:peer-response".to_string(),
        },
    ];
    let node = node.with_lookup(
        dht_events.clone(),
        Ok(vec!["/ip4/1.2.3.4/tcp/4001".parse().unwrap()]),
    );
    let workflow = workflow(node);

    let mut queue = ProgressQueue::new();
    workflow
        .run_identify(&remote.to_string(), &queue.sender())
        .await
        .expect("identify succeeds");

    let mut expected = vec![WorkflowEvent::Searching { peer: remote }];
    expected.extend(dht_events.into_iter().map(WorkflowEvent::Dht));
    expected.push(WorkflowEvent::Connecting {
        target: remote.to_string(),
    });
    expected.push(WorkflowEvent::Handshaking { peer: remote });
    assert_eq!(drain(&mut queue), expected);
}

#[tokio::test(start_paused = true)]
async fn dht_failures_map_to_resolution_errors() {
    let remote = FakeNode::new().remote_peer_id();
    let cases: [(Result<Vec<Multiaddr>, DhtQueryError>, ErrorKind); 4] = [
        (Err(DhtQueryError::NotFound), ErrorKind::ResolutionFailed),
        (Err(DhtQueryError::Timeout), ErrorKind::ResolutionTimeout),
        (
            Err(DhtQueryError::Internal("routing table empty".into())),
            ErrorKind::ResolutionFailed,
        ),
        (Ok(Vec::new()), ErrorKind::ResolutionFailed),
    ];

    for (result, kind) in cases {
        let workflow = workflow(FakeNode::new().with_lookup(Vec::new(), result));
        let err = workflow
            .run_identify(&remote.to_string(), &queue_sender())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), kind);
        assert_eq!(workflow.node().dial_calls(), 0);
    }
}

#[tokio::test(start_paused = true)]
async fn stalled_lookup_times_out_and_keeps_its_progress() {
    let node = FakeNode::new();
    let remote = node.remote_peer_id();
    let hop = PeerId::random();
    let node = node
        .with_lookup(
            vec![ProgressEvent::DialingPeer { peer: hop }],
            Ok(Vec::new()),
        )
        .with_lookup_step(Step::Hang);
    let workflow = workflow(node);

    let mut queue = ProgressQueue::new();
    let err = workflow
        .run_identify_until(
            &remote.to_string(),
            Instant::now() + Duration::from_secs(1),
            &queue.sender(),
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ResolutionTimeout);
    assert_eq!(
        drain(&mut queue),
        vec![
            WorkflowEvent::Searching { peer: remote },
            WorkflowEvent::Dht(ProgressEvent::DialingPeer { peer: hop }),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn resolution_time_counts_against_the_dial() {
    let node = FakeNode::new();
    let remote = node.remote_peer_id();
    let node = node
        .with_lookup(Vec::new(), Ok(vec!["/ip4/1.2.3.4/tcp/4001".parse().unwrap()]))
        .with_lookup_step(Step::Delay(Duration::from_secs(6)))
        .with_dial_step(Step::Delay(Duration::from_secs(5)));
    let workflow = workflow(node);

    let err = workflow
        .run_identify_until(
            &remote.to_string(),
            Instant::now() + Duration::from_secs(10),
            &queue_sender(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DialTimeout);
}

#[tokio::test(start_paused = true)]
async fn dial_errors_carry_the_reason() {
    let node = FakeNode::new().with_dial_step(Step::Fail("connection refused".into()));
    let workflow = workflow(node);

    let err = workflow
        .run_identify("/ip4/127.0.0.1/tcp/4001", &queue_sender())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DialFailed);
    assert!(err.to_string().contains("connection refused"));
}

#[tokio::test(start_paused = true)]
async fn silent_peer_times_out_the_handshake() {
    let node = FakeNode::new().with_identify_step(Step::Hang);
    let workflow = workflow(node);

    let err = workflow
        .run_identify_until(
            "/ip4/127.0.0.1/tcp/4001",
            Instant::now() + Duration::from_secs(2),
            &queue_sender(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::HandshakeTimeout);
    assert_eq!(workflow.node().identify_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn rejected_handshake_fails() {
    let node = FakeNode::new().with_identify_step(Step::Fail("stream reset".into()));
    let workflow = workflow(node);

    let err = workflow
        .run_identify("/ip4/127.0.0.1/tcp/4001", &queue_sender())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::HandshakeFailed);
}

#[tokio::test(start_paused = true)]
async fn response_for_another_peer_is_rejected() {
    let impostor = PeerId::random();
    let node = FakeNode::new().with_response(|response| response.peer_id = impostor);
    let workflow = workflow(node);

    let err = workflow
        .run_identify(
            &format!("/ip4/127.0.0.1/tcp/4001/p2p/{}", PeerId::random()),
            &queue_sender(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::HandshakeFailed);
}

#[tokio::test(start_paused = true)]
async fn missing_public_key_is_left_out_of_the_record() {
    let node = FakeNode::new().with_response(|response| response.public_key = None);
    let workflow = workflow(node);

    let record = workflow
        .run_identify("/ip4/127.0.0.1/tcp/4001", &queue_sender())
        .await
        .expect("identify succeeds");

    let value: Value = serde_json::from_str(&record.to_json().unwrap()).unwrap();
    let object = value.as_object().unwrap();
    assert!(!object.contains_key("publicKey"));
    assert!(!object.contains_key("signedPeerRecord"));
    assert_eq!(object["agentVersion"], "fake-agent/1.0.0");
    assert_eq!(object["observedAddr"], "/ip4/203.0.113.7/tcp/50123");
}

#[tokio::test(start_paused = true)]
async fn public_key_is_multibase_encoded() {
    let node = FakeNode::new();
    let expected = multibase::encode(
        multibase::Base::Base58Btc,
        node.remote.public().encode_protobuf(),
    );
    let workflow = workflow(node);

    let record = workflow
        .run_identify("/ip4/127.0.0.1/tcp/4001", &queue_sender())
        .await
        .expect("identify succeeds");
    assert_eq!(record.public_key.as_deref(), Some(expected.as_str()));
    assert!(expected.starts_with('z'));
}

fn queue_sender() -> peer_identify::WorkflowEventSender {
    peer_identify::WorkflowEventSender::discard()
}
