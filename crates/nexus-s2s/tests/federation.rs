// ============================================================================
// Federation integration tests
// ============================================================================
//
// Two or more routers talking over the in-memory network: dialback in both
// directions, verification timeouts, unknown hosts, pooling and ordering.
//
// ============================================================================

mod common;

use std::time::Duration;

use common::{MemoryNetwork, body, config, message};
use nexus_s2s::protocol::{self, NS_STANZAS, StreamErrorCondition, StreamHeader};
use nexus_s2s::session::Direction;
use nexus_s2s::transport::{MemoryTransport, Transport};
use nexus_s2s::xml::InboundEvent;
use nexus_common::config::TlsMode;
use nexus_s2s::{Cid, Element, FaultKind, Priority, RouterConfig, RouterEvent, S2sError, SendStatus};

/// No StartTLS offered or requested.
fn plain(domain: &str) -> RouterConfig {
    let mut cfg = config(domain);
    cfg.tls_mode = TlsMode::Disabled;
    cfg
}

async fn read(peer: &mut MemoryTransport) -> Option<InboundEvent> {
    tokio::time::timeout(common::WAIT, peer.read_event()).await.unwrap().unwrap()
}

/// Act as the remote server: open a stream and read back our header and features.
async fn open_stream(peer: &mut MemoryTransport, from: &str, to: &str) -> Element {
    let header = StreamHeader::ours(Some(from), Some(to), None, true);
    peer.write_str(&header.to_xml()).await.unwrap();
    assert!(matches!(read(peer).await, Some(InboundEvent::StreamOpened(_))));
    match read(peer).await {
        Some(InboundEvent::Element(features)) if protocol::is_features(&features) => features,
        other => panic!("expected stream features, got {other:?}"),
    }
}

fn established_for(cid: &Cid) -> impl FnMut(&RouterEvent) -> bool + '_ {
    move |event| matches!(event, RouterEvent::SessionEstablished { cid: c, .. } if c == cid)
}

#[tokio::test]
async fn dialback_authenticates_and_delivers() {
    common::init_tracing();
    let net = MemoryNetwork::new();
    let mut a = net.node(plain("a.example"));
    let mut b = net.node(plain("b.example"));

    let status = a.router.send(message("u@a.example", "u@b.example", "hello")).await.unwrap();
    assert_eq!(status, SendStatus::Queued);

    let delivered = b.next_delivered().await;
    assert_eq!(delivered.name(), "message");
    assert_eq!(delivered.attr("from"), Some("u@a.example"));
    assert_eq!(delivered.attr("to"), Some("u@b.example"));
    assert_eq!(body(&delivered), "hello");

    // b.example called a.example back to check the key.
    assert_eq!(net.dials("a.example", "b.example"), 1);
    assert_eq!(net.dials("b.example", "a.example"), 1);

    b.wait_event(established_for(&Cid::new("b.example", "a.example"))).await;
    a.wait_event(established_for(&Cid::new("a.example", "b.example"))).await;

    // An established link carries further stanzas directly.
    let status = a.router.send(message("u@a.example", "u@b.example", "again")).await.unwrap();
    assert_eq!(status, SendStatus::Sent);
    assert_eq!(body(&b.next_delivered().await), "again");
}

#[tokio::test]
async fn verification_timeout_closes_without_delivery() {
    let net = MemoryNetwork::new();
    let mut a = net.node(config("a.example"));
    let mut cfg = config("b.example");
    cfg.verify_timeout = Duration::from_millis(300);
    let mut b = net.node(cfg);
    net.black_hole("b.example", "a.example");

    a.router.send(message("u@a.example", "u@b.example", "lost")).await.unwrap();

    let closed = b
        .wait_event(|e| matches!(e, RouterEvent::SessionClosed { fault: Some(f), .. } if f.kind == FaultKind::Timeout))
        .await;
    let RouterEvent::SessionClosed { fault: Some(fault), .. } = closed else { unreachable!() };
    assert_eq!(fault.condition, Some(StreamErrorCondition::ConnectionTimeout));
    assert!(b.delivered.try_recv().is_err());

    // The sender learns its stanza could not be federated.
    let bounce = a.next_delivered().await;
    assert_eq!(bounce.attr("type"), Some("error"));
    assert_eq!(bounce.attr("to"), Some("u@a.example"));
    let error = bounce.get_child("error", bounce.ns()).unwrap();
    assert!(error.has_child("remote-server-not-found", NS_STANZAS));
}

#[tokio::test]
async fn verification_timeout_reaches_the_peer_as_a_stream_error() {
    let net = MemoryNetwork::new();
    let mut cfg = plain("b.example");
    cfg.verify_timeout = Duration::from_millis(300);
    let b = net.node(cfg);
    net.black_hole("b.example", "a.example");

    let (mut peer, ours) = MemoryTransport::pair();
    b.router.accept(Box::new(ours)).unwrap();
    open_stream(&mut peer, "a.example", "b.example").await;
    let claim = protocol::dialback("result", "a.example", "b.example", None, None, Some("deadbeef"));
    peer.write_str(&claim.to_xml()).await.unwrap();

    match read(&mut peer).await {
        Some(InboundEvent::Element(el)) => {
            assert!(protocol::is_stream_error(&el));
            assert_eq!(StreamErrorCondition::from_element(&el), Some(StreamErrorCondition::ConnectionTimeout));
        }
        other => panic!("expected a stream error, got {other:?}"),
    }
    assert_eq!(read(&mut peer).await, Some(InboundEvent::StreamClosed));
    assert_eq!(net.dials("b.example", "a.example"), 1);
}

#[tokio::test]
async fn stalled_tls_handshake_is_cut_off_at_the_auth_deadline() {
    let net = MemoryNetwork::new();
    let mut cfg = config("b.example");
    cfg.auth_timeout = Duration::from_millis(300);
    let mut b = net.node(cfg);

    let (mut peer, ours) = MemoryTransport::pair();
    b.router.accept(Box::new(common::StalledTls(ours))).unwrap();
    let features = open_stream(&mut peer, "a.example", "b.example").await;
    assert!(features.has_child("starttls", protocol::NS_TLS));
    peer.write_str(&protocol::starttls().to_xml()).await.unwrap();
    match read(&mut peer).await {
        Some(InboundEvent::Element(el)) => assert_eq!(el.name(), "proceed"),
        other => panic!("expected <proceed/>, got {other:?}"),
    }

    let closed = b
        .wait_event(|e| matches!(e, RouterEvent::SessionClosed { fault: Some(f), .. } if f.kind == FaultKind::Timeout))
        .await;
    let RouterEvent::SessionClosed { fault: Some(fault), .. } = closed else { unreachable!() };
    assert_eq!(fault.condition, Some(StreamErrorCondition::ConnectionTimeout));
}

#[tokio::test]
async fn shutdown_is_not_held_up_by_a_stalled_handshake() {
    let net = MemoryNetwork::new();
    let b = net.node(config("b.example"));

    let (mut peer, ours) = MemoryTransport::pair();
    b.router.accept(Box::new(common::StalledTls(ours))).unwrap();
    open_stream(&mut peer, "a.example", "b.example").await;
    peer.write_str(&protocol::starttls().to_xml()).await.unwrap();
    assert!(matches!(read(&mut peer).await, Some(InboundEvent::Element(_))));

    tokio::time::timeout(common::WAIT, b.router.shutdown()).await.expect("shutdown waited on the handshake");
}

#[tokio::test]
async fn unknown_host_is_refused_with_stream_error() {
    let net = MemoryNetwork::new();
    let b = net.node(config("b.example"));

    let (mut peer, ours) = MemoryTransport::pair();
    b.router.accept(Box::new(ours)).unwrap();
    let header = StreamHeader::ours(Some("a.example"), Some("unknown.example"), None, true);
    peer.write_str(&header.to_xml()).await.unwrap();

    assert!(matches!(read(&mut peer).await, Some(InboundEvent::StreamOpened(_))));
    match read(&mut peer).await {
        Some(InboundEvent::Element(el)) => {
            assert!(protocol::is_stream_error(&el));
            assert_eq!(StreamErrorCondition::from_element(&el), Some(StreamErrorCondition::HostUnknown));
        }
        other => panic!("expected a stream error, got {other:?}"),
    }
    assert_eq!(read(&mut peer).await, Some(InboundEvent::StreamClosed));
    assert_eq!(read(&mut peer).await, None);
}

#[tokio::test]
async fn pool_stays_within_cap_and_keeps_sender_order() {
    let net = MemoryNetwork::new();
    let mut cfg = config("a.example");
    cfg.max_out_conns = 2;
    let a = net.node(cfg);
    let mut b = net.node(config("b.example"));
    let cid = Cid::new("a.example", "b.example");
    let senders = ["alice@a.example", "bob@a.example", "carol@a.example"];

    // Warm up: three senders grow the pool to its cap.
    for sender in senders {
        a.router.send(message(sender, "u@b.example", "warmup")).await.unwrap();
    }
    for _ in senders {
        assert_eq!(body(&b.next_delivered().await), "warmup");
    }
    a.wait_pool(&cid, |p| p.ready == 2).await;

    const PER_SENDER: usize = 25;
    for i in 0..PER_SENDER {
        for sender in senders {
            a.router.send(message(sender, "u@b.example", &i.to_string())).await.unwrap();
            let snapshot = a.router.pool_snapshot(&cid).await.unwrap();
            assert!(snapshot.connections <= 2, "pool grew to {}", snapshot.connections);
        }
    }

    let mut next = [0usize; 3];
    for _ in 0..PER_SENDER * senders.len() {
        let stanza = b.next_delivered().await;
        let idx = senders.iter().position(|s| Some(*s) == stanza.attr("from")).unwrap();
        assert_eq!(body(&stanza), next[idx].to_string(), "out of order for {}", senders[idx]);
        next[idx] += 1;
    }
    assert_eq!(next, [PER_SENDER; 3]);

    let snapshot = a.router.pool_snapshot(&cid).await.unwrap();
    assert_eq!(snapshot.connections, 2);
    assert!(snapshot.system.is_some());
    assert_eq!(snapshot.waiting, 0);
}

#[tokio::test]
async fn sender_order_holds_while_the_pool_grows_from_empty() {
    let net = MemoryNetwork::new();
    let mut cfg = config("a.example");
    cfg.max_out_conns = 2;
    let a = net.node(cfg);
    let mut b = net.node(config("b.example"));
    let cid = Cid::new("a.example", "b.example");
    let senders = ["alice@a.example", "bob@a.example", "carol@a.example"];

    // No warm-up: the first stanzas queue, later ones race the second connection coming up.
    const PER_SENDER: usize = 40;
    for i in 0..PER_SENDER {
        for sender in senders {
            a.router.send(message(sender, "u@b.example", &i.to_string())).await.unwrap();
        }
        if i % 8 == 0 {
            tokio::task::yield_now().await;
        }
    }

    let mut next = [0usize; 3];
    for _ in 0..PER_SENDER * senders.len() {
        let stanza = b.next_delivered().await;
        let idx = senders.iter().position(|s| Some(*s) == stanza.attr("from")).unwrap();
        assert_eq!(body(&stanza), next[idx].to_string(), "out of order for {}", senders[idx]);
        next[idx] += 1;
    }
    assert_eq!(next, [PER_SENDER; 3]);
    let snapshot = a.router.pool_snapshot(&cid).await.unwrap();
    assert!(snapshot.connections <= 2);
}

#[tokio::test]
async fn system_priority_uses_reserved_connection() {
    let net = MemoryNetwork::new();
    let mut cfg = config("a.example");
    cfg.max_out_conns = 2;
    let a = net.node(cfg);
    let mut b = net.node(config("b.example"));
    let cid = Cid::new("a.example", "b.example");

    a.router.send(message("x@a.example", "u@b.example", "1")).await.unwrap();
    a.router.send(message("y@a.example", "u@b.example", "2")).await.unwrap();
    b.next_delivered().await;
    b.next_delivered().await;
    a.wait_pool(&cid, |p| p.ready == 2).await;

    let ping = message("a.example", "b.example", "control");
    let status = a.router.send_with(ping, Priority::System).await.unwrap();
    assert_eq!(status, SendStatus::Sent);
    assert_eq!(body(&b.next_delivered().await), "control");
}

#[tokio::test]
async fn starttls_with_untrusted_certificate_still_uses_dialback() {
    let net = MemoryNetwork::new();
    let a = net.node(config("a.example"));
    let mut b = net.node(config("b.example"));

    a.router.send(message("u@a.example", "u@b.example", "over tls")).await.unwrap();
    assert_eq!(body(&b.next_delivered().await), "over tls");
    // Dialback needed the callback connection.
    assert_eq!(net.dials("b.example", "a.example"), 1);
}

#[tokio::test]
async fn trusted_certificates_skip_dialback() {
    let net = MemoryNetwork::new();
    net.trust("a.example");
    net.trust("b.example");
    let a = net.node(config("a.example"));
    let mut b = net.node(config("b.example"));

    a.router.send(message("u@a.example", "u@b.example", "certified")).await.unwrap();
    assert_eq!(body(&b.next_delivered().await), "certified");
    assert_eq!(net.dials("b.example", "a.example"), 0);
}

#[tokio::test]
async fn sasl_skip_list_falls_back_to_dialback() {
    let net = MemoryNetwork::new();
    net.trust("a.example");
    net.trust("b.example");
    let a = net.node(config("a.example"));
    let mut receiving = config("b.example");
    receiving.sasl_skip_domains.insert("a.example".into());
    let mut b = net.node(receiving);

    a.router.send(message("u@a.example", "u@b.example", "by dialback")).await.unwrap();
    assert_eq!(body(&b.next_delivered().await), "by dialback");
    assert!(net.dials("b.example", "a.example") >= 1, "no dialback verification");
}

#[tokio::test]
async fn unreachable_domain_bounces_to_sender() {
    let net = MemoryNetwork::new();
    let mut a = net.node(config("a.example"));

    a.router.send(message("u@a.example", "u@nowhere.example", "anyone?")).await.unwrap();

    let bounce = a.next_delivered().await;
    assert_eq!(bounce.attr("type"), Some("error"));
    assert_eq!(bounce.attr("from"), Some("u@nowhere.example"));
    let error = bounce.get_child("error", bounce.ns()).unwrap();
    assert!(error.has_child("remote-server-not-found", NS_STANZAS));
    a.wait_event(|e| matches!(e, RouterEvent::StanzaBounced { .. })).await;
}

#[tokio::test]
async fn send_rejects_misaddressed_stanzas() {
    let net = MemoryNetwork::new();
    let a = net.node(config("a.example"));

    let err = a.router.send(message("u@elsewhere.example", "u@b.example", "")).await.unwrap_err();
    assert!(matches!(err, S2sError::NotLocalHost(d) if d == "elsewhere.example"));

    let err = a.router.send(message("u@a.example", "v@a.example", "")).await.unwrap_err();
    assert!(matches!(err, S2sError::LocalDestination(_)));

    let no_to = message("u@a.example", "u@b.example", "").with_attr("to", "");
    let err = a.router.send(no_to).await.unwrap_err();
    assert!(matches!(err, S2sError::Jid(_) | S2sError::InvalidAddress(_)));
}

#[tokio::test]
async fn full_waiting_queue_is_retryable() {
    let net = MemoryNetwork::new();
    net.black_hole("a.example", "b.example");
    let mut cfg = config("a.example");
    cfg.max_waiting_stanzas = 2;
    let a = net.node(cfg);

    for i in 0..2 {
        let status = a.router.send(message("u@a.example", "u@b.example", &i.to_string())).await.unwrap();
        assert_eq!(status, SendStatus::Queued);
    }
    let err = a.router.send(message("u@a.example", "u@b.example", "overflow")).await.unwrap_err();
    assert!(err.is_retryable());
    assert!(matches!(err, S2sError::PoolExhausted { waiting: 2, .. }));

    a.router.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_sessions_and_refuses_new_work() {
    let net = MemoryNetwork::new();
    let a = net.node(config("a.example"));
    let mut b = net.node(config("b.example"));

    a.router.send(message("u@a.example", "u@b.example", "before")).await.unwrap();
    b.next_delivered().await;

    a.router.shutdown().await;
    let err = a.router.send(message("u@a.example", "u@b.example", "after")).await.unwrap_err();
    assert!(matches!(err, S2sError::ShuttingDown));
    assert!(a.router.pool_snapshot(&Cid::new("a.example", "b.example")).await.is_none());

    // The peer sees the stream end with system-shutdown.
    b.wait_event(|e| {
        matches!(
            e,
            RouterEvent::SessionClosed { direction: Direction::Incoming, cid: Some(c), .. }
                if *c == Cid::new("b.example", "a.example")
        )
    })
    .await;
}

#[tokio::test]
async fn compression_is_negotiated_before_dialback() {
    let net = MemoryNetwork::new();
    let mut cfg_a = config("a.example");
    cfg_a.compression = true;
    let mut cfg_b = config("b.example");
    cfg_b.compression = true;
    let a = net.node(cfg_a);
    let mut b = net.node(cfg_b);

    a.router.send(message("u@a.example", "u@b.example", "squeezed")).await.unwrap();
    assert_eq!(body(&b.next_delivered().await), "squeezed");
}
