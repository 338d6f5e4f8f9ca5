//! End-to-end request/reply over the loopback transport.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use replywire_core::{Lifecycle, ServiceState};
use replywire_requestor::{
    CorrelationConfig, CorrelationError, CorrelationManager, CorrelationObserver,
    CorrelationStrategy, LoopbackConfig, LoopbackTransport, OutboundMessage, RequestContext,
    Requestor,
};

struct Harness {
    requestor: Arc<Requestor>,
    transport: Arc<LoopbackTransport>,
}

async fn harness(config: CorrelationConfig, loopback: LoopbackConfig) -> Harness {
    harness_with(Arc::new(CorrelationManager::new(config)), loopback).await
}

async fn harness_with(manager: Arc<CorrelationManager>, loopback: LoopbackConfig) -> Harness {
    manager.start().await.unwrap();
    let (transport, replies) = LoopbackTransport::new(loopback);
    let transport = Arc::new(transport);
    let requestor = Arc::new(Requestor::new(manager, transport.clone()));
    requestor.spawn_reply_listener(replies);
    Harness {
        requestor,
        transport,
    }
}

fn config(strategy: CorrelationStrategy) -> CorrelationConfig {
    CorrelationConfig {
        strategy,
        purge_interval_ms: 20,
        default_request_timeout_ms: 100,
        ..CorrelationConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn concurrent_requests_get_their_own_replies() {
    for strategy in [CorrelationStrategy::CorrelationId, CorrelationStrategy::MessageId] {
        let h = harness(config(strategy), LoopbackConfig::default()).await;

        let mut pending = Vec::new();
        for i in 0..25 {
            let message = OutboundMessage::new("queue:echo", format!("order-{i}"));
            pending.push((i, h.requestor.request(message).await.unwrap()));
        }
        for (i, reply) in pending {
            let reply = reply.wait().await.unwrap();
            assert_eq!(reply.body, format!("order-{i}"), "strategy {strategy:?}");
        }

        assert_eq!(h.requestor.manager().pending_count(), 0);
        h.requestor.manager().stop().await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn explicit_correlation_id_is_kept() {
    let h = harness(config(CorrelationStrategy::MessageId), LoopbackConfig::default()).await;

    let message =
        OutboundMessage::new("queue:echo", "ping").with_header("correlation-id", "order-7");
    let pending = h.requestor.request(message).await.unwrap();
    assert_eq!(pending.correlation_id(), "order-7");

    let reply = pending.wait().await.unwrap();
    assert_eq!(reply.correlation_id, "order-7");
    assert_eq!(reply.header("correlation-id"), Some("order-7"));
}

#[tokio::test(start_paused = true)]
async fn dropped_replies_time_out() {
    let h = harness(
        config(CorrelationStrategy::CorrelationId),
        LoopbackConfig {
            drop_every: 2,
            ..LoopbackConfig::default()
        },
    )
    .await;

    let mut pending = Vec::new();
    for i in 0..6 {
        let message = OutboundMessage::new("queue:echo", format!("order-{i}"));
        pending.push(h.requestor.request(message).await.unwrap());
    }

    let mut replies = 0;
    let mut timeouts = 0;
    for reply in pending {
        match reply.wait().await {
            Ok(_) => replies += 1,
            Err(err) if err.is_timeout() => timeouts += 1,
            Err(err) => panic!("unexpected failure: {err}"),
        }
    }
    assert_eq!((replies, timeouts), (3, 3));
    assert_eq!(h.transport.sent_count(), 6);
}

#[tokio::test(start_paused = true)]
async fn per_request_timeout_wins_over_default() {
    let h = harness(
        config(CorrelationStrategy::CorrelationId),
        LoopbackConfig {
            reply_delay_ms: 60,
            ..LoopbackConfig::default()
        },
    )
    .await;

    // Default budget is 100ms, which the 60ms echo beats.
    let relaxed = h
        .requestor
        .request(OutboundMessage::new("queue:echo", "a"))
        .await
        .unwrap();
    let strict = h
        .requestor
        .request(OutboundMessage::new("queue:echo", "b").with_timeout(Duration::from_millis(10)))
        .await
        .unwrap();

    assert!(strict.wait().await.unwrap_err().is_timeout());
    assert_eq!(relaxed.wait().await.unwrap().body, "a");
}

#[derive(Default)]
struct StaleCounter(AtomicU32);

impl CorrelationObserver for StaleCounter {
    fn on_stale_reply(&self, _key: &str) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test(start_paused = true)]
async fn late_reply_after_timeout_is_discarded() {
    let stale = Arc::new(StaleCounter::default());
    let manager = Arc::new(CorrelationManager::with_observer(
        config(CorrelationStrategy::CorrelationId),
        stale.clone(),
    ));
    let h = harness_with(
        manager,
        LoopbackConfig {
            reply_delay_ms: 500,
            ..LoopbackConfig::default()
        },
    )
    .await;

    let pending = h
        .requestor
        .request(OutboundMessage::new("queue:echo", "slow"))
        .await
        .unwrap();
    assert!(pending.wait().await.unwrap_err().is_timeout());

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(stale.0.load(Ordering::SeqCst), 1);
    assert_eq!(h.requestor.manager().pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn failing_transport_fails_requests() {
    let h = harness(config(CorrelationStrategy::MessageId), LoopbackConfig::default()).await;
    h.transport.set_failing(true);

    let err = h
        .requestor
        .request(OutboundMessage::new("queue:echo", "ping"))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap_err();
    assert!(matches!(err, CorrelationError::Send { .. }));

    h.transport.set_failing(false);
    let reply = h
        .requestor
        .request(OutboundMessage::new("queue:echo", "ping"))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(reply.body, "ping");
}

#[tokio::test(start_paused = true)]
async fn shutdown_abandons_outstanding_requests() {
    let h = harness(config(CorrelationStrategy::CorrelationId), LoopbackConfig::default()).await;
    h.transport.set_dropping(true);

    let pending = h
        .requestor
        .request(OutboundMessage::new("queue:echo", "ping"))
        .await
        .unwrap();
    let manager = h.requestor.manager();
    manager.shutdown().await.unwrap();

    assert_eq!(manager.state(), ServiceState::Shutdown);
    assert_eq!(pending.wait().await.unwrap_err(), CorrelationError::Abandoned);
    assert_eq!(
        h.requestor
            .request(OutboundMessage::new("queue:echo", "again"))
            .await
            .unwrap_err(),
        CorrelationError::NotRunning
    );
}

#[tokio::test]
async fn continuation_sees_request_context() {
    let h = harness(config(CorrelationStrategy::CorrelationId), LoopbackConfig::default()).await;
    let (tx, rx) = tokio::sync::oneshot::channel::<RequestContext>();

    let key = h
        .requestor
        .request_with(
            OutboundMessage::new("queue:echo", "ping"),
            Box::new(move |resolution| {
                let _ = tx.send(resolution.context);
            }),
        )
        .await
        .unwrap();

    let context = rx.await.unwrap();
    assert_eq!(context.correlation_id, key);
    assert_eq!(context.destination, "queue:echo");
    assert_eq!(context.timeout, Duration::from_millis(100));
}
