use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use tokio::sync::mpsc;

use super::*;
use crate::apns::ErrorKind;
use crate::test_helpers::{MockTransport, PANIC_TOKEN, collect_responses};

fn tokens(list: &[&str]) -> Vec<String> {
    list.iter().map(ToString::to_string).collect()
}

fn notification() -> Arc<Notification> {
    Arc::new(
        Notification::new("com.example.app", br#"{"aps":{"alert":"hi"}}"#.to_vec())
            .with_owner("alice"),
    )
}

fn pool_with_sink(
    transport: Arc<MockTransport>,
    workers: usize,
) -> (DeliveryPool, mpsc::UnboundedReceiver<DeliveryResponse>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let pool = DeliveryPool::new(
        "com.example.app",
        transport,
        Arc::new(AtomicBool::new(false)),
        workers,
        Some(tx),
    );
    (pool, rx)
}

#[tokio::test]
async fn empty_token_list_is_noop() {
    let transport = MockTransport::new();
    let (pool, mut rx) = pool_with_sink(Arc::clone(&transport), 2);

    let report = pool.push(notification(), &[]).await.unwrap();
    assert_eq!(report, PushReport::default());
    assert!(transport.calls().is_empty());
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn first_token_sent_inline_rest_queued() {
    let transport = MockTransport::new();
    let (pool, mut rx) = pool_with_sink(Arc::clone(&transport), 2);

    let report = pool
        .push(notification(), &tokens(&["t1", "t2", "t3"]))
        .await
        .unwrap();
    assert_eq!(report.delivered, Some(("t1".to_string(), "id-t1".to_string())));
    assert_eq!(report.queued, tokens(&["t2", "t3"]));
    assert!(report.rejected.is_empty());

    let responses = collect_responses(&mut rx, 3).await;
    assert_eq!(responses[0].token, "t1");
    assert!(responses.iter().all(|r| r.error.is_none() && r.owner == "alice"));
    let mut sent = transport.tokens();
    sent.sort();
    assert_eq!(sent, tokens(&["t1", "t2", "t3"]));
}

#[tokio::test]
async fn token_errors_advance_to_next_token() {
    let transport = MockTransport::new();
    transport.fail("bad1", 400, "BadDeviceToken");
    transport.fail("bad2", 410, "Unregistered");
    let (pool, mut rx) = pool_with_sink(Arc::clone(&transport), 1);

    let report = pool
        .push(notification(), &tokens(&["bad1", "bad2", "good"]))
        .await
        .unwrap();

    assert_eq!(report.delivered, Some(("good".to_string(), "id-good".to_string())));
    assert_eq!(report.rejected.len(), 2);
    assert!(report.queued.is_empty());
    assert_eq!(transport.tokens(), tokens(&["bad1", "bad2", "good"]));

    let responses = collect_responses(&mut rx, 3).await;
    let token_errors: Vec<_> = responses
        .iter()
        .filter(|r| r.error.as_ref().is_some_and(DeliveryError::is_token))
        .map(|r| r.token.as_str())
        .collect();
    assert_eq!(token_errors, vec!["bad1", "bad2"]);
    assert_eq!(responses[2].id.as_deref(), Some("id-good"));
}

#[tokio::test]
async fn only_token_errors_is_not_an_error() {
    let transport = MockTransport::new();
    transport.fail("bad1", 400, "BadDeviceToken");
    transport.fail("bad2", 400, "DeviceTokenNotForTopic");
    let (pool, _rx) = pool_with_sink(Arc::clone(&transport), 1);

    let report = pool
        .push(notification(), &tokens(&["bad1", "bad2"]))
        .await
        .unwrap();
    assert!(report.delivered.is_none());
    assert_eq!(report.rejected.len(), 2);
}

#[tokio::test]
async fn non_token_error_aborts_batch() {
    let transport = MockTransport::new();
    transport.fail("first", 400, "PayloadTooLarge");
    let (pool, mut rx) = pool_with_sink(Arc::clone(&transport), 2);

    let err = pool
        .push(notification(), &tokens(&["first", "second", "third"]))
        .await
        .unwrap_err();

    match err {
        PoolError::Aborted { token, error, rejected } => {
            assert_eq!(token, "first");
            assert_eq!(error.kind(), ErrorKind::Rejected);
            assert!(rejected.is_empty());
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // Nothing else attempted, exactly one response emitted.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.tokens(), tokens(&["first"]));
    assert_eq!(collect_responses(&mut rx, 1).await[0].status(), 400);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn abort_after_token_errors_keeps_them() {
    let transport = MockTransport::new();
    transport.fail("bad", 410, "Unregistered");
    transport.fail("broken", 503, "ServiceUnavailable");
    let (pool, _rx) = pool_with_sink(Arc::clone(&transport), 1);

    let err = pool
        .push(notification(), &tokens(&["bad", "broken", "never"]))
        .await
        .unwrap_err();
    let PoolError::Aborted { error, rejected, .. } = err else {
        panic!("expected abort");
    };
    assert_eq!(error.kind(), ErrorKind::Server);
    assert_eq!(rejected.len(), 1);
    assert_eq!(transport.tokens(), tokens(&["bad", "broken"]));
}

#[tokio::test]
async fn closed_pool_rejects_push() {
    let transport = MockTransport::new();
    let (pool, _rx) = pool_with_sink(transport, 1);
    pool.close();
    pool.close();
    assert!(pool.is_closed());

    let err = pool.push(notification(), &tokens(&["t1"])).await.unwrap_err();
    assert_eq!(err, PoolError::Closed("com.example.app".to_string()));
}

#[tokio::test]
async fn close_drains_queued_jobs() {
    let transport = MockTransport::with_delay(Duration::from_millis(10));
    let (pool, mut rx) = pool_with_sink(Arc::clone(&transport), 2);

    let list: Vec<String> = (0..10).map(|i| format!("t{i}")).collect();
    let report = pool.push(notification(), &list).await.unwrap();
    assert_eq!(report.queued.len(), 9);

    pool.shutdown().await;
    assert_eq!(pool.pending(), 0);
    assert_eq!(transport.calls().len(), 10);
    assert_eq!(collect_responses(&mut rx, 10).await.len(), 10);
}

#[tokio::test]
async fn worker_survives_panicking_send() {
    let transport = MockTransport::new();
    let (pool, mut rx) = pool_with_sink(Arc::clone(&transport), 1);

    pool.push(notification(), &tokens(&["ok", PANIC_TOKEN, "after"]))
        .await
        .unwrap();

    let responses = collect_responses(&mut rx, 3).await;
    let panicked = responses.iter().find(|r| r.token == PANIC_TOKEN).unwrap();
    assert_eq!(
        panicked.error.as_ref().map(DeliveryError::kind),
        Some(ErrorKind::Transport)
    );
    let after = responses.iter().find(|r| r.token == "after").unwrap();
    assert!(after.error.is_none());
}

#[tokio::test]
async fn inline_panic_is_a_transport_abort() {
    let transport = MockTransport::new();
    let (pool, _rx) = pool_with_sink(Arc::clone(&transport), 1);

    let err = pool
        .push(notification(), &tokens(&[PANIC_TOKEN, "next"]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PoolError::Aborted { ref error, .. } if error.kind() == ErrorKind::Transport
    ));
}

#[tokio::test]
async fn sandbox_flag_read_at_send_time() {
    let transport = MockTransport::new();
    let flag = Arc::new(AtomicBool::new(false));
    let pool = DeliveryPool::new(
        "com.example.app",
        Arc::clone(&transport) as Arc<dyn Transport>,
        Arc::clone(&flag),
        1,
        None,
    );

    pool.push(notification(), &tokens(&["a"])).await.unwrap();
    pool.set_sandbox(true);
    assert!(flag.load(std::sync::atomic::Ordering::Acquire));
    pool.push(notification(), &tokens(&["b"])).await.unwrap();

    assert_eq!(
        transport.calls(),
        vec![("a".to_string(), false), ("b".to_string(), true)]
    );
}

#[tokio::test]
async fn zero_workers_still_drains() {
    let transport = MockTransport::new();
    let (pool, mut rx) = pool_with_sink(Arc::clone(&transport), 0);
    pool.push(notification(), &tokens(&["a", "b"])).await.unwrap();
    assert_eq!(collect_responses(&mut rx, 2).await.len(), 2);
}
