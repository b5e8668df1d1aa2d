//! Subscription replay across reconnects.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

use chat_realtime::domain::Topic;
use chat_realtime::gateway::{Frame, Router, SessionEvent, SessionState};

use crate::common::*;

fn router(server: &LoopbackServer) -> Arc<Router> {
    Router::build(Arc::new(server.clone()), test_config())
}

/// Handler that records every payload it receives.
fn recorder() -> (Arc<Mutex<Vec<Value>>>, impl Fn(Value) + Send + Sync + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |payload| sink.lock().push(payload))
}

fn topics(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

fn subscribe_count(server: &LoopbackServer, topic: &str) -> usize {
    server
        .received_ops("SUBSCRIBE")
        .iter()
        .filter(|frame| matches!(frame, Frame::Subscribe { topic: t } if t == topic))
        .count()
}

async fn bounce(server: &LoopbackServer, router: &Router) {
    server.drop_connection();
    wait_for_state(router.session(), SessionState::Disconnected).await;
    wait_for_state(router.session(), SessionState::Connected).await;
}

#[tokio::test(start_paused = true)]
async fn test_subscriptions_replayed_on_every_reconnect() {
    let server = LoopbackServer::new();
    let router = router(&server);
    for name in ["/topic/a", "/topic/b", "/topic/c"] {
        router.subscribe(Topic::new(name), |_| {});
    }

    router.session().connect(credential()).await.unwrap();
    assert_eq!(server.subscriptions(), topics(&["/topic/a", "/topic/b", "/topic/c"]));

    for cycle in 0..5 {
        bounce(&server, &router).await;
        assert_eq!(server.connect_count(), cycle + 2);
        assert_eq!(
            server.subscriptions(),
            topics(&["/topic/a", "/topic/b", "/topic/c"]),
            "cycle {}",
            cycle
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_replay_completes_before_connected() {
    let server = LoopbackServer::new();
    let router = router(&server);
    router.subscribe(Topic::new("/topic/a"), |_| {});
    router.subscribe(Topic::new("/topic/b"), |_| {});
    let mut events = router.session().subscribe_events();

    router.session().connect(credential()).await.unwrap();
    next_matching(&mut events, |e| *e == SessionEvent::Connected).await;

    server.drop_connection();
    next_matching(&mut events, |e| *e == SessionEvent::Connected).await;

    // Observed at the instant Connected is announced
    assert_eq!(server.subscriptions(), topics(&["/topic/a", "/topic/b"]));
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribed_topic_is_not_replayed() {
    let server = LoopbackServer::new();
    let router = router(&server);
    router.subscribe(Topic::new("/topic/a"), |_| {});
    let b = router.subscribe(Topic::new("/topic/b"), |_| {});
    router.session().connect(credential()).await.unwrap();

    assert!(router.unsubscribe(&b));
    settle().await;
    assert_eq!(server.received_ops("UNSUBSCRIBE").len(), 1);
    assert_eq!(server.subscriptions(), topics(&["/topic/a"]));

    bounce(&server, &router).await;
    assert_eq!(server.subscriptions(), topics(&["/topic/a"]));
    assert_eq!(subscribe_count(&server, "/topic/b"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_while_offline_is_sent_on_reconnect() {
    let server = LoopbackServer::new();
    let router = router(&server);
    router.subscribe(Topic::new("/topic/a"), |_| {});
    router.session().connect(credential()).await.unwrap();

    server.drop_connection();
    wait_for_state(router.session(), SessionState::Disconnected).await;
    router.subscribe(Topic::new("/topic/late"), |_| {});
    assert!(!router.registry().is_active(&Topic::new("/topic/late")));

    wait_for_state(router.session(), SessionState::Connected).await;
    assert_eq!(server.subscriptions(), topics(&["/topic/a", "/topic/late"]));
    assert_eq!(subscribe_count(&server, "/topic/late"), 1);
    assert!(router.registry().is_active(&Topic::new("/topic/late")));
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_subscribe_sends_once_and_replaces_handler() {
    let server = LoopbackServer::new();
    let router = router(&server);
    router.session().connect(credential()).await.unwrap();

    let (first, first_handler) = recorder();
    let (second, second_handler) = recorder();
    router.subscribe(Topic::new("/topic/a"), first_handler);
    router.subscribe(Topic::new("/topic/a"), second_handler);
    settle().await;

    assert_eq!(subscribe_count(&server, "/topic/a"), 1);

    assert!(server.publish("/topic/a", json!({"n": 1})));
    settle().await;
    assert!(first.lock().is_empty());
    assert_eq!(*second.lock(), vec![json!({"n": 1})]);
}

#[tokio::test(start_paused = true)]
async fn test_frames_delivered_after_reconnect() {
    let server = LoopbackServer::new();
    let router = router(&server);
    let (seen, handler) = recorder();
    router.subscribe(Topic::new("/topic/a"), handler);
    router.session().connect(credential()).await.unwrap();

    assert!(server.publish("/topic/a", json!({"n": 1})));
    settle().await;

    bounce(&server, &router).await;
    assert!(server.publish("/topic/a", json!({"n": 2})));
    settle().await;

    assert_eq!(*seen.lock(), vec![json!({"n": 1}), json!({"n": 2})]);
}

#[tokio::test(start_paused = true)]
async fn test_frame_for_unknown_topic_is_dropped() {
    let server = LoopbackServer::new();
    let router = router(&server);
    let (seen, handler) = recorder();
    router.subscribe(Topic::new("/topic/a"), handler);
    router.session().connect(credential()).await.unwrap();

    let stray = Frame::Message {
        topic: "/topic/elsewhere".into(),
        payload: json!({"n": 1}),
    };
    assert!(server.push_raw(&chat_realtime::gateway::codec::encode(&stray).unwrap()));
    settle().await;

    assert!(seen.lock().is_empty());
    assert_eq!(router.session().state(), SessionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_connect_during_slow_disconnect_keeps_subscriptions_live() {
    let server = LoopbackServer::new();
    server.set_close_delay(Duration::from_millis(200));
    let router = router(&server);
    router.subscribe(Topic::new("/topic/a"), |_| {});
    router.session().connect(credential()).await.unwrap();

    let closing = Arc::clone(&router);
    let disconnect = tokio::spawn(async move { closing.session().disconnect().await });
    wait_for_state(router.session(), SessionState::Disconnecting).await;

    router.session().connect(credential()).await.unwrap();
    disconnect.await.unwrap();

    // The superseded disconnect must not take the registry offline
    assert_eq!(router.session().state(), SessionState::Connected);
    assert!(router.registry().is_active(&Topic::new("/topic/a")));

    router.subscribe(Topic::new("/topic/late"), |_| {});
    settle().await;
    assert!(router.registry().is_active(&Topic::new("/topic/late")));
    assert_eq!(server.subscriptions(), topics(&["/topic/a", "/topic/late"]));
    assert_eq!(server.connect_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_during_backoff_is_not_replayed() {
    let server = LoopbackServer::new();
    let router = router(&server);
    router.subscribe(Topic::new("/topic/a"), |_| {});
    let b = router.subscribe(Topic::new("/topic/b"), |_| {});
    router.subscribe(Topic::new("/topic/c"), |_| {});
    router.session().connect(credential()).await.unwrap();

    server.drop_connection();
    wait_for_state(router.session(), SessionState::Disconnected).await;
    assert!(router.unsubscribe(&b));

    wait_for_state(router.session(), SessionState::Connected).await;
    settle().await;

    assert_eq!(server.subscriptions(), topics(&["/topic/a", "/topic/c"]));
    assert_eq!(subscribe_count(&server, "/topic/b"), 1);
    // Nothing to withdraw on a connection that never carried it
    assert!(server.received_ops("UNSUBSCRIBE").is_empty());
    assert_eq!(
        router.registry().topics(),
        vec![Topic::new("/topic/a"), Topic::new("/topic/c")]
    );
}

/// Poll `check` on real time until it holds.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unsubscribe_racing_replay_leaves_server_consistent() {
    let server = LoopbackServer::new();
    let router = router(&server);
    router.subscribe(Topic::new("/topic/a"), |_| {});
    router.session().connect(credential()).await.unwrap();

    for round in 0..10 {
        let b = router.subscribe(Topic::new("/topic/b"), |_| {});
        let mut events = router.session().subscribe_events();

        server.drop_connection();
        let racing = Arc::clone(&router);
        let unsubscriber = tokio::spawn(async move {
            tokio::task::yield_now().await;
            racing.unsubscribe(&b)
        });

        next_matching(&mut events, |e| *e == SessionEvent::Connected).await;
        assert!(unsubscriber.await.unwrap(), "round {}", round);

        // Either never replayed, or replayed and then withdrawn
        assert!(
            eventually(|| server.subscriptions() == topics(&["/topic/a"])).await,
            "round {}: {:?}",
            round,
            server.subscriptions()
        );
        assert_eq!(router.registry().topics(), vec![Topic::new("/topic/a")]);
    }
}
