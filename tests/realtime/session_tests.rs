//! Session lifecycle tests: handshake sharing, auth, receipts, backoff,
//! heartbeats and cancellation.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::time::Instant;

use chat_realtime::domain::{Credential, MessageId};
use chat_realtime::gateway::{DisconnectReason, Frame, Session, SessionEvent, SessionState};
use chat_realtime::RealtimeError;

use crate::common::*;

fn session(server: &LoopbackServer) -> Arc<Session> {
    Arc::new(Session::new(Arc::new(server.clone()), test_config()))
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_connects_share_one_handshake() {
    let server = LoopbackServer::new();
    let session = session(&server);

    let (first, second) = tokio::join!(session.connect(credential()), session.connect(credential()));
    assert!(first.is_ok());
    assert!(second.is_ok());
    assert_eq!(server.connect_count(), 1);

    // Already connected: no new handshake
    session.connect(credential()).await.unwrap();
    assert_eq!(server.connect_count(), 1);
    assert_eq!(session.state(), SessionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_credential_is_not_retried() {
    let server = LoopbackServer::new();
    let session = session(&server);
    let mut events = session.subscribe_events();

    let result = session.connect(Credential::bearer("expired")).await;
    assert!(matches!(result, Err(RealtimeError::Auth(_))));

    let event = next_matching(&mut events, |e| matches!(e, SessionEvent::AuthRejected { .. })).await;
    assert!(matches!(event, SessionEvent::AuthRejected { .. }));

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(server.connect_count(), 1);
    assert_eq!(session.state(), SessionState::Disconnected);
    assert_eq!(session.reconnect_attempt(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_send_requires_connection() {
    let server = LoopbackServer::new();
    let session = session(&server);

    let result = session.send("/app/chat.send", json!({"chatId": "c1", "body": "hi"})).await;
    assert_eq!(result, Err(RealtimeError::NotConnected));
    assert!(server.received_ops("SEND").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_send_resolves_on_receipt() {
    let server = LoopbackServer::new();
    let session = session(&server);
    session.connect(credential()).await.unwrap();

    let ack = session
        .send("/app/chat.send", json!({"chatId": "c1", "body": "hi"}))
        .await
        .unwrap();
    assert_eq!(ack.message_id, Some(MessageId::new("srv-1")));

    let ack = session.send("/app/chat.read", json!({"chatId": "c1"})).await.unwrap();
    assert_eq!(ack.message_id, None);

    let receipts: Vec<u64> = server
        .received_ops("SEND")
        .into_iter()
        .filter_map(|frame| match frame {
            Frame::Send { receipt, .. } => Some(receipt),
            _ => None,
        })
        .collect();
    assert_eq!(receipts.len(), 2);
    assert_ne!(receipts[0], receipts[1]);
}

#[tokio::test(start_paused = true)]
async fn test_server_error_rejects_send() {
    let server = LoopbackServer::new();
    server.reject_destination("/app/chat.send", "chat is archived");
    let session = session(&server);
    session.connect(credential()).await.unwrap();

    let result = session.send("/app/chat.send", json!({"chatId": "c1", "body": "hi"})).await;
    assert_eq!(result, Err(RealtimeError::Rejected("chat is archived".into())));

    // A rejected send does not affect the connection
    assert_eq!(session.state(), SessionState::Connected);
    assert!(session.send("/app/chat.read", json!({"chatId": "c1"})).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_undecodable_frames_are_dropped() {
    let server = LoopbackServer::new();
    let session = session(&server);
    session.connect(credential()).await.unwrap();

    assert!(server.push_raw("not json"));
    assert!(server.push_raw(r#"{"op":"TELEPORT","d":{}}"#));
    settle().await;

    assert_eq!(session.state(), SessionState::Connected);
    assert!(session.send("/app/chat.read", json!({"chatId": "c1"})).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_backoff_doubles_until_exhausted() {
    let server = LoopbackServer::new();
    server.set_fallback(Outcome::FailTransport);
    let session = session(&server);
    let mut events = session.subscribe_events();
    let started = Instant::now();

    let result = session.connect(credential()).await;
    assert!(matches!(result, Err(RealtimeError::Transport(_))));

    let mut delays = Vec::new();
    loop {
        match next_matching(&mut events, |e| {
            matches!(
                e,
                SessionEvent::ReconnectScheduled { .. } | SessionEvent::ReconnectExhausted { .. }
            )
        })
        .await
        {
            SessionEvent::ReconnectScheduled { attempt, delay } => {
                assert_eq!(attempt as usize, delays.len() + 1);
                delays.push(delay);
            }
            SessionEvent::ReconnectExhausted { attempts } => {
                assert_eq!(attempts, 3);
                break;
            }
            _ => unreachable!(),
        }
    }

    assert_eq!(
        delays,
        vec![
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(400)
        ]
    );
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(700), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(800), "elapsed {:?}", elapsed);
    assert_eq!(server.connect_count(), 4);

    // Exhaustion is reported once and the session stays down
    tokio::time::sleep(Duration::from_secs(30)).await;
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, SessionEvent::ReconnectExhausted { .. }));
    }
    assert_eq!(server.connect_count(), 4);
    assert_eq!(session.state(), SessionState::Disconnected);

    // Terminal until the application connects again
    let result = session.send("/app/chat.read", json!({"chatId": "c1"})).await;
    assert_eq!(result, Err(RealtimeError::ReconnectExhausted { attempts: 3 }));

    server.set_fallback(Outcome::Accept);
    session.connect(credential()).await.unwrap();
    assert!(session.send("/app/chat.read", json!({"chatId": "c1"})).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_recovers_after_transient_failures() {
    let server = LoopbackServer::new();
    server.script([Outcome::FailTransport, Outcome::FailTransport]);
    let session = session(&server);

    assert!(session.connect(credential()).await.is_err());
    wait_for_state(&session, SessionState::Connected).await;

    assert_eq!(server.connect_count(), 3);
    assert_eq!(session.reconnect_attempt(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeats_keep_session_alive() {
    let server = LoopbackServer::new();
    let session = session(&server);
    session.connect(credential()).await.unwrap();

    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(session.state(), SessionState::Connected);
    assert_eq!(server.connect_count(), 1);
    assert!(server.received_ops("HEARTBEAT").len() >= 9);
}

#[tokio::test(start_paused = true)]
async fn test_silent_server_triggers_heartbeat_timeout() {
    let server = LoopbackServer::new();
    server.set_echo_heartbeats(false);
    let session = session(&server);
    let mut events = session.subscribe_events();
    session.connect(credential()).await.unwrap();
    let connected_at = Instant::now();

    let event = next_matching(&mut events, |e| matches!(e, SessionEvent::Disconnected { .. })).await;
    assert_eq!(
        event,
        SessionEvent::Disconnected {
            reason: DisconnectReason::HeartbeatTimeout
        }
    );
    // Two silent intervals
    let elapsed = connected_at.elapsed();
    assert!(elapsed >= HEARTBEAT * 2, "elapsed {:?}", elapsed);
    assert!(elapsed < HEARTBEAT * 3, "elapsed {:?}", elapsed);

    server.set_echo_heartbeats(true);
    wait_for_state(&session, SessionState::Connected).await;
    assert_eq!(server.connect_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_scheduled_reconnect() {
    let server = LoopbackServer::new();
    let session = session(&server);
    let mut events = session.subscribe_events();
    session.connect(credential()).await.unwrap();

    server.drop_connection();
    next_matching(&mut events, |e| matches!(e, SessionEvent::ReconnectScheduled { .. })).await;

    session.disconnect().await;
    assert_eq!(session.state(), SessionState::Disconnected);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(server.connect_count(), 1);
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_connect_in_flight() {
    let server = LoopbackServer::new();
    server.script([Outcome::Hang]);
    let session = session(&server);

    let connecting = Arc::clone(&session);
    let pending = tokio::spawn(async move { connecting.connect(credential()).await });
    settle().await;
    assert_eq!(session.state(), SessionState::Connecting);

    session.disconnect().await;

    assert_eq!(pending.await.unwrap(), Err(RealtimeError::Cancelled));
    assert_eq!(session.state(), SessionState::Disconnected);
    assert_eq!(server.connect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_client_disconnect_closes_connection() {
    let server = LoopbackServer::new();
    let session = session(&server);
    let mut events = session.subscribe_events();
    session.connect(credential()).await.unwrap();
    assert!(server.is_connected());

    session.disconnect().await;

    assert!(!server.is_connected());
    assert_eq!(session.state(), SessionState::Disconnected);
    let event = next_matching(&mut events, |e| matches!(e, SessionEvent::Disconnected { .. })).await;
    assert_eq!(
        event,
        SessionEvent::Disconnected {
            reason: DisconnectReason::ClientInitiated
        }
    );

    // No automatic reconnect after a client-initiated close
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(server.connect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_handshake_timeout_is_retried() {
    let server = LoopbackServer::new();
    server.script([Outcome::Hang]);
    let session = session(&server);
    let started = Instant::now();

    let result = session.connect(credential()).await;
    assert!(matches!(result, Err(RealtimeError::Timeout(_))));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(1), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "elapsed {:?}", elapsed);

    wait_for_state(&session, SessionState::Connected).await;
    assert_eq!(server.connect_count(), 2);
}
