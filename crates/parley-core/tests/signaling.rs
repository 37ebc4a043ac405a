//! End-to-end signaling scenarios over in-memory connections.

use parley_core::{CallStatus, CloseReason, ConnectionLoop, HandlerConfig, Hub};
use parley_protocol::{CallDecision, CallKind, ClientEvent, ServerEvent, UserId};
use parley_transport::{memory, MemoryPeer};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

struct Client {
    peer: MemoryPeer,
    task: JoinHandle<CloseReason>,
}

impl Client {
    fn connect(hub: &Arc<Hub>, user: UserId) -> Self {
        let (conn, peer) = memory::pair();
        let connection = ConnectionLoop::open(hub.clone(), user, conn, HandlerConfig::default());
        Self {
            peer,
            task: tokio::spawn(connection.run()),
        }
    }

    async fn next(&mut self) -> ServerEvent {
        timeout(WAIT, self.peer.recv())
            .await
            .expect("timed out waiting for event")
            .expect("connection closed")
    }

    /// Assert nothing else is queued: a ping must come back as the next event.
    async fn assert_quiet(&mut self) {
        self.peer.send(&ClientEvent::Ping { timestamp: Some(999) });
        assert_eq!(self.next().await, ServerEvent::pong(Some(999)));
    }

    async fn close(mut self) -> CloseReason {
        self.peer.disconnect();
        timeout(WAIT, self.task)
            .await
            .expect("loop did not stop")
            .expect("loop panicked")
    }
}

fn call_response(call_id: &str, response: &str) -> ClientEvent {
    ClientEvent::CallResponse {
        call_id: Some(call_id.to_string()),
        response: Some(response.to_string()),
    }
}

#[tokio::test]
async fn test_audio_call_accept_then_caller_disconnects() {
    let hub = Arc::new(Hub::new());
    let mut alice = Client::connect(&hub, 1);
    let mut bob = Client::connect(&hub, 2);

    let session = hub.initiate(1, 2, CallKind::Audio).unwrap();
    let call_id = session.id.to_string();
    assert_eq!(
        bob.next().await,
        ServerEvent::IncomingCall {
            call_id: call_id.clone(),
            caller: 1,
            kind: CallKind::Audio,
        }
    );

    bob.peer.send(&call_response(&call_id, "accept"));
    assert_eq!(
        alice.next().await,
        ServerEvent::CallAccepted {
            call_id: call_id.clone(),
            kind: CallKind::Audio,
        }
    );
    assert_eq!(hub.call(&session.id).unwrap().status, CallStatus::Active);

    assert_eq!(alice.close().await, CloseReason::ClientClosed);
    assert_eq!(
        bob.next().await,
        ServerEvent::CallEnded {
            call_id,
            ended_by: 1,
        }
    );
    let session = hub.call(&session.id).unwrap();
    assert_eq!(session.status, CallStatus::Ended);
    assert_eq!(session.ended_by, Some(1));
    assert!(!hub.is_online(1));
    bob.assert_quiet().await;
}

#[tokio::test]
async fn test_call_to_offline_user_fails_cleanly() {
    let hub = Arc::new(Hub::new());
    let mut alice = Client::connect(&hub, 1);

    assert!(hub.initiate(1, 3, CallKind::Audio).is_err());
    assert!(hub.calls().is_empty());
    assert!(!hub.is_online(3));
    alice.assert_quiet().await;
}

#[tokio::test]
async fn test_second_accept_is_a_no_op() {
    let hub = Arc::new(Hub::new());
    let mut alice = Client::connect(&hub, 1);
    let mut bob = Client::connect(&hub, 2);

    let session = hub.initiate(1, 2, CallKind::Video).unwrap();
    let call_id = session.id.to_string();
    bob.next().await;

    bob.peer.send(&call_response(&call_id, "accept"));
    bob.peer.send(&call_response(&call_id, "accept"));
    bob.peer.send(&call_response(&call_id, "reject"));

    assert!(matches!(alice.next().await, ServerEvent::CallAccepted { .. }));
    // Bob's loop handles frames in order, so his pong proves the rest were seen
    bob.assert_quiet().await;
    alice.assert_quiet().await;
    assert_eq!(hub.call(&session.id).unwrap().status, CallStatus::Active);
}

#[tokio::test]
async fn test_caller_cannot_answer_own_call() {
    let hub = Arc::new(Hub::new());
    let mut alice = Client::connect(&hub, 1);
    let mut bob = Client::connect(&hub, 2);

    let session = hub.initiate(1, 2, CallKind::Audio).unwrap();
    bob.next().await;

    alice.peer.send(&call_response(session.id.as_str(), "accept"));
    alice.assert_quiet().await;
    bob.assert_quiet().await;
    assert_eq!(hub.call(&session.id).unwrap().status, CallStatus::Ringing);
}

#[tokio::test]
async fn test_reject_notifies_caller() {
    let hub = Arc::new(Hub::new());
    let mut alice = Client::connect(&hub, 1);
    let mut bob = Client::connect(&hub, 2);

    let session = hub.initiate(1, 2, CallKind::Audio).unwrap();
    bob.next().await;
    bob.peer.send(&call_response(session.id.as_str(), "REJECT"));

    assert_eq!(
        alice.next().await,
        ServerEvent::CallRejected {
            call_id: session.id.to_string(),
        }
    );
    assert_eq!(hub.call(&session.id).unwrap().status, CallStatus::Rejected);

    // Rejected is terminal: a later disconnect does not notify anyone
    assert_eq!(bob.close().await, CloseReason::ClientClosed);
    alice.assert_quiet().await;
}

#[tokio::test]
async fn test_non_participant_disconnect_leaves_call_alone() {
    let hub = Arc::new(Hub::new());
    let mut alice = Client::connect(&hub, 1);
    let mut bob = Client::connect(&hub, 2);
    let carol = Client::connect(&hub, 3);

    let session = hub.initiate(1, 2, CallKind::Audio).unwrap();
    bob.next().await;
    hub.respond(&session.id, 2, CallDecision::Accept).unwrap();
    alice.next().await;

    carol.close().await;
    assert_eq!(hub.call(&session.id).unwrap().status, CallStatus::Active);
    alice.assert_quiet().await;
    bob.assert_quiet().await;
}

#[tokio::test]
async fn test_ringing_call_cancelled_by_callee_disconnect() {
    let hub = Arc::new(Hub::new());
    let mut alice = Client::connect(&hub, 1);
    let bob = Client::connect(&hub, 2);

    let session = hub.initiate(1, 2, CallKind::Audio).unwrap();
    bob.close().await;

    assert_eq!(
        alice.next().await,
        ServerEvent::CallEnded {
            call_id: session.id.to_string(),
            ended_by: 2,
        }
    );
    assert!(hub.active_calls(1).is_empty());
}

#[tokio::test]
async fn test_duplicate_disconnect_ends_calls_once() {
    let hub = Arc::new(Hub::new());
    let mut alice = Client::connect(&hub, 1);
    let mut bob = Client::connect(&hub, 2);

    let session = hub.initiate(1, 2, CallKind::Audio).unwrap();
    bob.next().await;
    hub.respond(&session.id, 2, CallDecision::Accept).unwrap();
    alice.next().await;

    // Explicit cleanup first, then the physical close of the same connection
    assert!(hub.disconnect_user(1));
    assert!(!hub.disconnect_user(1));
    assert_eq!(alice.close().await, CloseReason::Evicted);

    assert!(matches!(bob.next().await, ServerEvent::CallEnded { ended_by: 1, .. }));
    bob.assert_quiet().await;
}

#[tokio::test]
async fn test_malformed_frames_do_not_end_the_loop() {
    let hub = Arc::new(Hub::new());
    let mut alice = Client::connect(&hub, 1);

    alice.peer.send_raw("{{{");
    assert!(matches!(alice.next().await, ServerEvent::Error { code: 1001, .. }));
    alice.peer.send_raw(r#"{"recipientId": 2}"#);
    assert!(matches!(alice.next().await, ServerEvent::Error { .. }));

    alice.assert_quiet().await;
    assert!(hub.is_online(1));
}

#[tokio::test]
async fn test_typing_and_signal_relay() {
    let hub = Arc::new(Hub::new());
    let mut alice = Client::connect(&hub, 1);
    let mut bob = Client::connect(&hub, 2);

    alice.peer.send_raw(r#"{"type":"typing","recipientId":2}"#);
    assert_eq!(bob.next().await, ServerEvent::Typing { user_id: 1 });

    let offer = json!({"kind": "offer", "sdp": "v=0"});
    alice.peer.send(&ClientEvent::WebrtcSignal {
        recipient: Some(2),
        payload: offer.clone(),
        extra: Map::new(),
    });
    assert_eq!(
        bob.next().await,
        ServerEvent::WebrtcSignal {
            sender: 1,
            payload: offer,
            extra: Map::new(),
        }
    );

    // Fields beside the payload are relayed too, but the sender is not forgeable
    alice.peer.send_raw(
        r#"{"type":"webrtc_signal","recipient":2,"kind":"candidate","candidate":"c1","sender":9}"#,
    );
    match bob.next().await {
        ServerEvent::WebrtcSignal {
            sender,
            payload,
            extra,
        } => {
            assert_eq!(sender, 1);
            assert_eq!(payload, Value::Null);
            assert_eq!(extra.get("kind"), Some(&json!("candidate")));
            assert_eq!(extra.get("candidate"), Some(&json!("c1")));
            assert!(!extra.contains_key("sender"));
        }
        other => panic!("Expected webrtc_signal, got {:?}", other),
    }

    // Missing, malformed or offline recipients are dropped silently
    alice.peer.send_raw(r#"{"type":"typing"}"#);
    alice.peer.send_raw(r#"{"type":"typing","recipientId":"bob"}"#);
    alice.peer.send_raw(r#"{"type":"webrtc_signal","recipient":7,"payload":{}}"#);
    alice.assert_quiet().await;
    bob.assert_quiet().await;
}

#[tokio::test]
async fn test_reconnect_supersedes_without_cascade() {
    let hub = Arc::new(Hub::new());
    let mut alice = Client::connect(&hub, 1);
    let old_bob = Client::connect(&hub, 2);

    let session = hub.initiate(1, 2, CallKind::Audio).unwrap();
    let mut new_bob = Client::connect(&hub, 2);

    // The old connection saw the ring; traffic now goes to the new one
    hub.deliver(2, ServerEvent::Typing { user_id: 1 });
    assert_eq!(new_bob.next().await, ServerEvent::Typing { user_id: 1 });

    old_bob.close().await;
    assert!(hub.is_online(2));
    assert_eq!(hub.call(&session.id).unwrap().status, CallStatus::Ringing);
    alice.assert_quiet().await;

    new_bob.peer.send(&call_response(session.id.as_str(), "accept"));
    assert!(matches!(alice.next().await, ServerEvent::CallAccepted { .. }));
}

#[tokio::test]
async fn test_chat_message_pushed_live() {
    let hub = Arc::new(Hub::new());
    let mut bob = Client::connect(&hub, 2);

    let (message, delivered) = hub.send_chat(1, 2, "hello", None);
    assert!(delivered);
    assert_eq!(bob.next().await, ServerEvent::NewMessage { message });
}

#[tokio::test(start_paused = true)]
async fn test_idle_connection_is_closed_and_cleaned_up() {
    let hub = Arc::new(Hub::new());
    let mut alice = Client::connect(&hub, 1);
    let (conn, _idle_peer) = memory::pair();
    let config = HandlerConfig {
        idle_timeout: Some(Duration::from_secs(10)),
    };
    let idle_task = tokio::spawn(ConnectionLoop::open(hub.clone(), 2, conn, config).run());

    let session = hub.initiate(1, 2, CallKind::Audio).unwrap();
    assert_eq!(idle_task.await.unwrap(), CloseReason::Idle);

    assert_eq!(
        alice.next().await,
        ServerEvent::CallEnded {
            call_id: session.id.to_string(),
            ended_by: 2,
        }
    );
    assert!(!hub.is_online(2));
}
