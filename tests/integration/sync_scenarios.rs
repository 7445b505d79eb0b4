// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc
)]

//! Synchronization scenarios over loopback transports with a paused clock.
//!
//! These tests validate:
//! - A timed-out send fails and is retried under a fresh temporary id
//! - A send made while the server is unreachable waits for it to return
//!   and only fails once the send timeout runs out
//! - Pushed and paged copies of the same messages merge without duplicates
//! - A push echo that overtakes its acknowledgment is folded, not duplicated
//! - An echo naming its request confirms the send even if the ack is lost
//! - Receipts advance delivery and never regress it
//! - A server refusal on the push channel turns the conversation read-only

use std::sync::Arc;
use std::time::Duration;

use matchchat::chat::delivery::DeliveryState;
use matchchat::chat::store::{Direction, MessageKey};
use matchchat::chat::{Access, ChatConfig, ChatEngine, ChatError, ChatEvent, EngineTasks, LoadOutcome};
use matchchat::environment::{Environment, EnvironmentHandle, EnvironmentState};
use matchchat::transport::ConnectionState;
use matchchat::transport::loopback::{FallbackMode, LoopbackFallback, LoopbackPush, LoopbackServer};
use matchchat::transport::manager::{ManagerConfig, TransportManager};
use matchchat_proto::api::{ApiError, ErrorCode};
use matchchat_proto::event::{ClientEvent, PushedMessage, ReceiptState, SendAck, ServerEvent};
use matchchat_proto::message::{MessageId, PeerId, TempId, Timestamp, WireMessage};
use tokio::sync::mpsc;

fn alice() -> PeerId {
    PeerId::new("alice")
}

fn bob() -> PeerId {
    PeerId::new("bob")
}

fn wire(id: &str, from: &PeerId, to: &PeerId, at: u64) -> WireMessage {
    WireMessage {
        id: MessageId::new(id),
        from: from.clone(),
        to: to.clone(),
        body: format!("body of {id}"),
        at: Timestamp::from_millis(at),
        reply_to_id: None,
    }
}

struct Harness {
    engine: Arc<ChatEngine<LoopbackPush, LoopbackFallback>>,
    events: mpsc::Receiver<ChatEvent>,
    server: Arc<LoopbackServer>,
    fallback: LoopbackFallback,
    _env: EnvironmentHandle,
    _tasks: EngineTasks,
}

impl Harness {
    async fn start(reachable: bool) -> Self {
        let (push, server) = LoopbackPush::create_pair();
        server.set_reachable(reachable);
        let fallback = LoopbackFallback::new(alice());
        let (transport, transport_events) =
            TransportManager::new(push, fallback.clone(), ManagerConfig::default(), 64);
        let (engine, events) =
            ChatEngine::new(Arc::new(transport), alice(), bob(), ChatConfig::default());
        let engine = Arc::new(engine);
        let (env, environment) = Environment::channel(EnvironmentState::default());
        let tasks = engine.start(transport_events, environment).await;
        let mut harness = Self {
            engine,
            events,
            server: Arc::new(server),
            fallback,
            _env: env,
            _tasks: tasks,
        };
        if reachable {
            harness
                .next_event(|e| *e == ChatEvent::ConnectionChanged(ConnectionState::Up))
                .await;
        }
        harness
    }

    /// Wait for the first event matching `pred`, discarding the rest.
    async fn next_event(&mut self, mut pred: impl FnMut(&ChatEvent) -> bool) -> ChatEvent {
        tokio::time::timeout(Duration::from_secs(60), async {
            loop {
                let event = self.events.recv().await.expect("engine event channel closed");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("expected event did not arrive")
    }
}

#[tokio::test(start_paused = true)]
async fn timed_out_send_fails_then_retry_confirms() {
    let mut h = Harness::start(false).await;
    h.fallback.set_mode(FallbackMode::Hang);

    let engine = Arc::clone(&h.engine);
    let send = tokio::spawn(async move { engine.send_text("are you there?").await });

    let ChatEvent::MessageInserted {
        key: MessageKey::Pending(temp),
        ..
    } = h.next_event(|e| matches!(e, ChatEvent::MessageInserted { .. })).await
    else {
        panic!("optimistic insert expected");
    };
    assert_eq!(
        h.engine.message(&MessageKey::Pending(temp)).unwrap().delivery,
        DeliveryState::Sending
    );

    assert_eq!(send.await.unwrap(), Err(ChatError::TransportTimeout));
    h.next_event(|e| {
        *e == ChatEvent::DeliveryChanged {
            key: MessageKey::Pending(temp),
            state: DeliveryState::Failed,
        }
    })
    .await;

    // The old temporary id is gone once the retry replaced it.
    h.fallback.set_mode(FallbackMode::Up);
    let id = h.engine.retry(temp).await.unwrap();
    assert_eq!(
        h.engine.retry(temp).await,
        Err(ChatError::NotFound(MessageKey::Pending(temp)))
    );

    h.next_event(|e| {
        *e == ChatEvent::MessageRemoved {
            key: MessageKey::Pending(temp),
        }
    })
    .await;
    let ChatEvent::MessageInserted {
        key: MessageKey::Pending(retried),
        ..
    } = h.next_event(|e| matches!(e, ChatEvent::MessageInserted { .. })).await
    else {
        panic!("retry must insert a fresh optimistic entry");
    };
    assert_ne!(retried, temp);
    h.next_event(|e| matches!(e, ChatEvent::MessageReconciled { temp_id, .. } if *temp_id == retried))
        .await;

    let messages = h.engine.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].key, MessageKey::Confirmed(id));
    assert_eq!(messages[0].delivery, DeliveryState::Sent);
    assert_eq!(messages[0].payload.as_text(), Some("are you there?"));
    assert_eq!(h.fallback.send_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn unreachable_send_fails_at_timeout_then_retry_confirms() {
    let mut h = Harness::start(false).await;
    h.fallback.set_mode(FallbackMode::Down);

    let started = tokio::time::Instant::now();
    let engine = Arc::clone(&h.engine);
    let send = tokio::spawn(async move { engine.send_text("anyone?").await });

    let ChatEvent::MessageInserted {
        key: MessageKey::Pending(temp),
        ..
    } = h.next_event(|e| matches!(e, ChatEvent::MessageInserted { .. })).await
    else {
        panic!("optimistic insert expected");
    };

    // Still pending well past the first failed attempt.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!send.is_finished());
    assert_eq!(
        h.engine.message(&MessageKey::Pending(temp)).unwrap().delivery,
        DeliveryState::Sending
    );

    assert_eq!(send.await.unwrap(), Err(ChatError::TransportTimeout));
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert!(h.fallback.send_calls() >= 2);
    h.next_event(|e| {
        *e == ChatEvent::DeliveryChanged {
            key: MessageKey::Pending(temp),
            state: DeliveryState::Failed,
        }
    })
    .await;

    h.fallback.set_mode(FallbackMode::Up);
    let id = h.engine.retry(temp).await.unwrap();
    let messages = h.engine.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].key, MessageKey::Confirmed(id));
    assert_eq!(messages[0].delivery, DeliveryState::Sent);
}

#[tokio::test(start_paused = true)]
async fn send_goes_out_when_server_returns_within_timeout() {
    let mut h = Harness::start(false).await;
    h.fallback.set_mode(FallbackMode::Down);

    let engine = Arc::clone(&h.engine);
    let send = tokio::spawn(async move { engine.send_text("back soon").await });
    h.next_event(|e| matches!(e, ChatEvent::MessageInserted { .. })).await;

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!send.is_finished());
    h.fallback.set_mode(FallbackMode::Up);

    let id = send.await.unwrap().unwrap();
    let messages = h.engine.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].key, MessageKey::Confirmed(id));
    assert_eq!(messages[0].delivery, DeliveryState::Sent);
    assert_eq!(h.fallback.log().len(), 1, "stored exactly once");
}

#[tokio::test(start_paused = true)]
async fn pushed_and_paged_copies_merge_in_order() {
    let mut h = Harness::start(true).await;
    let (me, peer) = (alice(), bob());

    // Same timestamp; the id breaks the tie.
    let m_a = wire("m_a", &peer, &me, 2_000);
    let m_b = wire("m_b", &peer, &me, 2_000);
    let m_x = wire("m_x", &me, &peer, 1_000);
    h.fallback.seed([m_x, m_a.clone(), m_b.clone()]);

    h.server.push(ServerEvent::New(m_b.into()));
    h.server.push(ServerEvent::New(m_a.into()));
    for _ in 0..2 {
        h.next_event(|e| matches!(e, ChatEvent::MessageInserted { .. })).await;
    }

    let outcome = h.engine.load_older().await.unwrap();
    assert_eq!(
        outcome,
        LoadOutcome::Loaded {
            inserted: 1,
            has_more: false,
            scroll_delta: 1.0,
        }
    );

    let ids: Vec<_> = h.engine.messages().into_iter().map(|m| m.key.to_string()).collect();
    assert_eq!(ids, ["m_x", "m_a", "m_b"]);
    let directions: Vec<_> = h.engine.messages().into_iter().map(|m| m.direction).collect();
    assert_eq!(
        directions,
        [Direction::Outgoing, Direction::Incoming, Direction::Incoming]
    );
}

#[tokio::test(start_paused = true)]
async fn echo_before_ack_leaves_one_entry() {
    let mut h = Harness::start(true).await;

    let server = Arc::clone(&h.server);
    let responder = tokio::spawn(async move {
        loop {
            match server.next_client_event().await {
                Some(ClientEvent::Send {
                    request_id,
                    to,
                    body,
                    reply_to_id,
                }) => {
                    let item = WireMessage {
                        id: MessageId::new("m_echo"),
                        from: alice(),
                        to,
                        body,
                        at: Timestamp::now(),
                        reply_to_id,
                    };
                    return (request_id, item);
                }
                Some(_) => {}
                None => panic!("client went away"),
            }
        }
    });

    let engine = Arc::clone(&h.engine);
    let send = tokio::spawn(async move { engine.send_text("racing").await });
    let (request_id, item) = responder.await.unwrap();

    h.server.push(ServerEvent::New(item.clone().into()));
    h.next_event(|e| {
        matches!(e, ChatEvent::MessageInserted { key, .. } if *key == MessageKey::Confirmed(item.id.clone()))
    })
    .await;
    assert_eq!(h.engine.messages().len(), 2);

    h.server.push(ServerEvent::Ack(SendAck::confirmed(request_id, item.clone())));
    assert_eq!(send.await.unwrap(), Ok(item.id.clone()));

    let messages = h.engine.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].key, MessageKey::Confirmed(item.id));
    assert_eq!(messages[0].direction, Direction::Outgoing);
}

/// Wait for the client's `message:send` and build the server's copy of it.
async fn capture_send(server: &LoopbackServer) -> (String, WireMessage) {
    loop {
        match server.next_client_event().await {
            Some(ClientEvent::Send {
                request_id,
                to,
                body,
                reply_to_id,
            }) => {
                let item = WireMessage {
                    id: MessageId::new("m_echo"),
                    from: alice(),
                    to,
                    body,
                    at: Timestamp::now(),
                    reply_to_id,
                };
                return (request_id, item);
            }
            Some(_) => {}
            None => panic!("client went away"),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn echo_confirms_send_when_ack_is_lost() {
    let mut h = Harness::start(true).await;

    let engine = Arc::clone(&h.engine);
    let send = tokio::spawn(async move { engine.send_text("lossy").await });
    let (request_id, item) = capture_send(&h.server).await;

    // The ack never arrives; only the echo does.
    h.server
        .push(ServerEvent::New(PushedMessage::echo(item.clone(), request_id)));
    assert_eq!(send.await.unwrap(), Ok(item.id.clone()));
    h.next_event(|e| matches!(e, ChatEvent::MessageReconciled { id, .. } if *id == item.id))
        .await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    let messages = h.engine.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].key, MessageKey::Confirmed(item.id));
    assert_eq!(messages[0].delivery, DeliveryState::Sent);
}

#[tokio::test(start_paused = true)]
async fn late_echo_confirms_a_timed_out_send() {
    let mut h = Harness::start(true).await;

    let engine = Arc::clone(&h.engine);
    let send = tokio::spawn(async move { engine.send_text("slow network").await });
    let (request_id, item) = capture_send(&h.server).await;
    let temp = TempId::parse(&request_id).unwrap();

    assert_eq!(send.await.unwrap(), Err(ChatError::TransportTimeout));
    assert_eq!(
        h.engine.message(&MessageKey::Pending(temp)).unwrap().delivery,
        DeliveryState::Failed
    );

    h.server
        .push(ServerEvent::New(PushedMessage::echo(item.clone(), request_id)));
    h.next_event(|e| matches!(e, ChatEvent::MessageReconciled { temp_id, .. } if *temp_id == temp))
        .await;

    let messages = h.engine.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].key, MessageKey::Confirmed(item.id));
    assert_eq!(messages[0].delivery, DeliveryState::Sent);
}

#[tokio::test(start_paused = true)]
async fn receipts_advance_and_never_regress() {
    let mut h = Harness::start(false).await;
    let id = h.engine.send_text("hi").await.unwrap();
    let key = MessageKey::Confirmed(id.clone());

    // Push the receipts through the live channel once it comes up.
    h.server.set_reachable(true);
    h.next_event(|e| *e == ChatEvent::ConnectionChanged(ConnectionState::Up))
        .await;

    h.server.push(ServerEvent::Status {
        id: id.clone(),
        state: ReceiptState::Seen,
    });
    h.next_event(|e| {
        *e == ChatEvent::DeliveryChanged {
            key: key.clone(),
            state: DeliveryState::Seen,
        }
    })
    .await;

    h.server.push(ServerEvent::Status {
        id,
        state: ReceiptState::Delivered,
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.engine.message(&key).unwrap().delivery, DeliveryState::Seen);
}

#[tokio::test(start_paused = true)]
async fn refusal_on_push_channel_blocks_composing() {
    let mut h = Harness::start(true).await;

    h.server
        .push(ServerEvent::Error(ApiError::new(ErrorCode::NoRelationship)));
    h.next_event(|e| *e == ChatEvent::Blocked).await;

    let conversation = h.engine.conversation();
    assert_eq!(conversation.access, Access::Blocked);
    assert!(!conversation.has_more);
    assert_eq!(h.engine.send_text("hello?").await, Err(ChatError::Blocked));
    assert!(h.engine.messages().is_empty());
    assert_eq!(h.fallback.send_calls(), 0);
}
