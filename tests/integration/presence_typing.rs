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

//! Typing presence and seen receipts over loopback transports with a paused clock.
//!
//! These tests validate:
//! - A peer typing signal shows the indicator, which decays on its own
//! - Repeated signals extend the indicator; a message from the peer clears it
//! - Signals from other users are ignored
//! - Outbound typing is debounced and never sent while the push channel is down
//! - Seen receipts wait until the conversation is visible

use std::sync::Arc;
use std::time::Duration;

use matchchat::chat::delivery::DeliveryState;
use matchchat::chat::store::MessageKey;
use matchchat::chat::{ChatConfig, ChatEngine, ChatEvent, EngineTasks};
use matchchat::environment::{Environment, EnvironmentHandle, EnvironmentState};
use matchchat::transport::ConnectionState;
use matchchat::transport::loopback::{LoopbackFallback, LoopbackPush, LoopbackServer};
use matchchat::transport::manager::{ManagerConfig, TransportManager};
use matchchat_proto::event::{ClientEvent, PushedMessage, ServerEvent};
use matchchat_proto::message::{MessageId, PeerId, Timestamp, WireMessage};
use tokio::sync::mpsc;
use tokio::time::Instant;

fn alice() -> PeerId {
    PeerId::new("alice")
}

fn bob() -> PeerId {
    PeerId::new("bob")
}

fn typing_from(peer: PeerId) -> ServerEvent {
    ServerEvent::Typing { peer_id: peer }
}

struct Harness {
    engine: Arc<ChatEngine<LoopbackPush, LoopbackFallback>>,
    events: mpsc::Receiver<ChatEvent>,
    server: LoopbackServer,
    env: EnvironmentHandle,
    _tasks: EngineTasks,
}

impl Harness {
    async fn start(visible: bool) -> Self {
        let (push, server) = LoopbackPush::create_pair();
        let fallback = LoopbackFallback::new(alice());
        let (transport, transport_events) =
            TransportManager::new(push, fallback, ManagerConfig::default(), 64);
        let (engine, events) =
            ChatEngine::new(Arc::new(transport), alice(), bob(), ChatConfig::default());
        let engine = Arc::new(engine);
        let (env, environment) = Environment::channel(EnvironmentState {
            online: true,
            visible,
        });
        let tasks = engine.start(transport_events, environment).await;
        let mut harness = Self {
            engine,
            events,
            server,
            env,
            _tasks: tasks,
        };
        harness
            .next_event(|e| *e == ChatEvent::ConnectionChanged(ConnectionState::Up))
            .await;
        harness
    }

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

    async fn typing(&mut self, typing: bool) {
        self.next_event(|e| *e == ChatEvent::TypingChanged { typing })
            .await;
    }

    fn typing_signals_sent(&self) -> usize {
        std::iter::from_fn(|| self.server.try_client_event())
            .filter(|e| matches!(e, ClientEvent::Typing { .. }))
            .count()
    }
}

#[tokio::test(start_paused = true)]
async fn typing_indicator_decays() {
    let mut h = Harness::start(true).await;

    h.server.push(typing_from(bob()));
    h.typing(true).await;
    let shown = Instant::now();
    assert!(h.engine.conversation().typing_until.is_some());

    h.typing(false).await;
    assert!(shown.elapsed() >= Duration::from_millis(1200));
    assert!(h.engine.conversation().typing_until.is_none());
}

#[tokio::test(start_paused = true)]
async fn repeated_signals_extend_the_indicator() {
    let mut h = Harness::start(true).await;

    h.server.push(typing_from(bob()));
    h.typing(true).await;
    let shown = Instant::now();

    tokio::time::sleep(Duration::from_millis(800)).await;
    h.server.push(typing_from(bob()));

    h.typing(false).await;
    assert!(shown.elapsed() >= Duration::from_millis(2000));

    // Only one "started" for the whole burst.
    let mut extra_starts = 0;
    while let Ok(event) = h.events.try_recv() {
        if event == (ChatEvent::TypingChanged { typing: true }) {
            extra_starts += 1;
        }
    }
    assert_eq!(extra_starts, 0);
}

#[tokio::test(start_paused = true)]
async fn message_from_peer_clears_typing() {
    let mut h = Harness::start(true).await;

    h.server.push(typing_from(bob()));
    h.typing(true).await;
    let shown = Instant::now();

    h.server.push(ServerEvent::New(PushedMessage::from(WireMessage {
        id: MessageId::new("m1"),
        from: bob(),
        to: alice(),
        body: "done typing".into(),
        at: Timestamp::now(),
        reply_to_id: None,
    })));
    h.typing(false).await;
    assert!(shown.elapsed() < Duration::from_millis(1200));
    assert!(h.engine.conversation().typing_until.is_none());
}

#[tokio::test(start_paused = true)]
async fn typing_from_other_users_is_ignored() {
    let mut h = Harness::start(true).await;

    h.server.push(typing_from(PeerId::new("carol")));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.engine.conversation().typing_until.is_none());
    while let Ok(event) = h.events.try_recv() {
        assert!(!matches!(event, ChatEvent::TypingChanged { .. }));
    }
}

#[tokio::test(start_paused = true)]
async fn outbound_typing_is_debounced() {
    let h = Harness::start(true).await;
    assert_eq!(h.typing_signals_sent(), 0);

    // Twenty keystrokes over two seconds with an 800 ms window.
    for _ in 0..20 {
        h.engine.on_keystroke().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(h.typing_signals_sent(), 3);
}

#[tokio::test(start_paused = true)]
async fn sending_reopens_the_typing_window() {
    let h = Harness::start(true).await;
    let _ = h.typing_signals_sent();

    h.engine.on_keystroke().await;
    // The send goes out over the push channel; nobody acks it here.
    let engine = Arc::clone(&h.engine);
    let _send = tokio::spawn(async move { engine.send_text("hi").await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    h.engine.on_keystroke().await;

    assert_eq!(h.typing_signals_sent(), 2);
}

#[tokio::test(start_paused = true)]
async fn no_typing_signals_while_down() {
    let mut h = Harness::start(true).await;
    h.server.set_reachable(false);
    h.server.drop_connection();
    h.next_event(|e| *e == ChatEvent::ConnectionChanged(ConnectionState::Down))
        .await;
    let _ = h.typing_signals_sent();

    h.engine.on_keystroke().await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    h.engine.on_keystroke().await;
    assert_eq!(h.typing_signals_sent(), 0);
}

#[tokio::test(start_paused = true)]
async fn seen_receipts_wait_for_visibility() {
    let mut h = Harness::start(false).await;
    let id = MessageId::new("m1");
    let key = MessageKey::Confirmed(id.clone());

    h.server.push(ServerEvent::New(PushedMessage::from(WireMessage {
        id: id.clone(),
        from: bob(),
        to: alice(),
        body: "hello?".into(),
        at: Timestamp::now(),
        reply_to_id: None,
    })));
    h.next_event(|e| matches!(e, ChatEvent::MessageInserted { .. }))
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.engine.message(&key).unwrap().delivery, DeliveryState::Delivered);
    let early: Vec<_> = std::iter::from_fn(|| h.server.try_client_event())
        .filter(|e| matches!(e, ClientEvent::Seen { .. }))
        .collect();
    assert!(early.is_empty());

    h.env.set_visible(true);
    let seen = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match h.server.next_client_event().await {
                Some(ClientEvent::Seen { peer_id, ids }) => return (peer_id, ids),
                Some(_) => {}
                None => panic!("client went away"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(seen, (bob(), vec![id]));

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.engine.message(&key).unwrap().delivery, DeliveryState::Seen);
}
