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

//! Push channel supervision over loopback transports with a paused clock.
//!
//! These tests validate:
//! - A dropped connection is reported, re-established, re-announced, and
//!   followed by a resync of the newest history
//! - A gap longer than one page is paged back until it meets known history
//! - Sends made while the push channel is down go through the fallback
//! - No connection is attempted while offline; coming online connects at once

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

fn alice() -> PeerId {
    PeerId::new("alice")
}

fn bob() -> PeerId {
    PeerId::new("bob")
}

struct Harness {
    engine: Arc<ChatEngine<LoopbackPush, LoopbackFallback>>,
    events: mpsc::Receiver<ChatEvent>,
    server: LoopbackServer,
    fallback: LoopbackFallback,
    env: EnvironmentHandle,
    _tasks: EngineTasks,
}

impl Harness {
    async fn start(config: ChatConfig, initial: EnvironmentState) -> Self {
        let (push, server) = LoopbackPush::create_pair();
        let fallback = LoopbackFallback::new(alice());
        let (transport, transport_events) =
            TransportManager::new(push, fallback.clone(), ManagerConfig::default(), 64);
        let (engine, events) = ChatEngine::new(Arc::new(transport), alice(), bob(), config);
        let engine = Arc::new(engine);
        let (env, environment) = Environment::channel(initial);
        let tasks = engine.start(transport_events, environment).await;
        Self {
            engine,
            events,
            server,
            fallback,
            env,
            _tasks: tasks,
        }
    }

    async fn online() -> Self {
        let mut harness = Self::start(ChatConfig::default(), EnvironmentState::default()).await;
        harness.wait_connection(ConnectionState::Up).await;
        harness
    }

    async fn next_event(&mut self, mut pred: impl FnMut(&ChatEvent) -> bool) -> ChatEvent {
        tokio::time::timeout(Duration::from_secs(120), async {
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

    async fn wait_connection(&mut self, state: ConnectionState) {
        self.next_event(|e| *e == ChatEvent::ConnectionChanged(state))
            .await;
    }

    /// Everything the client emitted so far.
    fn drain_client_events(&self) -> Vec<ClientEvent> {
        std::iter::from_fn(|| self.server.try_client_event()).collect()
    }
}

fn handshake() -> Vec<ClientEvent> {
    vec![
        ClientEvent::Identify { self_id: alice() },
        ClientEvent::Join { peer_id: bob() },
    ]
}

#[tokio::test(start_paused = true)]
async fn dropped_connection_reconnects_and_resyncs() {
    let mut h = Harness::online().await;
    assert_eq!(h.drain_client_events(), handshake());
    assert_eq!(h.server.connect_count(), 1);

    // Something arrives while the push channel is gone.
    h.fallback.seed([WireMessage {
        id: MessageId::new("m_missed"),
        from: bob(),
        to: alice(),
        body: "you missed this".into(),
        at: Timestamp::from_millis(5_000),
        reply_to_id: None,
    }]);

    h.server.drop_connection();
    h.wait_connection(ConnectionState::Down).await;
    assert_eq!(h.engine.conversation().connection_state, ConnectionState::Down);

    h.wait_connection(ConnectionState::Up).await;
    assert_eq!(h.server.connect_count(), 2);

    h.next_event(|e| matches!(e, ChatEvent::HistoryPrepended { inserted: 1, .. }))
        .await;
    assert_eq!(h.fallback.history_calls(), 1);
    let missed = h
        .engine
        .message(&MessageKey::Confirmed(MessageId::new("m_missed")))
        .unwrap();
    assert_eq!(missed.payload.as_text(), Some("you missed this"));
    // Resync leaves paging alone.
    assert!(h.engine.conversation().oldest_cursor.is_none());

    // Identity and conversation are announced again on the new connection.
    let replayed: Vec<_> = h
        .drain_client_events()
        .into_iter()
        .filter(|e| matches!(e, ClientEvent::Identify { .. } | ClientEvent::Join { .. }))
        .collect();
    assert_eq!(replayed, handshake());
}

#[tokio::test(start_paused = true)]
async fn resync_pages_back_across_a_long_gap() {
    let mut h = Harness::online().await;

    let live = WireMessage {
        id: MessageId::new("m_live"),
        from: bob(),
        to: alice(),
        body: "before the drop".into(),
        at: Timestamp::from_millis(1_000),
        reply_to_id: None,
    };
    h.fallback.seed([live.clone()]);
    h.server.push(ServerEvent::New(PushedMessage::from(live)));
    h.next_event(|e| matches!(e, ChatEvent::MessageInserted { .. }))
        .await;

    h.server.set_reachable(false);
    h.server.drop_connection();
    h.wait_connection(ConnectionState::Down).await;
    // More than two pages arrive while disconnected.
    h.fallback.seed((0..70u64).map(|i| WireMessage {
        id: MessageId::new(format!("gap{i:02}")),
        from: bob(),
        to: alice(),
        body: format!("missed {i}"),
        at: Timestamp::from_millis(2_000 + i * 10),
        reply_to_id: None,
    }));
    h.server.set_reachable(true);
    h.wait_connection(ConnectionState::Up).await;

    h.next_event(|e| matches!(e, ChatEvent::HistoryPrepended { inserted: 70, .. }))
        .await;
    assert_eq!(h.fallback.history_calls(), 3);

    let ids: Vec<_> = h
        .engine
        .messages()
        .into_iter()
        .map(|m| m.key.to_string())
        .collect();
    assert_eq!(ids.len(), 71);
    assert_eq!(ids[0], "m_live");
    assert_eq!(ids[1], "gap00");
    assert_eq!(ids[70], "gap69");
    assert!(h.engine.conversation().oldest_cursor.is_none());
}

#[tokio::test(start_paused = true)]
async fn resync_can_be_disabled() {
    let config = ChatConfig {
        resync_on_reconnect: false,
        ..ChatConfig::default()
    };
    let mut h = Harness::start(config, EnvironmentState::default()).await;
    h.wait_connection(ConnectionState::Up).await;

    h.server.drop_connection();
    h.wait_connection(ConnectionState::Down).await;
    h.wait_connection(ConnectionState::Up).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.fallback.history_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn sends_use_fallback_while_push_is_down() {
    let mut h = Harness::online().await;
    h.server.set_reachable(false);
    h.server.drop_connection();
    h.wait_connection(ConnectionState::Down).await;
    h.drain_client_events();

    let id = h.engine.send_text("via fallback").await.unwrap();
    assert_eq!(h.fallback.send_calls(), 1);
    assert_eq!(
        h.engine.message(&MessageKey::Confirmed(id)).unwrap().delivery,
        DeliveryState::Sent
    );

    h.server.set_reachable(true);
    h.wait_connection(ConnectionState::Up).await;
    let sends = h
        .drain_client_events()
        .into_iter()
        .filter(|e| matches!(e, ClientEvent::Send { .. }))
        .count();
    assert_eq!(sends, 0, "nothing may be sent twice");
}

#[tokio::test(start_paused = true)]
async fn coming_online_connects_immediately() {
    let offline = EnvironmentState {
        online: false,
        visible: true,
    };
    let mut h = Harness::start(ChatConfig::default(), offline).await;

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.server.connect_count(), 0);
    assert_eq!(h.engine.conversation().connection_state, ConnectionState::Down);

    let before = tokio::time::Instant::now();
    h.env.set_online(true);
    h.wait_connection(ConnectionState::Up).await;
    assert_eq!(h.server.connect_count(), 1);
    assert!(before.elapsed() < Duration::from_millis(10));
}

#[tokio::test(start_paused = true)]
async fn coming_online_cuts_backoff_short() {
    let mut h = Harness::online().await;
    h.server.set_reachable(false);
    h.server.drop_connection();
    h.wait_connection(ConnectionState::Down).await;

    // Let several attempts fail so the backoff grows.
    tokio::time::sleep(Duration::from_secs(20)).await;
    h.server.set_reachable(true);
    h.env.set_online(false);
    h.env.set_online(true);

    let before = tokio::time::Instant::now();
    h.wait_connection(ConnectionState::Up).await;
    assert!(before.elapsed() < Duration::from_millis(10));
}
