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

//! Request/response fallback against the in-process relay.
//!
//! The sender's push URL points at a closed port, so every send goes over
//! `POST send`. These tests validate:
//! - Fallback sends are confirmed and still pushed to a connected peer
//! - Older history pages over `GET history`
//! - Missing credentials surface as `unauthenticated`
//! - Uploads are stored, served back, and sent as attachment messages

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use matchchat::chat::composer::{Draft, MessageKind, Payload};
use matchchat::chat::delivery::DeliveryState;
use matchchat::chat::store::MessageKey;
use matchchat::chat::{ChatConfig, ChatEngine, EngineTasks, LoadOutcome};
use matchchat::environment::Environment;
use matchchat::transport::http::HttpFallback;
use matchchat::transport::manager::{ManagerConfig, TransportManager};
use matchchat::transport::ws::WsPushChannel;
use matchchat::transport::{ConnectionState, Fallback, TransportError};
use matchchat::upload::{HttpUploader, PendingUpload, UploadFile};
use matchchat_proto::api::{ErrorCode, HistoryQuery, SendRequest};
use matchchat_proto::message::{MessageId, PeerId, Timestamp, WireMessage};
use matchchat_relay::relay::{self, RelayState};
use url::Url;

type Engine = ChatEngine<WsPushChannel, HttpFallback>;

struct Client {
    engine: Arc<Engine>,
    _tasks: EngineTasks,
}

async fn start_relay(state: Arc<RelayState>) -> SocketAddr {
    let (addr, _handle) = relay::start_server_with_state("127.0.0.1:0", state)
        .await
        .unwrap();
    addr
}

/// A local address nothing listens on.
async fn closed_port() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

async fn connect(push: SocketAddr, api: SocketAddr, me: &str, peer: &str, config: ChatConfig) -> Client {
    let push = WsPushChannel::with_timeout(
        Url::parse(&format!("ws://{push}/ws")).unwrap(),
        Duration::from_millis(500),
    );
    let fallback =
        HttpFallback::new(Url::parse(&format!("http://{api}")).unwrap(), PeerId::new(me)).unwrap();
    let (transport, transport_events) =
        TransportManager::new(push, fallback, ManagerConfig::default(), 64);
    let (engine, _events) = ChatEngine::new(
        Arc::new(transport),
        PeerId::new(me),
        PeerId::new(peer),
        config,
    );
    let engine = Arc::new(engine);
    let tasks = engine
        .start(transport_events, Environment::always_online())
        .await;
    Client {
        engine,
        _tasks: tasks,
    }
}

/// Poll `check` until it holds or five seconds pass.
async fn wait_for(what: &str, check: impl Fn() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn sends_fall_back_to_http_and_reach_the_peer() {
    let addr = start_relay(Arc::new(RelayState::new())).await;
    let dead = closed_port().await;

    let alice = connect(dead, addr, "alice", "bob", ChatConfig::default()).await;
    let bob = connect(addr, addr, "bob", "alice", ChatConfig::default()).await;
    wait_for("bob online", || {
        bob.engine.conversation().connection_state == ConnectionState::Up
    })
    .await;
    assert_eq!(
        alice.engine.conversation().connection_state,
        ConnectionState::Down
    );

    let id = alice.engine.send_text("over http").await.unwrap();
    let sent = alice.engine.message(&MessageKey::Confirmed(id.clone())).unwrap();
    assert!(matches!(
        sent.delivery,
        DeliveryState::Sent | DeliveryState::Delivered
    ));

    wait_for("bob to receive", || {
        bob.engine.message(&MessageKey::Confirmed(id.clone())).is_some()
    })
    .await;
}

#[tokio::test]
async fn older_history_pages_over_http() {
    let state = Arc::new(RelayState::new());
    for i in 0..12u64 {
        let (from, to) = if i % 2 == 0 { ("alice", "bob") } else { ("bob", "alice") };
        state
            .history
            .insert(WireMessage {
                id: MessageId::new(format!("h{i:02}")),
                from: PeerId::new(from),
                to: PeerId::new(to),
                body: format!("message {i}"),
                at: Timestamp::from_millis(1_000 + i),
                reply_to_id: None,
            })
            .await;
    }
    let addr = start_relay(state).await;
    let dead = closed_port().await;

    let config = ChatConfig {
        page_size: 5,
        ..ChatConfig::default()
    };
    let alice = connect(dead, addr, "alice", "bob", config).await;

    let mut loads = Vec::new();
    loop {
        match alice.engine.load_older().await.unwrap() {
            LoadOutcome::Loaded {
                inserted, has_more, ..
            } => {
                loads.push(inserted);
                if !has_more {
                    break;
                }
            }
            LoadOutcome::Skipped(skip) => panic!("unexpected skip: {skip:?}"),
        }
    }
    assert_eq!(loads, [5, 5, 2]);

    let ids: Vec<_> = alice
        .engine
        .messages()
        .into_iter()
        .map(|m| m.key.to_string())
        .collect();
    let expected: Vec<_> = (0..12).map(|i| format!("h{i:02}")).collect();
    assert_eq!(ids, expected);
}

#[tokio::test]
async fn empty_bearer_is_unauthenticated() {
    let addr = start_relay(Arc::new(RelayState::new())).await;
    let fallback =
        HttpFallback::new(Url::parse(&format!("http://{addr}/")).unwrap(), PeerId::new("")).unwrap();

    let result = fallback
        .send(&SendRequest {
            peer_id: PeerId::new("bob"),
            body: "hi".into(),
            reply_to_id: None,
        })
        .await;
    assert!(
        matches!(result, Err(TransportError::Rejected(ref e)) if e.error == ErrorCode::Unauthenticated && e.status == 401),
        "got {result:?}"
    );

    let result = fallback
        .history(&HistoryQuery {
            peer_id: PeerId::new("bob"),
            limit: 10,
            before_cursor: None,
        })
        .await;
    assert!(matches!(result, Err(TransportError::Rejected(ref e)) if e.error == ErrorCode::Unauthenticated));
}

#[tokio::test]
async fn uploaded_image_is_sent_as_attachment() {
    let addr = start_relay(Arc::new(RelayState::new())).await;
    let alice = connect(addr, addr, "alice", "bob", ChatConfig::default()).await;
    let bob = connect(addr, addr, "bob", "alice", ChatConfig::default()).await;
    wait_for("both online", || {
        alice.engine.conversation().connection_state == ConnectionState::Up
            && bob.engine.conversation().connection_state == ConnectionState::Up
    })
    .await;

    let api = Url::parse(&format!("http://{addr}")).unwrap();
    let uploader =
        HttpUploader::new(reqwest::Client::new(), &api, PeerId::new("alice")).unwrap();
    let file = UploadFile {
        file_name: "cat.png".into(),
        mime: "image/png".into(),
        kind: MessageKind::Image,
        duration_ms: None,
        bytes: vec![0x89, b'P', b'N', b'G'],
    };
    let attachment = PendingUpload::start(Arc::new(uploader), file)
        .finish()
        .await
        .unwrap();
    assert!(attachment.url.starts_with(&format!("http://{addr}/uploads/")));

    let fetched = reqwest::get(&attachment.url).await.unwrap();
    assert!(fetched.status().is_success());
    assert_eq!(fetched.bytes().await.unwrap().as_ref(), [0x89, b'P', b'N', b'G']);

    let ids = alice
        .engine
        .send(Draft::text("look!").with_attachment(attachment.clone()))
        .await
        .unwrap();
    assert_eq!(ids.len(), 2);

    wait_for("bob to receive both", || bob.engine.messages().len() == 2).await;
    let received = bob.engine.messages();
    assert_eq!(
        received[0].payload,
        Payload::Image {
            url: attachment.url
        }
    );
    assert_eq!(received[1].payload.as_text(), Some("look!"));
}
