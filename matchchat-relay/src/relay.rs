//! Relay server core: shared state, WebSocket handler, HTTP endpoints, and
//! message routing.
//!
//! Clients identify on the push channel and then send, mark seen, and signal
//! typing over it. The same send and history semantics are available over
//! plain HTTP (`POST /send`, `GET /history`) with the caller named by a
//! bearer token. Every accepted message is acknowledged to its author,
//! pushed to the recipient if connected, and echoed to the author.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use axum::Json;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{RwLock, mpsc};

use matchchat_proto::api::{
    ApiError, ErrorCode, HistoryPage, HistoryQuery, SendRequest, SendResponse, UploadResponse,
};
use matchchat_proto::codec;
use matchchat_proto::event::{ClientEvent, PushedMessage, ReceiptState, SendAck, ServerEvent};
use matchchat_proto::message::{MAX_BODY_SIZE, MessageId, PeerId, WireMessage, validate_body};

use crate::access::AccessPolicy;
use crate::store::{HistoryStore, StoredUpload};

/// Shared relay server state: connected users, history, and access rules.
pub struct RelayState {
    /// Maps a user to the channel feeding its WebSocket writer.
    connections: RwLock<HashMap<PeerId, mpsc::UnboundedSender<Message>>>,
    /// Conversation logs and uploads.
    pub history: HistoryStore,
    access: AccessPolicy,
    max_body_size: usize,
    public_url: OnceLock<String>,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayState {
    /// Creates a relay state that matches everyone, with default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MAX_BODY_SIZE, AccessPolicy::open(), None)
    }

    /// Creates a relay state with custom limits and access rules.
    ///
    /// Without a `public_url`, upload links point at the bound address.
    #[must_use]
    pub fn with_config(max_body_size: usize, access: AccessPolicy, public_url: Option<String>) -> Self {
        let url = OnceLock::new();
        if let Some(public_url) = public_url {
            let _ = url.set(public_url.trim_end_matches('/').to_string());
        }
        Self {
            connections: RwLock::new(HashMap::new()),
            history: HistoryStore::new(),
            access,
            max_body_size,
            public_url: url,
        }
    }

    /// Registers a user's connection, returning the one it replaced.
    pub async fn register(
        &self,
        user: &PeerId,
        sender: mpsc::UnboundedSender<Message>,
    ) -> Option<mpsc::UnboundedSender<Message>> {
        let mut conns = self.connections.write().await;
        conns.insert(user.clone(), sender)
    }

    /// Removes a user's connection if it is still `sender`.
    ///
    /// A connection that was replaced by a newer one leaves the newer one alone.
    pub async fn unregister(&self, user: &PeerId, sender: &mpsc::UnboundedSender<Message>) -> bool {
        let mut conns = self.connections.write().await;
        if conns.get(user).is_some_and(|current| current.same_channel(sender)) {
            conns.remove(user);
            true
        } else {
            false
        }
    }

    /// Whether `user` has an open push connection.
    pub async fn is_connected(&self, user: &PeerId) -> bool {
        self.connections.read().await.contains_key(user)
    }

    /// Send a WebSocket Close frame to all connected users.
    ///
    /// Each writer task forwards the close frame, which the client-side
    /// reader sees as a disconnect. Used for graceful shutdown and tests.
    pub async fn close_all_connections(&self) {
        let conns = self.connections.read().await;
        for (user, sender) in conns.iter() {
            tracing::info!(user = %user, "sending close frame");
            let _ = sender.send(Message::Close(None));
        }
    }

    fn public_url(&self) -> &str {
        self.public_url.get().map_or("", String::as_str)
    }

    /// Pushes an event to `user`. Returns whether it was handed to a connection.
    async fn push(&self, user: &PeerId, event: &ServerEvent) -> bool {
        let Some(sender) = self.connections.read().await.get(user).cloned() else {
            return false;
        };
        match codec::encode(event) {
            Ok(frame) => sender.send(Message::Text(frame.into())).is_ok(),
            Err(e) => {
                tracing::error!(user = %user, error = %e, "failed to encode server event");
                false
            }
        }
    }

    /// Validates and stores a message from `from` to `to`.
    ///
    /// # Errors
    ///
    /// Returns the [`ApiError`] to report: `validation` for a bad body,
    /// `no_relationship` for unmatched users, `entitlement_required` once the
    /// free quota is used up, `not_found` for an unknown reply target.
    pub async fn accept_message(
        &self,
        from: &PeerId,
        to: &PeerId,
        body: String,
        reply_to_id: Option<MessageId>,
    ) -> Result<WireMessage, ApiError> {
        validate_body(&body, self.max_body_size).map_err(|e| {
            tracing::debug!(from = %from, error = %e, "message rejected");
            ApiError::new(ErrorCode::Validation)
        })?;
        self.access.check_pair(from, to)?;
        self.access
            .check_quota(from, self.history.sent_count(from).await)?;
        if let Some(reply) = &reply_to_id
            && !self.history.contains(from, to, reply).await
        {
            return Err(ApiError::new(ErrorCode::NotFound));
        }
        let item = self.history.append(from, to, body, reply_to_id).await;
        tracing::debug!(from = %from, to = %to, message_id = %item.id, "message stored");
        Ok(item)
    }

    /// Pushes a stored message to its recipient and echoes it to its author.
    ///
    /// The echo carries `request_id` when the message came in over the push
    /// channel. If the recipient is connected the author also receives a
    /// `delivered` receipt.
    pub async fn fan_out(&self, item: &WireMessage, request_id: Option<&str>) {
        let echo = PushedMessage {
            item: item.clone(),
            request_id: request_id.map(str::to_owned),
        };
        self.push(&item.from, &ServerEvent::New(echo)).await;
        if self.push(&item.to, &ServerEvent::New(item.clone().into())).await {
            self.push(
                &item.from,
                &ServerEvent::Status {
                    id: item.id.clone(),
                    state: ReceiptState::Delivered,
                },
            )
            .await;
        } else {
            tracing::debug!(to = %item.to, message_id = %item.id, "recipient offline, stored only");
        }
    }
}

/// Handles an upgraded WebSocket connection for a single user.
///
/// The connection lifecycle:
/// 1. Wait for `identify` and reply `identified`.
/// 2. Register the connection (replacing an older one for the same user).
/// 3. Apply client events until the socket closes.
/// 4. Unregister.
pub async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let user = match wait_for_identify(&mut ws_receiver).await {
        Ok(user) => user,
        Err(err) => {
            tracing::warn!(error = %err, "connection closed before identify");
            let _ = send_event(&mut ws_sender, &ServerEvent::Error(err)).await;
            return;
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    if state.register(&user, tx.clone()).await.is_some() {
        tracing::info!(user = %user, "replaced existing connection");
    }

    let ack = ServerEvent::Identified {
        self_id: user.clone(),
    };
    if let Err(e) = send_event(&mut ws_sender, &ack).await {
        tracing::error!(user = %user, error = %e, "failed to send identified");
        state.unregister(&user, &tx).await;
        return;
    }
    tracing::info!(user = %user, "user connected");

    let writer_user = user.clone();
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(user = %writer_user, "WebSocket write failed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    let reader_user = user.clone();
    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    handle_client_frame(&reader_user, text.as_str(), &reader_state).await;
                }
                Message::Close(_) => {
                    tracing::info!(user = %reader_user, "received close frame");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    state.unregister(&user, &tx).await;
    tracing::info!(user = %user, "user disconnected");
}

/// Waits for the first event, which must be a non-empty `identify`.
async fn wait_for_identify(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
) -> Result<PeerId, ApiError> {
    let unauthenticated = ApiError::new(ErrorCode::Unauthenticated);
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => {
                return match codec::decode::<ClientEvent>(text.as_str()) {
                    Ok(ClientEvent::Identify { self_id }) if !self_id.as_str().is_empty() => {
                        Ok(self_id)
                    }
                    Ok(other) => {
                        tracing::warn!(event = ?other, "expected identify");
                        Err(unauthenticated)
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to decode identify");
                        Err(unauthenticated)
                    }
                };
            }
            Message::Close(_) => return Err(unauthenticated),
            _ => {}
        }
    }
    Err(unauthenticated)
}

/// Applies one client event from an identified user.
async fn handle_client_frame(user: &PeerId, frame: &str, state: &Arc<RelayState>) {
    let event = match codec::decode::<ClientEvent>(frame) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(user = %user, error = %e, "failed to decode client event");
            return;
        }
    };

    match event {
        ClientEvent::Identify { self_id } => {
            tracing::warn!(user = %user, self_id = %self_id, "duplicate identify ignored");
        }
        ClientEvent::Join { peer_id } => {
            if let Err(err) = state.access.check_pair(user, &peer_id) {
                tracing::info!(user = %user, peer_id = %peer_id, "join refused");
                state.push(user, &ServerEvent::Error(err)).await;
            } else {
                tracing::debug!(user = %user, peer_id = %peer_id, "joined conversation");
            }
        }
        ClientEvent::Send {
            request_id,
            to,
            body,
            reply_to_id,
        } => match state.accept_message(user, &to, body, reply_to_id).await {
            Ok(item) => {
                let ack = SendAck::confirmed(request_id.clone(), item.clone());
                state.push(user, &ServerEvent::Ack(ack)).await;
                state.fan_out(&item, Some(request_id.as_str())).await;
            }
            Err(err) => {
                tracing::info!(user = %user, to = %to, error = %err, "send refused");
                let ack = SendAck::rejected(request_id, err);
                state.push(user, &ServerEvent::Ack(ack)).await;
            }
        },
        ClientEvent::Seen { peer_id, ids } => {
            if state.access.check_pair(user, &peer_id).is_err() {
                return;
            }
            for id in ids {
                if state.history.contains(user, &peer_id, &id).await {
                    let receipt = ServerEvent::Status {
                        id,
                        state: ReceiptState::Seen,
                    };
                    state.push(&peer_id, &receipt).await;
                }
            }
        }
        ClientEvent::Typing { peer_id } => {
            if state.access.check_pair(user, &peer_id).is_ok() {
                let typing = ServerEvent::Typing {
                    peer_id: user.clone(),
                };
                state.push(&peer_id, &typing).await;
            }
        }
    }
}

/// Encodes and sends a server event directly on a WebSocket sender.
async fn send_event(
    ws_sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    event: &ServerEvent,
) -> Result<(), String> {
    let frame = codec::encode(event).map_err(|e| e.to_string())?;
    ws_sender
        .send(Message::Text(frame.into()))
        .await
        .map_err(|e| format!("WebSocket send error: {e}"))
}

/// An [`ApiError`] rendered as an HTTP response.
struct ApiFailure(ApiError);

impl From<ApiError> for ApiFailure {
    fn from(err: ApiError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.0)).into_response()
    }
}

/// The caller named by `Authorization: Bearer <user id>`.
fn caller(headers: &HeaderMap) -> Result<PeerId, ApiFailure> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(PeerId::new)
        .ok_or_else(|| ApiFailure(ApiError::new(ErrorCode::Unauthenticated)))
}

async fn history_handler(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryPage>, ApiFailure> {
    let user = caller(&headers)?;
    state.access.check_pair(&user, &query.peer_id)?;
    let page = state
        .history
        .page(&user, &query.peer_id, query.before_cursor.as_ref(), query.limit)
        .await;
    tracing::debug!(user = %user, peer_id = %query.peer_id, items = page.items.len(), "history served");
    Ok(Json(page))
}

async fn send_handler(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    Json(request): Json<SendRequest>,
) -> Result<Json<SendResponse>, ApiFailure> {
    let user = caller(&headers)?;
    let item = state
        .accept_message(&user, &request.peer_id, request.body, request.reply_to_id)
        .await?;
    state.fan_out(&item, None).await;
    Ok(Json(SendResponse { item }))
}

async fn upload_handler(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiFailure> {
    let user = caller(&headers)?;
    let malformed = |e: axum::extract::multipart::MultipartError| {
        tracing::warn!(error = %e, "malformed upload");
        ApiFailure(ApiError::new(ErrorCode::Validation))
    };

    while let Some(field) = multipart.next_field().await.map_err(malformed)? {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().unwrap_or("upload").to_string();
        let content_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = field.bytes().await.map_err(malformed)?;
        tracing::info!(user = %user, file = %file_name, size = bytes.len(), "upload stored");
        let id = state
            .history
            .put_upload(StoredUpload {
                file_name,
                content_type,
                bytes: bytes.to_vec(),
            })
            .await;
        return Ok(Json(UploadResponse {
            url: format!("{}/uploads/{id}", state.public_url()),
        }));
    }
    Err(ApiFailure(ApiError::new(ErrorCode::Validation)))
}

async fn upload_file_handler(
    State(state): State<Arc<RelayState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiFailure> {
    let upload = state
        .history
        .upload(&id)
        .await
        .ok_or_else(|| ApiFailure(ApiError::new(ErrorCode::NotFound)))?;
    Ok(([(header::CONTENT_TYPE, upload.content_type)], upload.bytes).into_response())
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Starts the relay server on the given address and returns the bound address
/// and a join handle.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(RelayState::new())).await
}

/// Starts the relay server with a pre-configured [`RelayState`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<RelayState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;
    let _ = state.public_url.set(format!("http://{bound_addr}"));

    let app = axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .route("/history", axum::routing::get(history_handler))
        .route("/send", axum::routing::post(send_handler))
        .route("/upload", axum::routing::post(upload_handler))
        .route("/uploads/{id}", axum::routing::get(upload_file_handler))
        .with_state(state);

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "relay server error");
        }
    });

    Ok((bound_addr, handle))
}
