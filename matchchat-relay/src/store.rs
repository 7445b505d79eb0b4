//! In-memory conversation history and upload storage.
//!
//! The [`HistoryStore`] keeps one log per user pair, sorted by the
//! `(at, id)` ordering key, so paging backwards is a binary search. It also
//! counts messages per author for the free-message quota and holds uploaded
//! files until the process exits.

use std::collections::HashMap;

use tokio::sync::RwLock;

use matchchat_proto::api::{Cursor, HistoryPage, MAX_PAGE_SIZE};
use matchchat_proto::message::{MessageId, PeerId, Timestamp, WireMessage};

/// An uploaded file.
#[derive(Debug, Clone)]
pub struct StoredUpload {
    /// Original file name.
    pub file_name: String,
    /// MIME type reported by the uploader.
    pub content_type: String,
    /// File contents.
    pub bytes: Vec<u8>,
}

/// Order-independent key of a conversation.
fn pair_key(a: &PeerId, b: &PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

/// Per-pair message logs plus uploads.
#[derive(Default)]
pub struct HistoryStore {
    logs: RwLock<HashMap<(PeerId, PeerId), Vec<WireMessage>>>,
    sent: RwLock<HashMap<PeerId, u32>>,
    uploads: RwLock<HashMap<String, StoredUpload>>,
}

impl HistoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a new message and returns the confirmed copy.
    ///
    /// The server timestamp never goes backwards within a conversation, so
    /// a new message always sorts last.
    pub async fn append(
        &self,
        from: &PeerId,
        to: &PeerId,
        body: String,
        reply_to_id: Option<MessageId>,
    ) -> WireMessage {
        let mut logs = self.logs.write().await;
        let log = logs.entry(pair_key(from, to)).or_default();
        let now = Timestamp::now();
        let at = log.last().map_or(now, |last| now.max(last.at));
        let message = WireMessage {
            id: MessageId::new(format!("m_{}", uuid::Uuid::now_v7().simple())),
            from: from.clone(),
            to: to.clone(),
            body,
            at,
            reply_to_id,
        };
        log.push(message.clone());
        drop(logs);

        *self.sent.write().await.entry(from.clone()).or_default() += 1;
        message
    }

    /// Inserts an existing message, keeping the log sorted. Used for seeding.
    pub async fn insert(&self, message: WireMessage) {
        let mut logs = self.logs.write().await;
        let log = logs.entry(pair_key(&message.from, &message.to)).or_default();
        let index = log.partition_point(|m| (m.at, &m.id) <= (message.at, &message.id));
        log.insert(index, message);
    }

    /// One page of the conversation between `a` and `b`, newest items
    /// strictly older than `before`.
    pub async fn page(
        &self,
        a: &PeerId,
        b: &PeerId,
        before: Option<&Cursor>,
        limit: usize,
    ) -> HistoryPage {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let logs = self.logs.read().await;
        logs.get(&pair_key(a, b))
            .map(|log| HistoryPage::slice(log, before, limit))
            .unwrap_or_default()
    }

    /// Whether `id` exists in the conversation between `a` and `b`.
    pub async fn contains(&self, a: &PeerId, b: &PeerId, id: &MessageId) -> bool {
        let logs = self.logs.read().await;
        logs.get(&pair_key(a, b))
            .is_some_and(|log| log.iter().any(|m| &m.id == id))
    }

    /// Number of messages `author` has sent.
    pub async fn sent_count(&self, author: &PeerId) -> u32 {
        self.sent.read().await.get(author).copied().unwrap_or(0)
    }

    /// Stores an upload and returns its id.
    pub async fn put_upload(&self, upload: StoredUpload) -> String {
        let id = uuid::Uuid::now_v7().simple().to_string();
        self.uploads.write().await.insert(id.clone(), upload);
        id
    }

    /// Looks up an upload.
    pub async fn upload(&self, id: &str) -> Option<StoredUpload> {
        self.uploads.read().await.get(id).cloned()
    }
}
