//! Attachment uploads.
//!
//! Uploading is independent of message delivery: a [`PendingUpload`] runs
//! in the background and resolves to an [`Attachment`] that can then be
//! composed into a message. Cancelling it discards the result; no message
//! is ever inserted for a cancelled upload.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use reqwest::Client;
use reqwest::multipart::{Form, Part};
use tokio::sync::oneshot;
use url::Url;

use matchchat_proto::api::{ApiError, UploadResponse};
use matchchat_proto::message::PeerId;

use crate::chat::composer::{Attachment, MessageKind, kind_for_path};

/// Errors that can occur while uploading.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// The local file could not be read.
    #[error("cannot read {path}: {source}")]
    Read {
        /// The file.
        path: String,
        /// The underlying error.
        source: std::io::Error,
    },

    /// The upload was cancelled by the user.
    #[error("upload cancelled")]
    Cancelled,

    /// The server refused the upload.
    #[error("upload rejected: {0}")]
    Rejected(#[from] ApiError),

    /// Network or decoding failure.
    #[error("upload failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The upload task ended without a result.
    #[error("upload task failed: {0}")]
    Task(String),
}

/// A file ready to upload.
#[derive(Debug, Clone)]
pub struct UploadFile {
    /// File name sent to the server.
    pub file_name: String,
    /// MIME type sent to the server.
    pub mime: String,
    /// What the file will display as.
    pub kind: MessageKind,
    /// Clip length for audio, if known.
    pub duration_ms: Option<u64>,
    /// File contents.
    pub bytes: Vec<u8>,
}

impl UploadFile {
    /// Read a file from disk, classifying it by extension.
    ///
    /// # Errors
    ///
    /// Returns [`UploadError::Read`] if the file cannot be read.
    pub async fn read(path: &Path) -> Result<Self, UploadError> {
        let bytes = tokio::fs::read(path).await.map_err(|source| UploadError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let file_name = path
            .file_name()
            .map_or_else(|| "upload".to_owned(), |n| n.to_string_lossy().into_owned());
        Ok(Self {
            mime: mime_guess::from_path(path)
                .first_or_octet_stream()
                .essence_str()
                .to_owned(),
            kind: kind_for_path(path),
            duration_ms: None,
            file_name,
            bytes,
        })
    }
}

/// External collaborator that stores bytes and returns a URL.
pub trait Uploader: Send + Sync {
    /// Store `file` and return where it can be fetched from.
    fn upload(&self, file: UploadFile) -> impl Future<Output = Result<String, UploadError>> + Send;
}

/// `POST upload` multipart implementation of [`Uploader`].
#[derive(Debug, Clone)]
pub struct HttpUploader {
    client: Client,
    endpoint: Url,
    self_id: PeerId,
}

impl HttpUploader {
    /// Create an uploader posting to `<api_base>/upload`.
    ///
    /// # Errors
    ///
    /// Returns [`UploadError::Task`] if `api_base` cannot be joined.
    pub fn new(client: Client, api_base: &Url, self_id: PeerId) -> Result<Self, UploadError> {
        let mut base = api_base.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let endpoint = base
            .join("upload")
            .map_err(|e| UploadError::Task(format!("invalid upload url: {e}")))?;
        Ok(Self {
            client,
            endpoint,
            self_id,
        })
    }
}

impl Uploader for HttpUploader {
    async fn upload(&self, file: UploadFile) -> Result<String, UploadError> {
        let part = Part::bytes(file.bytes)
            .file_name(file.file_name)
            .mime_str(&file.mime)?;
        let form = Form::new().part("file", part);

        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(self.self_id.as_str())
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let err = response
                .json::<ApiError>()
                .await
                .unwrap_or_else(|_| ApiError {
                    status: status.as_u16(),
                    ..ApiError::new(matchchat_proto::api::ErrorCode::Internal)
                });
            return Err(UploadError::Rejected(err));
        }
        let body: UploadResponse = response.json().await?;
        Ok(body.url)
    }
}

/// An upload running in the background.
///
/// Dropping it without calling [`finish`](Self::finish) cancels the upload.
pub struct PendingUpload {
    file_name: String,
    cancel: Option<oneshot::Sender<()>>,
    handle: tokio::task::JoinHandle<Result<Attachment, UploadError>>,
}

impl PendingUpload {
    /// Start uploading `file`.
    pub fn start<U: Uploader + 'static>(uploader: Arc<U>, file: UploadFile) -> Self {
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let file_name = file.file_name.clone();
        let kind = file.kind;
        let duration_ms = file.duration_ms;

        let handle = tokio::spawn(async move {
            tokio::select! {
                result = uploader.upload(file) => {
                    let url = result?;
                    Ok(Attachment { url, kind, duration_ms })
                }
                _ = cancel_rx => Err(UploadError::Cancelled),
            }
        });

        tracing::debug!(file = %file_name, "upload started");
        Self {
            file_name,
            cancel: Some(cancel_tx),
            handle,
        }
    }

    /// Name of the file being uploaded.
    #[must_use]
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Abort the upload. Its result is discarded.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        tracing::info!(file = %self.file_name, "upload cancelled");
    }

    /// Wait for the upload to finish.
    ///
    /// # Errors
    ///
    /// Returns the uploader's error, or [`UploadError::Task`] if the task panicked.
    pub async fn finish(self) -> Result<Attachment, UploadError> {
        // Dropping the cancel sender would cancel the upload; hold it until done.
        let Self {
            handle,
            cancel: _cancel,
            ..
        } = self;
        handle.await.map_err(|e| UploadError::Task(e.to_string()))?
    }
}
