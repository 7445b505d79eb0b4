//! HTTP request/response fallback.
//!
//! `GET history` and `POST send` against the API base URL, authenticated
//! with a bearer token carrying the caller's user id. Non-2xx responses
//! are decoded into [`ApiError`]; bodies that do not parse fall back to an
//! error derived from the status code.

use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use url::Url;

use matchchat_proto::api::{
    ApiError, ErrorCode, HistoryPage, HistoryQuery, SendRequest, SendResponse,
};
use matchchat_proto::message::{PeerId, WireMessage};

use super::{Fallback, TransportError, TransportType};

/// Default per-request timeout applied by the HTTP client itself.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// `reqwest` implementation of [`Fallback`].
#[derive(Debug, Clone)]
pub struct HttpFallback {
    client: Client,
    base: Url,
    self_id: PeerId,
}

impl HttpFallback {
    /// Create a fallback against `base` authenticating as `self_id`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Http`] if the HTTP client cannot be built.
    pub fn new(base: Url, self_id: PeerId) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))?;
        Ok(Self::with_client(client, base, self_id))
    }

    /// Create a fallback reusing an existing client.
    #[must_use]
    pub fn with_client(client: Client, mut base: Url, self_id: PeerId) -> Self {
        // `Url::join` drops the last path segment unless it ends in '/'.
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Self {
            client,
            base,
            self_id,
        }
    }

    /// Return the API base URL.
    #[must_use]
    pub const fn base(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, path: &str) -> Result<Url, TransportError> {
        self.base
            .join(path)
            .map_err(|e| TransportError::Http(format!("invalid endpoint {path}: {e}")))
    }
}

/// Turn a non-success response into [`TransportError::Rejected`].
async fn check(response: Response) -> Result<Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let api_error = match response.json::<ApiError>().await {
        Ok(err) => err,
        Err(_) => ApiError {
            status: status.as_u16(),
            ..ApiError::new(code_for_status(status))
        },
    };
    tracing::debug!(status = status.as_u16(), error = %api_error.error, "fallback request rejected");
    Err(TransportError::Rejected(api_error))
}

fn code_for_status(status: StatusCode) -> ErrorCode {
    match status {
        StatusCode::UNAUTHORIZED => ErrorCode::Unauthenticated,
        StatusCode::PAYMENT_REQUIRED => ErrorCode::EntitlementRequired,
        StatusCode::FORBIDDEN => ErrorCode::NoRelationship,
        StatusCode::NOT_FOUND => ErrorCode::NotFound,
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => ErrorCode::Validation,
        _ => ErrorCode::Internal,
    }
}

impl Fallback for HttpFallback {
    async fn send(&self, request: &SendRequest) -> Result<WireMessage, TransportError> {
        let url = self.endpoint("send")?;
        let response = self
            .client
            .post(url)
            .bearer_auth(self.self_id.as_str())
            .json(request)
            .send()
            .await?;
        let body: SendResponse = check(response).await?.json().await?;
        Ok(body.item)
    }

    async fn history(&self, query: &HistoryQuery) -> Result<HistoryPage, TransportError> {
        let url = self.endpoint("history")?;
        let response = self
            .client
            .get(url)
            .bearer_auth(self.self_id.as_str())
            .query(query)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Fallback
    }
}
