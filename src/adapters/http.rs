//! HTTP implementation of the ingest transport.
//!
//! Posts the recording metadata and payload as a multipart form, the way
//! the mobile client uploads finished captures. Status codes are mapped
//! onto the transient/permanent split the synchronizer retries on.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;

use crate::domain::{IngestAck, Recording};

use super::{IngestClient, UploadError};

/// HTTP client for the ingestion endpoint
pub struct HttpIngestClient {
    /// Base URL of the server, e.g. `https://scribe.example.org`
    base_url: String,

    /// Bearer token presented on every request
    auth_token: Option<String>,

    /// HTTP client
    client: reqwest::Client,
}

impl HttpIngestClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            auth_token: None,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/recordings", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl IngestClient for HttpIngestClient {
    fn name(&self) -> &str {
        "http"
    }

    async fn upload(&self, recording: &Recording, audio: &[u8]) -> Result<IngestAck, UploadError> {
        let metadata = serde_json::to_string(recording)
            .map_err(|e| UploadError::Permanent(format!("unserializable metadata: {e}")))?;

        let form = Form::new()
            .part(
                "metadata",
                Part::text(metadata).mime_str("application/json").map_err(
                    |e| UploadError::Permanent(format!("invalid metadata part: {e}")),
                )?,
            )
            .part(
                "audio",
                Part::bytes(audio.to_vec())
                    .file_name(format!("{}.m4a", recording.id))
                    .mime_str("audio/mp4")
                    .map_err(|e| UploadError::Permanent(format!("invalid audio part: {e}")))?,
            );

        let mut request = self.client.post(self.endpoint()).multipart(form);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            // Connection-level failures are always worth retrying
            UploadError::Transient(format!("request failed: {e}"))
        })?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<IngestAck>()
                .await
                .map_err(|e| UploadError::Transient(format!("unreadable acknowledgement: {e}")));
        }

        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Err(UploadError::Transient(format!("{status}: {body}")))
        } else {
            Err(UploadError::Permanent(format!("{status}: {body}")))
        }
    }
}
