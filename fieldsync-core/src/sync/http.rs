//! HTTP transport for the field data server.

use crate::records::RecordKind;
use crate::sync::info_sync::{InfoSubStage, ReferenceDataSource};
use crate::sync::transport::{
    AuthGrant, RecordMetadata, SyncTransport, TransportError, UploadReceipt,
};
use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

/// JSON-over-HTTP client for the field data API
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    /// Create a new transport for `base_url`
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn map_send_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() || e.is_connect() {
        TransportError::Unreachable(e.to_string())
    } else {
        TransportError::InvalidResponse(e.to_string())
    }
}

/// Pull the human-readable reason out of an error body
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("message")
                .or_else(|| v.get("error"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string())
}

fn classify(status: StatusCode, body: &str) -> TransportError {
    let message = error_message(body);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => TransportError::Unauthorized(message),
        s if s.is_client_error() => TransportError::Rejected { message },
        s => TransportError::Server {
            status: s.as_u16(),
            message,
        },
    }
}

async fn read_json<T: DeserializeOwned>(resp: Response) -> Result<T, TransportError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(classify(status, &body));
    }
    resp.json::<T>()
        .await
        .map_err(|e| TransportError::InvalidResponse(e.to_string()))
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn authenticate(&self, username: &str, password: &str) -> Result<AuthGrant, TransportError> {
        let body = serde_json::json!({
            "username": username,
            "password": password,
        });
        let resp = self
            .client
            .post(self.url("/api/v1/auth/token"))
            .json(&body)
            .send()
            .await
            .map_err(map_send_error)?;
        read_json(resp).await
    }

    async fn upload_record(
        &self,
        token: &str,
        kind: RecordKind,
        payload: &serde_json::Value,
    ) -> Result<UploadReceipt, TransportError> {
        let path = format!("/api/v1/records/{}", kind);
        let resp = self
            .client
            .post(self.url(&path))
            .bearer_auth(token)
            .json(payload)
            .send()
            .await
            .map_err(map_send_error)?;
        read_json(resp).await
    }

    async fn fetch_record_metadata(
        &self,
        token: &str,
        kind: RecordKind,
        object_id: &str,
    ) -> Result<RecordMetadata, TransportError> {
        let path = format!("/api/v1/records/{}/{}", kind, object_id);
        let resp = self
            .client
            .get(self.url(&path))
            .bearer_auth(token)
            .send()
            .await
            .map_err(map_send_error)?;
        read_json(resp).await
    }
}

#[async_trait]
impl ReferenceDataSource for HttpTransport {
    async fn fetch_reference(
        &self,
        token: &str,
        sub_stage: InfoSubStage,
    ) -> Result<Vec<serde_json::Value>, TransportError> {
        let path = format!("/api/v1/reference/{}", sub_stage);
        let resp = self
            .client
            .get(self.url(&path))
            .bearer_auth(token)
            .send()
            .await
            .map_err(map_send_error)?;
        read_json(resp).await
    }
}
