use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;

use crate::protocol::{ApiEnvelope, PlaybackInfo, ScheduleInfo};

/// Errors from the REST collaborator, split the way the UI needs them:
/// "the server answered and said no" reads differently from "the request
/// never made it", and a schedule with no attached asset is its own case.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("server rejected the request ({code}): {message}")]
    Status { code: u16, message: String },
    #[error("{message}")]
    NoPlayableContent { message: String },
    #[error("response missing expected data: {0}")]
    MissingData(&'static str),
}

/// Thin client over the theater REST surface.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    bearer_token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, bearer_token: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bearer_token,
        }
    }

    /// Register this viewer in the room. Failure is fatal to the session.
    pub async fn enter(&self, schedule_id: u64) -> Result<(), ApiError> {
        let response = self
            .request(reqwest::Method::POST, &format!("/theaters/{schedule_id}/enter"))
            .send()
            .await?;
        Self::expect_success(response).await?;
        Ok(())
    }

    /// Deregister this viewer. Best-effort: callers swallow the error, the
    /// room may already be gone server-side.
    pub async fn leave(&self, schedule_id: u64) -> Result<(), ApiError> {
        let response = self
            .request(reqwest::Method::POST, &format!("/theaters/{schedule_id}/leave"))
            .send()
            .await?;
        Self::expect_success(response).await?;
        Ok(())
    }

    /// Fetch the playback metadata for this session. A missing or empty
    /// video URL is a defined "no playable content" condition, distinct
    /// from transport failure.
    pub async fn playback_info(&self, schedule_id: u64) -> Result<PlaybackInfo, ApiError> {
        let envelope: ApiEnvelope<PlaybackInfo> = self
            .get_envelope(&format!("/theaters/{schedule_id}/playback"))
            .await?;
        playback_from_envelope(envelope)
    }

    /// Current viewer count. Callers render errors as "unknown", not zero,
    /// so a response without a count is an error, never a zero.
    pub async fn viewer_count(&self, schedule_id: u64) -> Result<u64, ApiError> {
        let envelope: ApiEnvelope<u64> = self
            .get_envelope(&format!("/theaters/{schedule_id}/viewers"))
            .await?;
        count_from_envelope(envelope)
    }

    /// Schedule metadata for the "starts at" banner. Display only.
    pub async fn schedule(&self, schedule_id: u64) -> Result<ScheduleInfo, ApiError> {
        let envelope: ApiEnvelope<ScheduleInfo> = self
            .get_envelope(&format!("/schedules/{schedule_id}"))
            .await?;
        envelope.data.ok_or(ApiError::Status {
            code: StatusCode::NOT_FOUND.as_u16(),
            message: envelope
                .message
                .unwrap_or_else(|| "schedule not found".to_string()),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, format!("{}{path}", self.base_url));
        if let Some(token) = &self.bearer_token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn get_envelope<T: DeserializeOwned>(&self, path: &str) -> Result<ApiEnvelope<T>, ApiError> {
        let response = self.request(reqwest::Method::GET, path).send().await?;
        let response = Self::expect_success(response).await?;
        Ok(response.json().await?)
    }

    /// Map non-2xx responses to `ApiError::Status`, pulling the server's
    /// envelope message out of the body when it has one.
    async fn expect_success(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response
            .json::<ApiEnvelope<serde_json::Value>>()
            .await
            .ok()
            .and_then(|env| env.message)
            .unwrap_or_else(|| status.to_string());
        Err(ApiError::Status {
            code: status.as_u16(),
            message,
        })
    }
}

fn count_from_envelope(envelope: ApiEnvelope<u64>) -> Result<u64, ApiError> {
    envelope.data.ok_or(ApiError::MissingData("viewer count"))
}

fn playback_from_envelope(envelope: ApiEnvelope<PlaybackInfo>) -> Result<PlaybackInfo, ApiError> {
    let message = envelope
        .message
        .clone()
        .unwrap_or_else(|| "no playable content for this schedule".to_string());
    match envelope.data {
        Some(info) if info.video_url.as_deref().is_some_and(|u| !u.is_empty()) => Ok(info),
        _ => Err(ApiError::NoPlayableContent { message }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(json: &str) -> ApiEnvelope<PlaybackInfo> {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn playback_with_url_passes_through() {
        let env = envelope(
            r#"{"message":"ok","data":{"assetId":1,"videoUrl":"https://cdn.example/v.m3u8","contentType":"application/vnd.apple.mpegurl"}}"#,
        );
        let info = playback_from_envelope(env).unwrap();
        assert_eq!(info.video_url.as_deref(), Some("https://cdn.example/v.m3u8"));
    }

    #[test]
    fn missing_data_is_no_playable_content() {
        let env = envelope(r#"{"message":"no asset attached","data":null}"#);
        match playback_from_envelope(env) {
            Err(ApiError::NoPlayableContent { message }) => {
                assert_eq!(message, "no asset attached");
            }
            other => panic!("expected NoPlayableContent, got {other:?}"),
        }
    }

    #[test]
    fn empty_url_is_no_playable_content() {
        let env = envelope(
            r#"{"data":{"assetId":1,"videoUrl":"","contentType":"video/mp4"}}"#,
        );
        assert!(matches!(
            playback_from_envelope(env),
            Err(ApiError::NoPlayableContent { .. })
        ));
    }

    #[test]
    fn viewer_count_without_data_is_an_error_not_zero() {
        let env: ApiEnvelope<u64> = serde_json::from_str(r#"{"data":null}"#).unwrap();
        assert!(matches!(
            count_from_envelope(env),
            Err(ApiError::MissingData("viewer count"))
        ));
        let env: ApiEnvelope<u64> = serde_json::from_str(r#"{"data":12}"#).unwrap();
        assert_eq!(count_from_envelope(env).unwrap(), 12);
    }

    #[test]
    fn base_url_trailing_slash_is_normalized() {
        let client = ApiClient::new("http://localhost:8080/", None);
        assert_eq!(client.base_url, "http://localhost:8080");
    }
}
