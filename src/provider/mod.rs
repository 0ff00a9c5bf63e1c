// SPDX-License-Identifier: MIT
//! Upstream generation provider abstraction.
//!
//! [`ProviderClient`] is the seam between the engine and the remote API:
//! chat tasks stream tokens, image/video tasks are submitted as jobs and
//! polled for status. The HTTP implementation lives in [`http`]; tests plug
//! in scripted fakes.

pub mod http;

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider rejected credentials")]
    Unauthorized,
    #[error("provider account balance exhausted")]
    InsufficientBalance,
    #[error("provider rate limit exceeded")]
    RateLimited,
    #[error("provider request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("provider API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("stream error: {0}")]
    Stream(String),
}

impl ProviderError {
    /// Transient failures worth another attempt. Auth and balance problems
    /// will not fix themselves by waiting.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited | ProviderError::Timeout | ProviderError::Network(_)
        )
    }

    /// Stable machine-readable code persisted on failed tasks.
    pub fn code(&self) -> &'static str {
        match self {
            ProviderError::Unauthorized => "unauthorized",
            ProviderError::InsufficientBalance => "provider_balance",
            ProviderError::RateLimited => "rate_limited",
            ProviderError::Timeout => "timeout",
            ProviderError::Network(_) => "network",
            ProviderError::Api { .. } => "api_error",
            ProviderError::Stream(_) => "stream_error",
        }
    }
}

/// One chat message in a completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// Token usage reported by the provider, usually on the final chunk.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ChatUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

/// One incremental piece of a chat completion.
#[derive(Debug, Clone, Default)]
pub struct ChatChunk {
    pub delta: String,
    pub usage: Option<ChatUsage>,
}

pub type ChatStream = Pin<Box<dyn Stream<Item = Result<ChatChunk, ProviderError>> + Send>>;

/// Job states the provider reports for submitted generation tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Waiting,
    Queuing,
    Generating,
    Success,
    Failed,
}

impl JobState {
    /// Unknown states are treated as still in flight; the next poll pass
    /// will look again.
    pub fn parse(s: &str) -> Self {
        match s {
            "waiting" => JobState::Waiting,
            "queuing" | "queued" => JobState::Queuing,
            "generating" | "processing" => JobState::Generating,
            "success" => JobState::Success,
            "fail" | "failed" => JobState::Failed,
            _ => JobState::Waiting,
        }
    }
}

/// Snapshot of a submitted job, as returned by a status query.
#[derive(Debug, Clone)]
pub struct JobStatus {
    pub state: JobState,
    /// Raw result JSON (typically a list of media URLs) when successful.
    pub result_json: Option<String>,
    /// Provider-measured cost, when reported.
    pub credits_consumed: Option<i64>,
    pub fail_code: Option<String>,
    pub fail_message: Option<String>,
}

impl JobStatus {
    /// First media URL out of the result payload, if any.
    pub fn primary_url(&self) -> Option<String> {
        let raw = self.result_json.as_deref()?;
        let value: serde_json::Value = serde_json::from_str(raw).ok()?;
        value
            .get("resultUrls")
            .and_then(|u| u.as_array())
            .and_then(|a| a.first())
            .and_then(|u| u.as_str())
            .map(str::to_string)
    }
}

#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Submit an image/video generation job. Returns the provider's job id.
    async fn create_job(
        &self,
        model: &str,
        params: &serde_json::Value,
    ) -> Result<String, ProviderError>;

    /// Query the current status of a submitted job.
    async fn query_job(&self, external_id: &str) -> Result<JobStatus, ProviderError>;

    /// Open a streaming chat completion.
    async fn stream_chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<ChatStream, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_state_parsing() {
        assert_eq!(JobState::parse("waiting"), JobState::Waiting);
        assert_eq!(JobState::parse("queuing"), JobState::Queuing);
        assert_eq!(JobState::parse("generating"), JobState::Generating);
        assert_eq!(JobState::parse("success"), JobState::Success);
        assert_eq!(JobState::parse("fail"), JobState::Failed);
        // Vocabulary drift upstream must not wedge the poller.
        assert_eq!(JobState::parse("some_new_state"), JobState::Waiting);
    }

    #[test]
    fn retryable_classification() {
        assert!(ProviderError::Timeout.is_retryable());
        assert!(ProviderError::RateLimited.is_retryable());
        assert!(ProviderError::Network("reset".into()).is_retryable());
        assert!(!ProviderError::Unauthorized.is_retryable());
        assert!(!ProviderError::InsufficientBalance.is_retryable());
        assert!(!ProviderError::Api {
            status: 422,
            message: "bad params".into()
        }
        .is_retryable());
    }

    #[test]
    fn primary_url_extraction() {
        let status = JobStatus {
            state: JobState::Success,
            result_json: Some(r#"{"resultUrls":["https://cdn.example/a.png"]}"#.into()),
            credits_consumed: Some(4),
            fail_code: None,
            fail_message: None,
        };
        assert_eq!(
            status.primary_url().as_deref(),
            Some("https://cdn.example/a.png")
        );

        let empty = JobStatus {
            state: JobState::Success,
            result_json: Some(r#"{"resultUrls":[]}"#.into()),
            credits_consumed: None,
            fail_code: None,
            fail_message: None,
        };
        assert_eq!(empty.primary_url(), None);
    }
}
