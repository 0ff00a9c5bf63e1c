// SPDX-License-Identifier: MIT
//! HTTP implementation of [`ProviderClient`].
//!
//! Job submission and status queries go through a JSON envelope of the form
//! `{"code": 200, "msg": "...", "data": {...}}`. Chat completions use the
//! OpenAI-style SSE wire format: `data: {json}` lines terminated by
//! `data: [DONE]`.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::retry::{retry_if, RetryConfig};

use super::{ChatChunk, ChatMessage, ChatStream, ChatUsage, JobState, JobStatus, ProviderClient, ProviderError};

const CHUNK_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct HttpProviderConfig {
    pub base_url: String,
    pub api_key: String,
    pub request_timeout: Duration,
    pub retry: RetryConfig,
}

pub struct HttpProvider {
    http: reqwest::Client,
    config: HttpProviderConfig,
}

/// Standard response envelope for job endpoints.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: u16,
    #[serde(default)]
    msg: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateJobData {
    task_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobRecordData {
    state: String,
    #[serde(default)]
    result_json: Option<String>,
    #[serde(default)]
    credits_consumed: Option<i64>,
    #[serde(default)]
    fail_code: Option<String>,
    #[serde(default)]
    fail_msg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SseChunk {
    #[serde(default)]
    choices: Vec<SseChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct SseChoice {
    #[serde(default)]
    delta: SseDelta,
}

#[derive(Debug, Default, Deserialize)]
struct SseDelta {
    #[serde(default)]
    content: Option<String>,
}

impl HttpProvider {
    pub fn new(config: HttpProviderConfig) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ProviderError::Network(e.to_string()))?;
        Ok(Self { http, config })
    }

    fn classify(err: reqwest::Error) -> ProviderError {
        if err.is_timeout() {
            ProviderError::Timeout
        } else {
            ProviderError::Network(err.to_string())
        }
    }

    fn classify_status(status: u16, message: String) -> ProviderError {
        match status {
            401 | 403 => ProviderError::Unauthorized,
            402 => ProviderError::InsufficientBalance,
            429 => ProviderError::RateLimited,
            _ => ProviderError::Api { status, message },
        }
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<T, ProviderError> {
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.config.api_key)
            .json(body)
            .send()
            .await
            .map_err(Self::classify)?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status.as_u16(), message));
        }

        let envelope: Envelope<T> = response.json().await.map_err(Self::classify)?;
        if envelope.code != 200 {
            return Err(Self::classify_status(
                envelope.code,
                envelope.msg.unwrap_or_default(),
            ));
        }
        envelope.data.ok_or_else(|| ProviderError::Api {
            status: 200,
            message: "response envelope missing data".into(),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ProviderError> {
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.config.api_key)
            .query(query)
            .send()
            .await
            .map_err(Self::classify)?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status.as_u16(), message));
        }

        let envelope: Envelope<T> = response.json().await.map_err(Self::classify)?;
        if envelope.code != 200 {
            return Err(Self::classify_status(
                envelope.code,
                envelope.msg.unwrap_or_default(),
            ));
        }
        envelope.data.ok_or_else(|| ProviderError::Api {
            status: 200,
            message: "response envelope missing data".into(),
        })
    }
}

#[async_trait]
impl ProviderClient for HttpProvider {
    async fn create_job(
        &self,
        model: &str,
        params: &serde_json::Value,
    ) -> Result<String, ProviderError> {
        let url = format!("{}/api/v1/jobs/createTask", self.config.base_url);
        let body = json!({ "model": model, "input": params });

        let data: CreateJobData = retry_if(&self.config.retry, ProviderError::is_retryable, || {
            self.post_json(&url, &body)
        })
        .await?;

        debug!(model, external_id = %data.task_id, "job submitted");
        Ok(data.task_id)
    }

    async fn query_job(&self, external_id: &str) -> Result<JobStatus, ProviderError> {
        let url = format!("{}/api/v1/jobs/recordInfo", self.config.base_url);
        let query = [("taskId", external_id)];

        let data: JobRecordData = retry_if(&self.config.retry, ProviderError::is_retryable, || {
            self.get_json(&url, &query)
        })
        .await?;

        Ok(JobStatus {
            state: JobState::parse(&data.state),
            result_json: data.result_json,
            credits_consumed: data.credits_consumed,
            fail_code: data.fail_code,
            fail_message: data.fail_msg,
        })
    }

    async fn stream_chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<ChatStream, ProviderError> {
        let url = format!("{}/v1/chat/completions", self.config.base_url);
        let body = json!({
            "model": model,
            "messages": messages,
            "stream": true,
            "stream_options": { "include_usage": true },
        });

        // The client-wide timeout is too short for a streaming body; give a
        // long generation ten minutes before the read is cut off.
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .timeout(Duration::from_secs(600))
            .send()
            .await
            .map_err(Self::classify)?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status.as_u16(), message));
        }

        let (tx, rx) = mpsc::channel::<Result<ChatChunk, ProviderError>>(CHUNK_CHANNEL_CAPACITY);
        tokio::spawn(pump_sse(response, tx));
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// Read the SSE body line by line and forward parsed chunks. Closing the
/// channel ends the consumer's stream; an error item is sent first when the
/// body breaks mid-flight.
async fn pump_sse(response: reqwest::Response, tx: mpsc::Sender<Result<ChatChunk, ProviderError>>) {
    let mut body = response.bytes_stream();
    let mut pending = String::new();

    while let Some(piece) = body.next().await {
        let piece = match piece {
            Ok(p) => p,
            Err(e) => {
                let _ = tx.send(Err(ProviderError::Stream(e.to_string()))).await;
                return;
            }
        };
        pending.push_str(&String::from_utf8_lossy(&piece));

        while let Some(newline) = pending.find('\n') {
            let line: String = pending.drain(..=newline).collect();
            let line = line.trim();
            let Some(payload) = line.strip_prefix("data:") else {
                continue;
            };
            let payload = payload.trim();
            if payload == "[DONE]" {
                return;
            }
            match serde_json::from_str::<SseChunk>(payload) {
                Ok(chunk) => {
                    let delta = chunk
                        .choices
                        .first()
                        .and_then(|c| c.delta.content.clone())
                        .unwrap_or_default();
                    if delta.is_empty() && chunk.usage.is_none() {
                        continue;
                    }
                    if tx
                        .send(Ok(ChatChunk {
                            delta,
                            usage: chunk.usage,
                        }))
                        .await
                        .is_err()
                    {
                        // Consumer dropped; nothing left to do.
                        return;
                    }
                }
                Err(e) => {
                    warn!(err = %e, "skipping malformed stream chunk");
                }
            }
        }
    }
}
