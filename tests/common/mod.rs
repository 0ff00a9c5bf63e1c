//! Shared test fixtures: an in-memory service stack and a scripted provider.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use gend::config::PricingSection;
use gend::credits::CreditLedger;
use gend::poller::{PollerSettings, TaskPoller};
use gend::provider::{
    ChatChunk, ChatMessage, ChatStream, JobStatus, ProviderClient, ProviderError,
};
use gend::storage::Storage;
use gend::stream::{BroadcasterSettings, StreamBroadcaster};
use gend::ws::manager::{ConnectionManager, ManagerSettings};

/// Provider double: job statuses are scripted per external id, chat streams
/// are driven by the test through a channel.
#[derive(Default)]
pub struct MockProvider {
    created_jobs: AtomicUsize,
    queries: AtomicUsize,
    statuses: Mutex<HashMap<String, VecDeque<Result<JobStatus, ProviderError>>>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a status response for `external_id`. The last queued response
    /// repeats once the script runs out.
    pub fn script_status(&self, external_id: &str, status: Result<JobStatus, ProviderError>) {
        self.statuses
            .lock()
            .unwrap()
            .entry(external_id.to_string())
            .or_default()
            .push_back(status);
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

fn clone_status(status: &Result<JobStatus, ProviderError>) -> Result<JobStatus, ProviderError> {
    match status {
        Ok(s) => Ok(s.clone()),
        Err(e) => Err(ProviderError::Api {
            status: 0,
            message: e.to_string(),
        }),
    }
}

#[async_trait]
impl ProviderClient for MockProvider {
    async fn create_job(
        &self,
        _model: &str,
        _params: &serde_json::Value,
    ) -> Result<String, ProviderError> {
        let n = self.created_jobs.fetch_add(1, Ordering::SeqCst);
        Ok(format!("ext-{n}"))
    }

    async fn query_job(&self, external_id: &str) -> Result<JobStatus, ProviderError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let mut statuses = self.statuses.lock().unwrap();
        let script = statuses
            .get_mut(external_id)
            .ok_or_else(|| ProviderError::Api {
                status: 404,
                message: format!("unknown job {external_id}"),
            })?;
        if script.len() > 1 {
            Ok(script.pop_front().unwrap()?)
        } else {
            clone_status(script.front().ok_or(ProviderError::Timeout)?)
        }
    }

    async fn stream_chat(
        &self,
        _model: &str,
        _messages: &[ChatMessage],
    ) -> Result<ChatStream, ProviderError> {
        Err(ProviderError::Api {
            status: 500,
            message: "mock provider has no chat script".into(),
        })
    }
}

/// A chat stream the test drives chunk by chunk.
pub fn chat_stream() -> (mpsc::Sender<Result<ChatChunk, ProviderError>>, ChatStream) {
    let (tx, rx) = mpsc::channel(64);
    (tx, Box::pin(ReceiverStream::new(rx)))
}

pub fn text_chunk(text: &str) -> Result<ChatChunk, ProviderError> {
    Ok(ChatChunk {
        delta: text.into(),
        usage: None,
    })
}

/// Everything a test needs, wired over one in-memory database.
pub struct Harness {
    pub storage: Arc<Storage>,
    pub ledger: Arc<CreditLedger>,
    pub connections: Arc<ConnectionManager>,
    pub broadcaster: Arc<StreamBroadcaster>,
    pub provider: Arc<MockProvider>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_settings(BroadcasterSettings::default(), ManagerSettings::default()).await
    }

    pub async fn with_settings(
        broadcaster_settings: BroadcasterSettings,
        manager_settings: ManagerSettings,
    ) -> Self {
        let storage = Arc::new(Storage::in_memory().await.unwrap());
        let ledger = Arc::new(CreditLedger::new(storage.pool().clone()));
        let connections = Arc::new(ConnectionManager::new(manager_settings));
        let broadcaster = Arc::new(StreamBroadcaster::new(
            Arc::clone(&storage),
            Arc::clone(&ledger),
            Arc::clone(&connections),
            PricingSection::default(),
            broadcaster_settings,
        ));
        Self {
            storage,
            ledger,
            connections,
            broadcaster,
            provider: Arc::new(MockProvider::new()),
        }
    }

    pub fn poller(&self, settings: PollerSettings) -> Arc<TaskPoller> {
        Arc::new(TaskPoller::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.ledger),
            Arc::clone(&self.connections),
            self.provider.clone(),
            settings,
        ))
    }
}
