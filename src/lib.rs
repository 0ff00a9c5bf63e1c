// SPDX-License-Identifier: MIT
//! gend: generation task daemon.
//!
//! Runs AI generation tasks (streamed chat, polled image/video jobs) and
//! fans their progress out to websocket observers, with reconnect replay,
//! bounded buffers, and exactly-once billing.

pub mod config;
pub mod credits;
pub mod poller;
pub mod provider;
pub mod retry;
pub mod storage;
pub mod stream;
pub mod ws;

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use config::DaemonConfig;
use credits::CreditLedger;
use provider::{ChatMessage, ProviderClient};
use storage::{NewTask, Storage, TaskKind, TaskRow};
use stream::{StreamBroadcaster, Subscription};
use ws::manager::ConnectionManager;

/// Shared handles to every long-lived service.
pub struct AppContext {
    pub config: Arc<DaemonConfig>,
    pub storage: Arc<Storage>,
    pub ledger: Arc<CreditLedger>,
    pub provider: Arc<dyn ProviderClient>,
    pub connections: Arc<ConnectionManager>,
    pub broadcaster: Arc<StreamBroadcaster>,
}

impl AppContext {
    /// Start a streamed chat generation: persist the user's message, create
    /// the task row, open the provider stream, and spawn the producer. The
    /// returned subscription sees every event from index zero.
    pub async fn start_chat(
        &self,
        user_id: &str,
        conversation_id: Option<String>,
        model: &str,
        messages: Vec<ChatMessage>,
    ) -> Result<(TaskRow, Subscription)> {
        if let (Some(conversation_id), Some(last)) = (&conversation_id, messages.last()) {
            if last.role == "user" {
                self.storage
                    .create_message(conversation_id, user_id, "user", &last.content, None, 0)
                    .await?;
            }
        }

        let task = self
            .storage
            .create_task(NewTask {
                user_id: user_id.to_string(),
                conversation_id,
                kind: TaskKind::Chat,
                model: model.to_string(),
                credits_locked: 0,
                credit_tx_id: None,
            })
            .await?;

        let stream = match self.provider.stream_chat(model, &messages).await {
            Ok(stream) => stream,
            Err(e) => {
                self.storage
                    .fail_task(&task.id, e.code(), &e.to_string(), None)
                    .await?;
                return Err(e.into());
            }
        };

        info!(task_id = %task.id, user_id, model, "chat task started");
        let subscription = self.broadcaster.start(task.clone(), stream);
        Ok((task, subscription))
    }

    /// Submit an image or video generation job: lock the credit estimate,
    /// create the task row, and hand the job to the provider. A failed
    /// submission refunds the lock and fails the task.
    pub async fn start_generation(
        &self,
        user_id: &str,
        conversation_id: Option<String>,
        kind: TaskKind,
        model: &str,
        params: serde_json::Value,
        credit_estimate: i64,
    ) -> Result<TaskRow> {
        let task = self
            .storage
            .create_task(NewTask {
                user_id: user_id.to_string(),
                conversation_id,
                kind,
                model: model.to_string(),
                credits_locked: credit_estimate,
                credit_tx_id: None,
            })
            .await?;

        let tx_id = match self
            .ledger
            .lock(user_id, &task.id, credit_estimate, kind.as_str())
            .await
        {
            Ok(tx_id) => tx_id,
            Err(e) => {
                self.storage
                    .fail_task(&task.id, "insufficient_credits", &e.to_string(), None)
                    .await?;
                return Err(e.into());
            }
        };
        self.storage.set_credit_tx_id(&task.id, &tx_id).await?;

        match self.provider.create_job(model, &params).await {
            Ok(external_id) => {
                self.storage.set_external_id(&task.id, &external_id).await?;
                info!(task_id = %task.id, external_id = %external_id, kind = %kind, "generation job submitted");
            }
            Err(e) => {
                warn!(task_id = %task.id, err = %e, "job submission failed, refunding lock");
                if let Err(refund_err) = self.ledger.refund(&tx_id).await {
                    warn!(task_id = %task.id, err = %refund_err, "refund after failed submission also failed");
                }
                self.storage
                    .fail_task(&task.id, e.code(), &e.to_string(), None)
                    .await?;
                return Err(e.into());
            }
        }

        self.storage
            .get_task(&task.id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("task vanished after submission"))
    }
}
