// SPDX-License-Identifier: MIT
//! Background reconciliation of submitted generation jobs.
//!
//! Every tick the poller queries the provider for each active image/video
//! task, shuffled and jittered across the interval so a restart never sends
//! a burst, with a semaphore holding concurrent queries under the provider's
//! rate limit. Chat tasks have no provider job to query; they only appear
//! here through the stuck-task sweep.
//!
//! A pass that is still running when the next tick fires is skipped, not
//! stacked.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use rand::seq::SliceRandom;
use serde_json::json;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::{PollerSection, ProviderSection};
use crate::credits::{CreditLedger, LedgerError};
use crate::provider::{JobState, JobStatus, ProviderClient};
use crate::storage::{status, Storage, TaskRow};
use crate::ws::manager::ConnectionManager;
use crate::ws::protocol::{ServerMessageType, WsMessage};

#[derive(Debug, Clone)]
pub struct PollerSettings {
    pub interval: Duration,
    pub chat_timeout_minutes: i64,
    pub image_timeout_minutes: i64,
    pub video_timeout_minutes: i64,
    /// Concurrent provider queries allowed within one pass.
    pub qps_limit: usize,
}

impl PollerSettings {
    pub fn from_config(poller: &PollerSection, provider: &ProviderSection) -> Self {
        Self {
            interval: poller.interval(),
            chat_timeout_minutes: poller.chat_timeout_minutes,
            image_timeout_minutes: poller.image_timeout_minutes,
            video_timeout_minutes: poller.video_timeout_minutes,
            qps_limit: provider.qps_limit.max(1),
        }
    }

    fn timeout_minutes(&self, kind: crate::storage::TaskKind) -> i64 {
        match kind {
            crate::storage::TaskKind::Chat => self.chat_timeout_minutes,
            crate::storage::TaskKind::Image => self.image_timeout_minutes,
            crate::storage::TaskKind::Video => self.video_timeout_minutes,
        }
    }
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self::from_config(&PollerSection::default(), &ProviderSection::default())
    }
}

pub struct TaskPoller {
    storage: Arc<Storage>,
    ledger: Arc<CreditLedger>,
    connections: Arc<ConnectionManager>,
    provider: Arc<dyn ProviderClient>,
    settings: PollerSettings,
    pass_lock: Mutex<()>,
}

impl TaskPoller {
    pub fn new(
        storage: Arc<Storage>,
        ledger: Arc<CreditLedger>,
        connections: Arc<ConnectionManager>,
        provider: Arc<dyn ProviderClient>,
        settings: PollerSettings,
    ) -> Self {
        Self {
            storage,
            ledger,
            connections,
            provider,
            settings,
            pass_lock: Mutex::new(()),
        }
    }

    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.poll_once().await;
        }
    }

    /// One full pass: provider reconciliation, then the stuck-task sweep.
    /// Returns immediately if the previous pass has not finished.
    pub async fn poll_once(&self) {
        let Ok(_guard) = self.pass_lock.try_lock() else {
            debug!("previous poll pass still running, skipping tick");
            return;
        };
        if let Err(e) = self.poll_pass().await {
            error!(err = ?e, "poll pass failed");
        }
        if let Err(e) = self.sweep_stuck().await {
            error!(err = ?e, "stuck-task sweep failed");
        }
    }

    async fn poll_pass(&self) -> Result<()> {
        let mut tasks = self.storage.list_active_tasks().await?;
        tasks.retain(|t| t.external_id.is_some());
        if tasks.is_empty() {
            return Ok(());
        }

        let total = tasks.len();
        debug!(total, "polling active generation tasks");
        tasks.shuffle(&mut rand::thread_rng());

        let semaphore = Arc::new(Semaphore::new(self.settings.qps_limit));
        let interval = self.settings.interval;

        let mut handles = Vec::with_capacity(total);
        for (i, task) in tasks.into_iter().enumerate() {
            // Spread queries across the interval rather than front-loading.
            let jitter = interval.mul_f64(i as f64 / total as f64).min(interval);
            let semaphore = Arc::clone(&semaphore);
            let storage = Arc::clone(&self.storage);
            let provider = Arc::clone(&self.provider);
            let task_id = task.id.clone();
            handles.push((
                task,
                tokio::spawn(async move {
                    tokio::time::sleep(jitter).await;
                    let _permit = semaphore.acquire().await;
                    let Some(external_id) = storage
                        .get_task(&task_id)
                        .await
                        .ok()
                        .flatten()
                        .and_then(|t| t.external_id)
                    else {
                        return None;
                    };
                    Some(provider.query_job(&external_id).await)
                }),
            ));
        }

        for (task, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(task_id = %task.id, err = ?e, "poll job panicked");
                    continue;
                }
            };
            let Some(outcome) = outcome else { continue };
            if let Err(e) = self.apply_status(&task, outcome).await {
                error!(task_id = %task.id, err = ?e, "failed to apply provider status");
            }
        }
        Ok(())
    }

    async fn apply_status(
        &self,
        task: &TaskRow,
        outcome: Result<JobStatus, crate::provider::ProviderError>,
    ) -> Result<()> {
        let job = match outcome {
            Ok(job) => job,
            Err(e) => {
                // Transient provider trouble leaves the task eligible for
                // the next pass; only the poll marker moves.
                warn!(task_id = %task.id, err = %e, "provider status query failed");
                self.storage.touch_polled(&task.id).await?;
                return Ok(());
            }
        };

        self.storage.touch_polled(&task.id).await?;
        match job.state {
            JobState::Success => {
                self.finalize_completed(task, &job).await?;
            }
            JobState::Failed => {
                let code = job.fail_code.as_deref().unwrap_or("provider_failed");
                let message = job.fail_message.as_deref().unwrap_or("generation failed");
                self.finalize_failed(task, code, message).await?;
            }
            JobState::Waiting | JobState::Queuing | JobState::Generating => {
                if task.status == status::PENDING {
                    self.storage.mark_task_running(&task.id).await?;
                }
            }
        }
        Ok(())
    }

    /// Resolve a task the provider reports as finished. Idempotent under
    /// races: only the winner of the guarded status transition persists the
    /// message, settles credits, and notifies subscribers. Returns whether
    /// this call was the winner.
    pub async fn finalize_completed(&self, task: &TaskRow, job: &JobStatus) -> Result<bool> {
        let credits = job.credits_consumed.unwrap_or(task.credits_locked);
        let won = self
            .storage
            .complete_task(&task.id, job.result_json.as_deref(), None, credits)
            .await?;
        if !won {
            debug!(task_id = %task.id, "completion already finalized elsewhere");
            return Ok(false);
        }

        if let Some(tx_id) = &task.credit_tx_id {
            match self.ledger.confirm(tx_id).await {
                Ok(()) => {}
                Err(LedgerError::AlreadyResolved(_)) => {
                    warn!(task_id = %task.id, tx_id, "credit lock was already resolved");
                }
                Err(e) => error!(task_id = %task.id, err = %e, "failed to confirm credit lock"),
            }
        }

        if let Some(conversation_id) = &task.conversation_id {
            let url = job.primary_url();
            self.storage
                .create_message(
                    conversation_id,
                    &task.user_id,
                    "assistant",
                    url.as_deref().unwrap_or(""),
                    url.as_deref(),
                    credits,
                )
                .await?;
        }

        info!(task_id = %task.id, kind = %task.kind, credits, "generation task completed");
        self.notify_terminal(
            task,
            json!({
                "status": "completed",
                "result": job
                    .result_json
                    .as_deref()
                    .and_then(|r| serde_json::from_str::<serde_json::Value>(r).ok()),
                "credits_used": credits,
            }),
        )
        .await?;
        Ok(true)
    }

    /// Resolve a task as failed and release its credit lock. Same winner
    /// semantics as [`finalize_completed`].
    pub async fn finalize_failed(&self, task: &TaskRow, code: &str, message: &str) -> Result<bool> {
        let won = self.storage.fail_task(&task.id, code, message, None).await?;
        if !won {
            debug!(task_id = %task.id, "failure already finalized elsewhere");
            return Ok(false);
        }

        if let Some(tx_id) = &task.credit_tx_id {
            match self.ledger.refund(tx_id).await {
                Ok(()) => {}
                Err(LedgerError::AlreadyResolved(_)) => {
                    warn!(task_id = %task.id, tx_id, "credit lock was already resolved");
                }
                Err(e) => error!(task_id = %task.id, err = %e, "failed to refund credit lock"),
            }
        }

        info!(task_id = %task.id, kind = %task.kind, code, "generation task failed");
        self.notify_terminal(
            task,
            json!({ "status": "failed", "error_code": code, "error_message": message }),
        )
        .await?;
        Ok(true)
    }

    async fn notify_terminal(&self, task: &TaskRow, payload: serde_json::Value) -> Result<()> {
        let frame = WsMessage::for_task(
            ServerMessageType::TaskStatus,
            payload,
            &task.id,
            task.conversation_id.as_deref(),
        );
        self.connections.publish_to_task(&task.id, frame, None);
        self.connections.mark_task_completed(&task.id);

        let balance = self.ledger.balance(&task.user_id).await?;
        self.connections
            .send_to_user(&task.user_id, &WsMessage::credits_changed(balance));
        Ok(())
    }

    /// Fail any task that has been in flight longer than its kind's budget.
    /// Credit locks are refunded; nothing was delivered.
    pub async fn sweep_stuck(&self) -> Result<()> {
        let now = Utc::now();
        for task in self.storage.list_active_tasks().await? {
            let kind = match task.kind() {
                Ok(kind) => kind,
                Err(e) => {
                    warn!(task_id = %task.id, err = %e, "skipping task with unknown kind");
                    continue;
                }
            };
            let limit = self.settings.timeout_minutes(kind);
            if task.age_minutes(now)? > limit {
                warn!(task_id = %task.id, kind = %task.kind, limit, "task exceeded time budget");
                self.finalize_failed(
                    &task,
                    "timeout",
                    &format!("task exceeded the {limit} minute budget"),
                )
                .await?;
            }
        }
        Ok(())
    }
}
