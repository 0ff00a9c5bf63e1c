// SPDX-License-Identifier: MIT
//! Live fan-out of chat generation streams.
//!
//! One producer task per active chat generation consumes the provider
//! stream, persists the transcript on a throttle, and broadcasts indexed
//! events to any number of subscribers over bounded queues. A reconnecting
//! client resumes from its last seen index out of the in-memory replay
//! buffer; once the producer is gone the connection manager's task buffer
//! takes over.
//!
//! Finalization is guarded in the database: whichever finalizer performs the
//! terminal status transition is the only one that persists the message,
//! bills credits, and emits the terminal event.

pub mod events;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{PricingSection, StreamSection};
use crate::credits::{CreditLedger, LedgerError};
use crate::provider::{ChatStream, ChatUsage};
use crate::storage::{Storage, TaskRow};
use crate::ws::manager::ConnectionManager;
use crate::ws::protocol::{stream_event_frame, WsMessage};

use events::{IndexedEvent, StreamEvent};

#[derive(Debug, Clone)]
pub struct BroadcasterSettings {
    pub buffer_max_bytes: usize,
    pub buffer_max_age: Duration,
    pub db_flush_interval: Duration,
    pub heartbeat_interval: Duration,
    pub subscriber_queue_capacity: usize,
}

impl Default for BroadcasterSettings {
    fn default() -> Self {
        Self::from(&StreamSection::default())
    }
}

impl From<&StreamSection> for BroadcasterSettings {
    fn from(section: &StreamSection) -> Self {
        Self {
            buffer_max_bytes: section.buffer_max_bytes,
            buffer_max_age: section.buffer_max_age(),
            db_flush_interval: section.db_flush_interval(),
            heartbeat_interval: section.heartbeat_interval(),
            subscriber_queue_capacity: section.subscriber_queue_capacity,
        }
    }
}

struct BufferedEvent {
    at: Instant,
    indexed: IndexedEvent,
    bytes: usize,
}

/// In-memory state for one live stream.
struct StreamState {
    user_id: String,
    conversation_id: Option<String>,
    subscribers: HashMap<String, mpsc::Sender<IndexedEvent>>,
    buffer: VecDeque<BufferedEvent>,
    buffer_bytes: usize,
    next_index: u64,
    full_content: String,
}

impl StreamState {
    fn evict(&mut self, settings: &BroadcasterSettings) {
        let now = Instant::now();
        while let Some(front) = self.buffer.front() {
            let too_big = self.buffer_bytes > settings.buffer_max_bytes;
            let too_old = now.duration_since(front.at) > settings.buffer_max_age;
            if !too_big && !too_old {
                break;
            }
            self.buffer_bytes -= front.bytes;
            self.buffer.pop_front();
        }
    }
}

/// A live attachment to one task's stream.
pub struct Subscription {
    pub connection_id: String,
    pub receiver: mpsc::Receiver<IndexedEvent>,
    /// Highest index assigned so far, -1 before the first event.
    pub current_index: i64,
    /// Number of buffered events queued ahead of live delivery.
    pub replayed: usize,
}

pub struct StreamBroadcaster {
    streams: Mutex<HashMap<String, StreamState>>,
    storage: Arc<Storage>,
    ledger: Arc<CreditLedger>,
    connections: Arc<ConnectionManager>,
    pricing: PricingSection,
    settings: BroadcasterSettings,
}

impl StreamBroadcaster {
    pub fn new(
        storage: Arc<Storage>,
        ledger: Arc<CreditLedger>,
        connections: Arc<ConnectionManager>,
        pricing: PricingSection,
        settings: BroadcasterSettings,
    ) -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            storage,
            ledger,
            connections,
            pricing,
            settings,
        }
    }

    /// Whether a producer is currently live for this task.
    pub fn is_active(&self, task_id: &str) -> bool {
        self.lock().contains_key(task_id)
    }

    /// Begin streaming a chat task. Registers the stream, subscribes the
    /// caller, and spawns the producer. The returned subscription receives
    /// every event from index zero.
    pub fn start(self: &Arc<Self>, task: TaskRow, stream: ChatStream) -> Subscription {
        let task_id = task.id.clone();
        let (tx, rx) = mpsc::channel(self.settings.subscriber_queue_capacity);
        let connection_id = Uuid::new_v4().to_string();

        {
            let mut streams = self.lock();
            let state = streams.entry(task_id.clone()).or_insert_with(|| StreamState {
                user_id: task.user_id.clone(),
                conversation_id: task.conversation_id.clone(),
                subscribers: HashMap::new(),
                buffer: VecDeque::new(),
                buffer_bytes: 0,
                next_index: 0,
                full_content: String::new(),
            });
            state.subscribers.insert(connection_id.clone(), tx);
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_producer(task, stream).await;
        });

        Subscription {
            connection_id,
            receiver: rx,
            current_index: -1,
            replayed: 0,
        }
    }

    /// Attach to a live stream. `last_index < 0` queues one accumulated
    /// snapshot; otherwise events with index strictly greater than
    /// `last_index` are queued from the replay buffer. Returns `None` when
    /// no producer is live for the task.
    pub fn subscribe(&self, task_id: &str, last_index: i64) -> Option<Subscription> {
        let mut streams = self.lock();
        let state = streams.get_mut(task_id)?;
        state.evict(&self.settings);

        let replay: Vec<IndexedEvent> = if last_index < 0 {
            if state.full_content.is_empty() {
                Vec::new()
            } else {
                vec![IndexedEvent {
                    index: state.next_index.saturating_sub(1),
                    event: StreamEvent::Accumulated {
                        text: state.full_content.clone(),
                    },
                }]
            }
        } else {
            state
                .buffer
                .iter()
                .filter(|b| (b.indexed.index as i64) > last_index)
                .map(|b| b.indexed.clone())
                .collect()
        };

        let capacity = self.settings.subscriber_queue_capacity + replay.len();
        let (tx, rx) = mpsc::channel(capacity);
        let replayed = replay.len();
        for event in replay {
            // Capacity was sized to hold the whole replay.
            let _ = tx.try_send(event);
        }

        let connection_id = Uuid::new_v4().to_string();
        state.subscribers.insert(connection_id.clone(), tx);
        let current_index = state.next_index as i64 - 1;
        debug!(task_id, connection_id = %connection_id, replayed, "stream subscriber attached");

        Some(Subscription {
            connection_id,
            receiver: rx,
            current_index,
            replayed,
        })
    }

    pub fn unsubscribe(&self, task_id: &str, connection_id: &str) {
        let mut streams = self.lock();
        if let Some(state) = streams.get_mut(task_id) {
            state.subscribers.remove(connection_id);
        }
    }

    /// Current transcript of a live stream, empty when the producer is gone.
    pub fn accumulated(&self, task_id: &str) -> String {
        self.lock()
            .get(task_id)
            .map(|s| s.full_content.clone())
            .unwrap_or_default()
    }

    // ---- producer ----

    async fn run_producer(self: Arc<Self>, task: TaskRow, stream: ChatStream) {
        let task_id = task.id.clone();
        info!(task_id, user_id = %task.user_id, model = %task.model, "chat producer starting");

        if let Err(e) = self.drive(&task, stream).await {
            error!(task_id, err = ?e, "chat producer failed");
        }

        // Whatever path ended the drive, the task must not be left dangling
        // in a non-terminal state.
        match self.storage.get_task(&task_id).await {
            Ok(Some(row)) if !row.is_terminal() => {
                let partial = self.accumulated(&task_id);
                match self
                    .storage
                    .fail_task(&task_id, "interrupted", "generation ended unexpectedly", Some(&partial))
                    .await
                {
                    Ok(true) => {
                        warn!(task_id, "forced non-terminal task to failed");
                        self.broadcast(
                            &task_id,
                            StreamEvent::Error {
                                message: "generation ended unexpectedly".into(),
                                code: Some("interrupted".into()),
                            },
                        );
                    }
                    Ok(false) => {}
                    Err(e) => error!(task_id, err = ?e, "failed to force-fail task"),
                }
            }
            Ok(_) => {}
            Err(e) => error!(task_id, err = ?e, "failed to re-check task after stream"),
        }

        self.finish(&task_id);
    }

    async fn drive(&self, task: &TaskRow, mut stream: ChatStream) -> Result<()> {
        let placeholder_message_id = Uuid::new_v4().to_string();
        self.storage.mark_task_running(&task.id).await?;
        self.broadcast(
            &task.id,
            StreamEvent::Start {
                model: task.model.clone(),
                assistant_message_id: placeholder_message_id,
            },
        );

        let mut usage: Option<ChatUsage> = None;
        let mut last_flush = Instant::now();

        loop {
            match tokio::time::timeout(self.settings.heartbeat_interval, stream.next()).await {
                Err(_) => {
                    self.broadcast(&task.id, StreamEvent::Heartbeat);
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    let partial = self.accumulated(&task.id);
                    let won = self
                        .storage
                        .fail_task(&task.id, e.code(), &e.to_string(), Some(&partial))
                        .await?;
                    if won {
                        self.broadcast(
                            &task.id,
                            StreamEvent::Error {
                                message: e.to_string(),
                                code: Some(e.code().to_string()),
                            },
                        );
                    } else {
                        debug!(task_id = %task.id, "stream error after task already finalized");
                    }
                    return Ok(());
                }
                Ok(Some(Ok(chunk))) => {
                    if let Some(u) = chunk.usage {
                        usage = Some(u);
                    }
                    if chunk.delta.is_empty() {
                        continue;
                    }
                    self.broadcast(&task.id, StreamEvent::Content { text: chunk.delta });
                    if last_flush.elapsed() >= self.settings.db_flush_interval {
                        let snapshot = self.accumulated(&task.id);
                        self.storage.update_accumulated(&task.id, &snapshot).await?;
                        last_flush = Instant::now();
                    }
                }
            }
        }

        self.finalize_success(task, usage).await
    }

    async fn finalize_success(&self, task: &TaskRow, usage: Option<ChatUsage>) -> Result<()> {
        let full = self.accumulated(&task.id);

        let credits = match usage {
            Some(u) => self.pricing.estimate(u.prompt_tokens, u.completion_tokens),
            None if full.is_empty() => 0,
            None => {
                warn!(task_id = %task.id, "provider reported no usage, estimating from output length");
                self.pricing.estimate_from_length(full.len())
            }
        };

        let won = self
            .storage
            .complete_task(&task.id, None, Some(&full), credits)
            .await?;
        if !won {
            debug!(task_id = %task.id, "lost finalize race, skipping billing and terminal event");
            return Ok(());
        }

        let mut message_id = String::new();
        if !full.is_empty() {
            if let Some(conversation_id) = &task.conversation_id {
                let message = self
                    .storage
                    .create_message(conversation_id, &task.user_id, "assistant", &full, None, credits)
                    .await?;
                message_id = message.id;
            }
        }

        if credits > 0 {
            match self
                .ledger
                .deduct(&task.user_id, Some(&task.id), credits, "chat_completion")
                .await
            {
                Ok(_) => {
                    let balance = self.ledger.balance(&task.user_id).await?;
                    self.connections
                        .send_to_user(&task.user_id, &WsMessage::credits_changed(balance));
                }
                // The response was already delivered; an empty balance here
                // is logged, not clawed back.
                Err(LedgerError::InsufficientCredits { needed, available }) => {
                    warn!(task_id = %task.id, needed, available, "completed chat exceeded remaining credits");
                }
                Err(e) => return Err(e.into()),
            }
        }

        info!(task_id = %task.id, credits, chars = full.len(), "chat task completed");
        self.broadcast(
            &task.id,
            StreamEvent::Done {
                message_id,
                content: full,
                credits_consumed: credits,
            },
        );
        Ok(())
    }

    /// Assign the next index, buffer, fan out, and mirror into the
    /// connection manager's task buffer.
    fn broadcast(&self, task_id: &str, event: StreamEvent) {
        let mirrored = {
            let mut streams = self.lock();
            let Some(state) = streams.get_mut(task_id) else {
                return;
            };
            let index = state.next_index;
            state.next_index += 1;

            if let StreamEvent::Content { text } = &event {
                state.full_content.push_str(text);
            }

            let indexed = IndexedEvent { index, event };

            // Heartbeats consume an index but are pointless to replay.
            if !matches!(indexed.event, StreamEvent::Heartbeat) {
                let bytes = indexed.event.cost_bytes();
                state.buffer.push_back(BufferedEvent {
                    at: Instant::now(),
                    indexed: indexed.clone(),
                    bytes,
                });
                state.buffer_bytes += bytes;
            }
            // Evict on every event, heartbeats included, so an idle live
            // stream still ages old entries out of the replay window.
            state.evict(&self.settings);

            let mut dead: Vec<String> = Vec::new();
            for (connection_id, sender) in &state.subscribers {
                if sender.try_send(indexed.clone()).is_err() {
                    dead.push(connection_id.clone());
                }
            }
            for connection_id in dead {
                warn!(task_id, connection_id = %connection_id, "dropping slow stream subscriber");
                state.subscribers.remove(&connection_id);
            }

            if matches!(indexed.event, StreamEvent::Heartbeat) {
                None
            } else {
                let frame =
                    stream_event_frame(task_id, state.conversation_id.as_deref(), &indexed);
                Some((frame, indexed.index))
            }
        };

        if let Some((frame, index)) = mirrored {
            self.connections.buffer_for_task(task_id, frame, Some(index));
        }
    }

    /// Tear down the stream: closes every subscriber queue and starts the
    /// grace countdown on the mirrored task buffer.
    fn finish(&self, task_id: &str) {
        let removed = self.lock().remove(task_id);
        if let Some(state) = removed {
            debug!(
                task_id,
                subscribers = state.subscribers.len(),
                events = state.next_index,
                "stream closed"
            );
        }
        self.connections.mark_task_completed(task_id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, StreamState>> {
        match self.streams.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
