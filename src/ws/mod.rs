// SPDX-License-Identifier: MIT
//! WebSocket server: accept loop, per-connection protocol handling, and the
//! subscription plumbing between clients, live streams, and replay buffers.
//!
//! Connection lifecycle:
//! 1. TCP accept, websocket handshake.
//! 2. The first frame must be `auth`; it names the user and, when the daemon
//!    is configured with a token, must present it.
//! 3. The connection registers with the [`manager::ConnectionManager`]
//!    (possibly evicting the user's oldest connection) and enters a single
//!    select loop over incoming frames, the outbound queue, and a ping timer.

pub mod manager;
pub mod protocol;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::accept_async;
use tracing::{debug, info, warn};

use crate::AppContext;

use protocol::{stream_event_frame, ClientFrame, ServerMessageType, WsMessage};

const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
const OUTBOUND_QUEUE_DEPTH: usize = 256;

/// Resolves on SIGTERM or ctrl-c.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(err = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            biased;
            _ = sigterm.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Run the server until a shutdown signal arrives. Connected clients get a
/// `server_restarting` frame before the listener closes.
pub async fn run(ctx: Arc<AppContext>) -> Result<()> {
    let addr = format!("{}:{}", ctx.config.bind_address, ctx.config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "websocket server listening");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!("shutdown signal received");
                let notified = ctx.connections.broadcast(&WsMessage::server_restarting());
                info!(notified, "notified clients of restart");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, peer)) => {
                        let ctx = Arc::clone(&ctx);
                        tokio::spawn(async move {
                            if let Err(e) = handle_socket(ctx, socket).await {
                                debug!(%peer, err = %e, "connection ended with error");
                            }
                        });
                    }
                    Err(e) => warn!(err = %e, "accept failed"),
                }
            }
        }
    }
    Ok(())
}

async fn handle_socket(ctx: Arc<AppContext>, socket: TcpStream) -> Result<()> {
    let ws = accept_async(socket).await.context("websocket handshake failed")?;
    let (mut sink, mut source) = ws.split();

    let Some(user_id) = authenticate(&ctx, &mut sink, &mut source).await? else {
        let _ = sink.close().await;
        return Ok(());
    };

    let (out_tx, mut out_rx) = mpsc::channel::<WsMessage>(OUTBOUND_QUEUE_DEPTH);
    let connection_id = ctx.connections.register(&user_id, out_tx);
    info!(connection_id = %connection_id, user_id = %user_id, "client connected");

    let mut session = Session {
        ctx: Arc::clone(&ctx),
        connection_id: connection_id.clone(),
        user_id,
        pumps: HashMap::new(),
    };

    let mut ping = tokio::time::interval(ctx.config.websocket.ping_interval());
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.reset();

    loop {
        tokio::select! {
            incoming = source.next() => {
                match incoming {
                    None | Some(Err(_)) => break,
                    Some(Ok(Message::Close(_))) => break,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Text(text))) => {
                        let mut failed = false;
                        for reply in session.handle_text(&text).await {
                            if send_frame(&mut sink, &reply).await.is_err() {
                                failed = true;
                                break;
                            }
                        }
                        if failed {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                }
            }
            outbound = out_rx.recv() => {
                match outbound {
                    Some(frame) => {
                        if send_frame(&mut sink, &frame).await.is_err() {
                            break;
                        }
                    }
                    // Sender dropped: evicted at the cap or swept as stale.
                    None => break,
                }
            }
            _ = ping.tick() => {
                if send_frame(&mut sink, &WsMessage::ping()).await.is_err() {
                    break;
                }
            }
        }
    }

    session.close();
    let _ = sink.close().await;
    debug!(connection_id = %connection_id, "client disconnected");
    Ok(())
}

async fn send_frame<S>(sink: &mut S, frame: &WsMessage) -> Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let text = serde_json::to_string(frame)?;
    sink.send(Message::Text(text)).await?;
    Ok(())
}

/// First-frame auth. Returns the authenticated user id, or `None` after
/// sending the client an error frame.
async fn authenticate(
    ctx: &AppContext,
    sink: &mut (impl Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    source: &mut (impl Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
              + Unpin),
) -> Result<Option<String>> {
    let first = match tokio::time::timeout(AUTH_TIMEOUT, source.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(_) => return Ok(None),
        Err(_) => {
            send_frame(sink, &WsMessage::error("auth_timeout", "no auth frame received")).await?;
            return Ok(None);
        }
    };

    match ClientFrame::parse(&first) {
        Ok(ClientFrame::Auth { user_id, token }) => {
            if let Some(expected) = &ctx.config.auth_token {
                if token.as_deref() != Some(expected.as_str()) {
                    warn!(user_id = %user_id, "rejected connection with bad token");
                    send_frame(sink, &WsMessage::error("unauthorized", "invalid token")).await?;
                    return Ok(None);
                }
            }
            if user_id.is_empty() {
                send_frame(sink, &WsMessage::error("unauthorized", "empty user id")).await?;
                return Ok(None);
            }
            Ok(Some(user_id))
        }
        Ok(_) => {
            send_frame(sink, &WsMessage::error("auth_required", "first frame must be auth")).await?;
            Ok(None)
        }
        Err(e) => {
            send_frame(sink, &WsMessage::error("bad_frame", &e.to_string())).await?;
            Ok(None)
        }
    }
}

/// Per-connection state: the pump tasks forwarding live stream events into
/// this connection's outbound queue, keyed by task id.
struct Session {
    ctx: Arc<AppContext>,
    connection_id: String,
    user_id: String,
    pumps: HashMap<String, (String, JoinHandle<()>)>,
}

impl Session {
    async fn handle_text(&mut self, text: &str) -> Vec<WsMessage> {
        match ClientFrame::parse(text) {
            Ok(ClientFrame::Subscribe { task_id, last_index }) => {
                match self.subscribe(&task_id, last_index).await {
                    Ok(replies) => replies,
                    Err(e) => {
                        warn!(task_id = %task_id, err = ?e, "subscribe failed");
                        vec![WsMessage::error("internal", "subscription failed")]
                    }
                }
            }
            Ok(ClientFrame::Unsubscribe { task_id }) => {
                self.unsubscribe(&task_id);
                vec![WsMessage::for_task(
                    ServerMessageType::Unsubscribed,
                    json!({}),
                    &task_id,
                    None,
                )]
            }
            Ok(ClientFrame::Pong) => {
                self.ctx.connections.heartbeat(&self.connection_id);
                Vec::new()
            }
            Ok(ClientFrame::Auth { .. }) => {
                vec![WsMessage::error("already_authenticated", "auth already completed")]
            }
            Err(e) => vec![WsMessage::error("bad_frame", &e.to_string())],
        }
    }

    /// Three-tier subscribe: live stream, then buffered replay, then a
    /// point-in-time snapshot of the task row.
    async fn subscribe(&mut self, task_id: &str, last_index: i64) -> Result<Vec<WsMessage>> {
        let Some(task) = self.ctx.storage.get_task(task_id).await? else {
            return Ok(vec![WsMessage::error("not_found", "no such task")]);
        };
        if task.user_id != self.user_id {
            return Ok(vec![WsMessage::error("forbidden", "task belongs to another user")]);
        }

        // Replace any previous subscription to this task.
        self.unsubscribe(task_id);

        if let Some(subscription) = self.ctx.broadcaster.subscribe(task_id, last_index) {
            let ack = WsMessage::for_task(
                ServerMessageType::Subscribed,
                json!({
                    "live": true,
                    "current_index": subscription.current_index,
                    "replayed": subscription.replayed,
                }),
                task_id,
                task.conversation_id.as_deref(),
            );
            // Registration with the manager keeps poll-driven task frames
            // flowing after the producer is gone; the live events themselves
            // arrive through the pump, so no buffered replay is requested.
            let _ = self
                .ctx
                .connections
                .subscribe(&self.connection_id, task_id, i64::MAX);
            let handle = spawn_pump(
                Arc::clone(&self.ctx),
                self.connection_id.clone(),
                task_id.to_string(),
                task.conversation_id.clone(),
                subscription.receiver,
            );
            self.pumps
                .insert(task_id.to_string(), (subscription.connection_id, handle));
            return Ok(vec![ack]);
        }

        // No live producer: buffered replay, or the row itself as last resort.
        let replay = self
            .ctx
            .connections
            .subscribe(&self.connection_id, task_id, last_index);

        let mut replies = Vec::new();
        let current_index = replay.as_ref().map(|r| r.current_index).unwrap_or(-1);
        replies.push(WsMessage::for_task(
            ServerMessageType::Subscribed,
            json!({ "live": false, "current_index": current_index }),
            task_id,
            task.conversation_id.as_deref(),
        ));

        if let Some(replay) = replay {
            if last_index < 0 && !replay.accumulated.is_empty() {
                let mut snapshot = WsMessage::for_task(
                    ServerMessageType::ChatChunk,
                    json!({ "text": replay.accumulated, "accumulated": true }),
                    task_id,
                    task.conversation_id.as_deref(),
                );
                snapshot.message_index = Some(replay.current_index);
                replies.push(snapshot);
            }
            replies.extend(replay.frames);
        }

        if task.is_terminal() {
            replies.push(task_snapshot_frame(&task));
        }
        Ok(replies)
    }

    fn unsubscribe(&mut self, task_id: &str) {
        if let Some((stream_connection_id, handle)) = self.pumps.remove(task_id) {
            self.ctx.broadcaster.unsubscribe(task_id, &stream_connection_id);
            handle.abort();
        }
        self.ctx.connections.unsubscribe(&self.connection_id, task_id);
    }

    fn close(&mut self) {
        let task_ids: Vec<String> = self.pumps.keys().cloned().collect();
        for task_id in task_ids {
            self.unsubscribe(&task_id);
        }
        self.ctx.connections.unregister(&self.connection_id);
    }
}

fn spawn_pump(
    ctx: Arc<AppContext>,
    connection_id: String,
    task_id: String,
    conversation_id: Option<String>,
    mut receiver: mpsc::Receiver<crate::stream::events::IndexedEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(indexed) = receiver.recv().await {
            let frame = stream_event_frame(&task_id, conversation_id.as_deref(), &indexed);
            if !ctx.connections.send_to_connection(&connection_id, frame) {
                break;
            }
        }
    })
}

/// Terminal state of a task as a `task_status` frame, for subscribers that
/// arrive after every buffer is gone.
fn task_snapshot_frame(task: &crate::storage::TaskRow) -> WsMessage {
    WsMessage::for_task(
        ServerMessageType::TaskStatus,
        json!({
            "status": task.status,
            "result": task
                .result
                .as_deref()
                .and_then(|r| serde_json::from_str::<serde_json::Value>(r).ok()),
            "content": task.accumulated_output,
            "credits_used": task.credits_used,
            "error_code": task.error_code,
            "error_message": task.error_message,
        }),
        &task.id,
        task.conversation_id.as_deref(),
    )
}
