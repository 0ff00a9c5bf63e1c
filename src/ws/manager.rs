// SPDX-License-Identifier: MIT
//! Connection registry and per-task message buffers.
//!
//! Tracks every authenticated websocket, enforces the per-user connection
//! cap, and keeps a bounded replay buffer of recent frames per task so a
//! client that reconnects mid-generation can catch up. Delivery is always
//! `try_send` into the connection's bounded outbound queue; a queue that is
//! full or closed costs that connection its registration, never anyone
//! else's frames.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::WebSocketSection;

use super::protocol::WsMessage;

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub max_connections_per_user: usize,
    pub heartbeat_timeout: Duration,
    pub buffer_max_bytes: usize,
    pub buffer_max_age: Duration,
    pub buffer_idle_max_age: Duration,
    pub completed_grace: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self::from(&WebSocketSection::default())
    }
}

impl From<&WebSocketSection> for ManagerSettings {
    fn from(section: &WebSocketSection) -> Self {
        Self {
            // A cap of zero would make every register evict from an empty
            // list; the smallest meaningful cap is one connection.
            max_connections_per_user: section.max_connections_per_user.max(1),
            heartbeat_timeout: section.heartbeat_timeout(),
            buffer_max_bytes: section.buffer_max_bytes,
            buffer_max_age: section.buffer_max_age(),
            buffer_idle_max_age: section.buffer_idle_max_age(),
            completed_grace: section.completed_grace(),
        }
    }
}

struct Connection {
    id: String,
    user_id: String,
    outbound: mpsc::Sender<WsMessage>,
    connected_at: Instant,
    last_heartbeat: Instant,
    tasks: HashSet<String>,
}

struct BufferedFrame {
    at: Instant,
    index: u64,
    frame: WsMessage,
    bytes: usize,
}

/// Replayable frame history for one task.
struct TaskBuffer {
    frames: VecDeque<BufferedFrame>,
    total_bytes: usize,
    next_index: u64,
    accumulated: String,
    last_write: Instant,
    /// Set when the task reaches a terminal state; the buffer survives until
    /// then-plus-grace for late reconnects.
    expire_at: Option<Instant>,
}

impl TaskBuffer {
    fn new() -> Self {
        Self {
            frames: VecDeque::new(),
            total_bytes: 0,
            next_index: 0,
            accumulated: String::new(),
            last_write: Instant::now(),
            expire_at: None,
        }
    }

    fn push(&mut self, mut frame: WsMessage, index: Option<u64>, settings: &ManagerSettings) -> u64 {
        let index = match index {
            Some(i) => {
                self.next_index = self.next_index.max(i + 1);
                i
            }
            None => {
                let i = self.next_index;
                self.next_index += 1;
                i
            }
        };
        frame.message_index = Some(index as i64);

        // Snapshot chunks are themselves derived from `accumulated`; only
        // incremental chunks extend it.
        if frame.payload.get("accumulated").is_none() {
            if let Some(text) = frame.chunk_text() {
                self.accumulated.push_str(text);
            }
        }

        let bytes = frame.cost_bytes();
        self.frames.push_back(BufferedFrame {
            at: Instant::now(),
            index,
            frame,
            bytes,
        });
        self.total_bytes += bytes;
        self.last_write = Instant::now();
        self.evict(settings);
        index
    }

    /// Oldest-first eviction under the byte ceiling and the age bound.
    fn evict(&mut self, settings: &ManagerSettings) {
        let now = Instant::now();
        while let Some(front) = self.frames.front() {
            let too_big = self.total_bytes > settings.buffer_max_bytes;
            let too_old = now.duration_since(front.at) > settings.buffer_max_age;
            if !too_big && !too_old {
                break;
            }
            self.total_bytes -= front.bytes;
            self.frames.pop_front();
        }
    }

    fn replay_after(&self, last_index: i64) -> Vec<WsMessage> {
        self.frames
            .iter()
            .filter(|f| (f.index as i64) > last_index)
            .map(|f| f.frame.clone())
            .collect()
    }

    fn is_expired(&self, now: Instant, settings: &ManagerSettings) -> bool {
        if let Some(expire_at) = self.expire_at {
            return now >= expire_at;
        }
        // Nothing ever marked this task complete; drop on long idleness so a
        // lost completion signal cannot pin memory forever.
        now.duration_since(self.last_write) > settings.buffer_idle_max_age
    }
}

/// Replay data handed to a subscribing connection.
pub struct Replay {
    /// Output accumulated before the replay window, for snapshot requests.
    pub accumulated: String,
    pub frames: Vec<WsMessage>,
    /// Highest index the buffer has assigned, or -1 when empty.
    pub current_index: i64,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<String, Connection>,
    /// Per-user connection ids in connect order, oldest first.
    user_connections: HashMap<String, Vec<String>>,
    task_subscribers: HashMap<String, HashSet<String>>,
    buffers: HashMap<String, TaskBuffer>,
}

pub struct ConnectionManager {
    inner: Mutex<Inner>,
    settings: ManagerSettings,
}

#[derive(Debug, Default, PartialEq)]
pub struct SweepStats {
    pub dropped_connections: usize,
    pub dropped_buffers: usize,
}

impl ConnectionManager {
    pub fn new(settings: ManagerSettings) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            settings,
        }
    }

    /// Register an authenticated connection. When the user is at the cap the
    /// oldest connection is evicted: dropping its outbound sender ends its
    /// socket loop.
    pub fn register(&self, user_id: &str, outbound: mpsc::Sender<WsMessage>) -> String {
        let id = Uuid::new_v4().to_string();
        let mut inner = self.lock();

        let mut evicted = Vec::new();
        {
            let user_list = inner
                .user_connections
                .entry(user_id.to_string())
                .or_default();
            while !user_list.is_empty() && user_list.len() >= self.settings.max_connections_per_user {
                evicted.push(user_list.remove(0));
            }
            user_list.push(id.clone());
        }
        for oldest in evicted {
            if let Some(old) = inner.connections.remove(&oldest) {
                let _ = old
                    .outbound
                    .try_send(WsMessage::error("connection_replaced", "newer connection opened"));
                debug!(user_id, connection_id = %oldest, "evicted oldest connection at cap");
                Self::detach_tasks(&mut inner.task_subscribers, &old);
            }
        }

        inner.connections.insert(
            id.clone(),
            Connection {
                id: id.clone(),
                user_id: user_id.to_string(),
                outbound,
                connected_at: Instant::now(),
                last_heartbeat: Instant::now(),
                tasks: HashSet::new(),
            },
        );
        debug!(user_id, connection_id = %id, "connection registered");
        id
    }

    pub fn unregister(&self, connection_id: &str) {
        let mut inner = self.lock();
        let Some(conn) = inner.connections.remove(connection_id) else {
            return;
        };
        if let Some(list) = inner.user_connections.get_mut(&conn.user_id) {
            list.retain(|c| c != connection_id);
            if list.is_empty() {
                inner.user_connections.remove(&conn.user_id);
            }
        }
        Self::detach_tasks(&mut inner.task_subscribers, &conn);
        debug!(
            connection_id,
            user_id = %conn.user_id,
            session_secs = conn.connected_at.elapsed().as_secs(),
            "connection unregistered"
        );
    }

    fn detach_tasks(task_subscribers: &mut HashMap<String, HashSet<String>>, conn: &Connection) {
        for task_id in &conn.tasks {
            if let Some(subs) = task_subscribers.get_mut(task_id) {
                subs.remove(&conn.id);
                if subs.is_empty() {
                    task_subscribers.remove(task_id);
                }
            }
        }
    }

    pub fn heartbeat(&self, connection_id: &str) {
        let mut inner = self.lock();
        if let Some(conn) = inner.connections.get_mut(connection_id) {
            conn.last_heartbeat = Instant::now();
        }
    }

    /// Attach a connection to a task and return buffered replay data.
    /// `last_index < 0` asks for the accumulated snapshot instead of frames.
    pub fn subscribe(&self, connection_id: &str, task_id: &str, last_index: i64) -> Option<Replay> {
        let mut inner = self.lock();
        let conn = inner.connections.get_mut(connection_id)?;
        conn.tasks.insert(task_id.to_string());
        let conn_id = conn.id.clone();
        inner
            .task_subscribers
            .entry(task_id.to_string())
            .or_default()
            .insert(conn_id);

        let buffer = inner.buffers.get(task_id)?;
        let current_index = buffer.next_index as i64 - 1;
        if last_index < 0 {
            Some(Replay {
                accumulated: buffer.accumulated.clone(),
                frames: Vec::new(),
                current_index,
            })
        } else {
            Some(Replay {
                accumulated: String::new(),
                frames: buffer.replay_after(last_index),
                current_index,
            })
        }
    }

    pub fn unsubscribe(&self, connection_id: &str, task_id: &str) {
        let mut inner = self.lock();
        if let Some(conn) = inner.connections.get_mut(connection_id) {
            conn.tasks.remove(task_id);
        }
        if let Some(subs) = inner.task_subscribers.get_mut(task_id) {
            subs.remove(connection_id);
            if subs.is_empty() {
                inner.task_subscribers.remove(task_id);
            }
        }
    }

    /// Queue a frame to one connection. A full or closed queue drops the
    /// connection and returns false.
    pub fn send_to_connection(&self, connection_id: &str, frame: WsMessage) -> bool {
        let failed = {
            let inner = self.lock();
            let Some(conn) = inner.connections.get(connection_id) else {
                return false;
            };
            conn.outbound.try_send(frame).is_err()
        };
        if failed {
            warn!(connection_id, "outbound queue unavailable, dropping connection");
            self.unregister(connection_id);
        }
        !failed
    }

    /// Queue a frame to every connection of one user. Returns the number of
    /// connections reached.
    pub fn send_to_user(&self, user_id: &str, frame: &WsMessage) -> usize {
        let targets: Vec<String> = {
            let inner = self.lock();
            inner
                .user_connections
                .get(user_id)
                .cloned()
                .unwrap_or_default()
        };
        targets
            .iter()
            .filter(|id| self.send_to_connection(id, frame.clone()))
            .count()
    }

    /// Buffer a frame for a task and fan it out to that task's subscribers.
    /// `index` pins the frame to a producer-assigned stream index; `None`
    /// lets the buffer assign the next one. Returns the index used.
    pub fn publish_to_task(&self, task_id: &str, frame: WsMessage, index: Option<u64>) -> u64 {
        let (stamped, targets) = {
            let mut inner = self.lock();
            let buffer = inner
                .buffers
                .entry(task_id.to_string())
                .or_insert_with(TaskBuffer::new);
            let mut stamped = frame;
            let used = buffer.push(stamped.clone(), index, &self.settings);
            stamped.message_index = Some(used as i64);
            let targets: Vec<String> = inner
                .task_subscribers
                .get(task_id)
                .map(|s| s.iter().cloned().collect())
                .unwrap_or_default();
            (stamped, targets)
        };
        let index = stamped.message_index.unwrap_or(0) as u64;
        for target in targets {
            self.send_to_connection(&target, stamped.clone());
        }
        index
    }

    /// Record a frame in the task buffer without fanning it out. Producers
    /// use this for events already delivered over live subscriptions.
    pub fn buffer_for_task(&self, task_id: &str, frame: WsMessage, index: Option<u64>) -> u64 {
        let mut inner = self.lock();
        let buffer = inner
            .buffers
            .entry(task_id.to_string())
            .or_insert_with(TaskBuffer::new);
        buffer.push(frame, index, &self.settings)
    }

    /// Start the grace countdown on a finished task's buffer.
    pub fn mark_task_completed(&self, task_id: &str) {
        let mut inner = self.lock();
        if let Some(buffer) = inner.buffers.get_mut(task_id) {
            buffer.expire_at = Some(Instant::now() + self.settings.completed_grace);
        }
    }

    /// Queue a frame to every connection, for shutdown notices.
    pub fn broadcast(&self, frame: &WsMessage) -> usize {
        let targets: Vec<String> = {
            let inner = self.lock();
            inner.connections.keys().cloned().collect()
        };
        targets
            .iter()
            .filter(|id| self.send_to_connection(id, frame.clone()))
            .count()
    }

    /// Periodic cleanup: connections with stale heartbeats and buffers past
    /// their grace or idle bound.
    pub fn sweep(&self) -> SweepStats {
        let now = Instant::now();
        let mut stats = SweepStats::default();

        let stale: Vec<String> = {
            let inner = self.lock();
            inner
                .connections
                .values()
                .filter(|c| now.duration_since(c.last_heartbeat) > self.settings.heartbeat_timeout)
                .map(|c| c.id.clone())
                .collect()
        };
        for connection_id in stale {
            warn!(connection_id, "dropping connection with stale heartbeat");
            self.unregister(&connection_id);
            stats.dropped_connections += 1;
        }

        let mut inner = self.lock();
        let before = inner.buffers.len();
        let settings = &self.settings;
        inner.buffers.retain(|_, b| !b.is_expired(now, settings));
        stats.dropped_buffers = before - inner.buffers.len();

        // Live buffers still shed over-age frames even with no new writes.
        for buffer in inner.buffers.values_mut() {
            buffer.evict(settings);
        }
        stats
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn user_connection_count(&self, user_id: &str) -> usize {
        self.lock()
            .user_connections
            .get(user_id)
            .map(|l| l.len())
            .unwrap_or(0)
    }

    pub fn buffer_count(&self) -> usize {
        self.lock().buffers.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::protocol::ServerMessageType;
    use serde_json::json;

    fn settings() -> ManagerSettings {
        ManagerSettings {
            max_connections_per_user: 2,
            heartbeat_timeout: Duration::from_secs(60),
            buffer_max_bytes: 4096,
            buffer_max_age: Duration::from_secs(300),
            buffer_idle_max_age: Duration::from_secs(1800),
            completed_grace: Duration::from_secs(300),
        }
    }

    fn channel() -> (mpsc::Sender<WsMessage>, mpsc::Receiver<WsMessage>) {
        mpsc::channel(16)
    }

    fn chunk(text: &str) -> WsMessage {
        WsMessage::for_task(
            ServerMessageType::ChatChunk,
            json!({ "text": text }),
            "t1",
            None,
        )
    }

    #[test]
    fn cap_evicts_oldest_connection() {
        let manager = ConnectionManager::new(settings());
        let (tx1, mut rx1) = channel();
        let (tx2, _rx2) = channel();
        let (tx3, _rx3) = channel();

        let first = manager.register("u1", tx1);
        let _second = manager.register("u1", tx2);
        assert_eq!(manager.user_connection_count("u1"), 2);

        let _third = manager.register("u1", tx3);
        assert_eq!(manager.user_connection_count("u1"), 2);
        assert!(!manager.send_to_connection(&first, WsMessage::ping()));

        // The evicted socket got told why before losing its sender.
        let notice = rx1.try_recv().unwrap();
        assert_eq!(notice.message_type, ServerMessageType::Error);
        assert_eq!(notice.payload["code"], "connection_replaced");
    }

    #[test]
    fn zero_connection_cap_behaves_as_one() {
        let mut s = settings();
        s.max_connections_per_user = 0;
        let manager = ConnectionManager::new(s);
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();

        let first = manager.register("u1", tx1);
        assert_eq!(manager.user_connection_count("u1"), 1);

        let second = manager.register("u1", tx2);
        assert_eq!(manager.user_connection_count("u1"), 1);
        assert!(!manager.send_to_connection(&first, WsMessage::ping()));
        assert!(manager.send_to_connection(&second, WsMessage::ping()));
    }

    #[test]
    fn config_section_cap_is_clamped_to_one() {
        let mut section = WebSocketSection::default();
        section.max_connections_per_user = 0;
        let s = ManagerSettings::from(&section);
        assert_eq!(s.max_connections_per_user, 1);
    }

    #[test]
    fn publish_reaches_only_subscribers() {
        let manager = ConnectionManager::new(settings());
        let (tx1, mut rx1) = channel();
        let (tx2, mut rx2) = channel();
        let sub = manager.register("u1", tx1);
        let _other = manager.register("u2", tx2);
        let _ = manager.subscribe(&sub, "t1", -1);

        manager.publish_to_task("t1", chunk("hello"), None);

        let got = rx1.try_recv().unwrap();
        assert_eq!(got.chunk_text(), Some("hello"));
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn replay_returns_only_newer_frames() {
        let manager = ConnectionManager::new(settings());
        for (i, text) in ["a", "b", "c"].iter().enumerate() {
            manager.buffer_for_task("t1", chunk(text), Some(i as u64));
        }

        let (tx, _rx) = channel();
        let conn = manager.register("u1", tx);
        let replay = manager.subscribe(&conn, "t1", 0).unwrap();
        assert_eq!(replay.current_index, 2);
        let texts: Vec<_> = replay
            .frames
            .iter()
            .map(|f| f.chunk_text().unwrap().to_string())
            .collect();
        assert_eq!(texts, vec!["b", "c"]);
    }

    #[test]
    fn snapshot_request_gets_accumulated_text() {
        let manager = ConnectionManager::new(settings());
        manager.buffer_for_task("t1", chunk("hel"), None);
        manager.buffer_for_task("t1", chunk("lo"), None);

        let (tx, _rx) = channel();
        let conn = manager.register("u1", tx);
        let replay = manager.subscribe(&conn, "t1", -1).unwrap();
        assert_eq!(replay.accumulated, "hello");
        assert!(replay.frames.is_empty());
        assert_eq!(replay.current_index, 1);
    }

    #[test]
    fn byte_ceiling_evicts_oldest() {
        let mut s = settings();
        s.buffer_max_bytes = 300;
        let manager = ConnectionManager::new(s);

        for i in 0..10 {
            manager.buffer_for_task("t1", chunk(&format!("chunk-{i:02}-{}", "x".repeat(40))), None);
        }

        let (tx, _rx) = channel();
        let conn = manager.register("u1", tx);
        let replay = manager.subscribe(&conn, "t1", -1).unwrap();
        // Indexes keep counting even after eviction.
        assert_eq!(replay.current_index, 9);

        let resumed = manager.subscribe(&conn, "t1", 0).unwrap();
        // Early frames are gone; whatever survived is still ordered and recent.
        assert!(resumed.frames.len() < 10);
        let last = resumed.frames.last().unwrap();
        assert_eq!(last.message_index, Some(9));
    }

    #[test]
    fn slow_consumer_is_dropped_alone() {
        let manager = ConnectionManager::new(settings());
        let (tx_slow, _rx_slow) = mpsc::channel(1);
        let (tx_ok, mut rx_ok) = channel();
        let slow = manager.register("u1", tx_slow);
        let ok = manager.register("u2", tx_ok);
        let _ = manager.subscribe(&slow, "t1", -1);
        let _ = manager.subscribe(&ok, "t1", -1);

        // Two frames overflow the slow queue of depth one.
        manager.publish_to_task("t1", chunk("one"), None);
        manager.publish_to_task("t1", chunk("two"), None);

        assert_eq!(manager.connection_count(), 1);
        assert_eq!(rx_ok.try_recv().unwrap().chunk_text(), Some("one"));
        assert_eq!(rx_ok.try_recv().unwrap().chunk_text(), Some("two"));
    }

    #[test]
    fn sweep_drops_expired_buffers_and_stale_connections() {
        let mut s = settings();
        s.completed_grace = Duration::ZERO;
        s.heartbeat_timeout = Duration::ZERO;
        let manager = ConnectionManager::new(s);

        let (tx, _rx) = channel();
        manager.register("u1", tx);
        manager.buffer_for_task("t1", chunk("x"), None);
        manager.mark_task_completed("t1");

        std::thread::sleep(Duration::from_millis(5));
        let stats = manager.sweep();
        assert_eq!(stats.dropped_connections, 1);
        assert_eq!(stats.dropped_buffers, 1);
        assert_eq!(manager.connection_count(), 0);
        assert_eq!(manager.buffer_count(), 0);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let manager = ConnectionManager::new(settings());
        let (tx, mut rx) = channel();
        let conn = manager.register("u1", tx);
        let _ = manager.subscribe(&conn, "t1", -1);
        manager.unsubscribe(&conn, "t1");

        manager.publish_to_task("t1", chunk("quiet"), None);
        assert!(rx.try_recv().is_err());
    }
}
