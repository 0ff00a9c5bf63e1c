//! SQLite persistence for tasks, messages, and conversations.
//!
//! The task table is the single source of truth for lifecycle state. All
//! terminal transitions go through status-guarded UPDATEs so that concurrent
//! finalizers (a streaming producer and the poller, or two poll passes)
//! resolve to exactly one winner.

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use uuid::Uuid;

/// Task kind. Determines the delivery path (chat streams, image/video poll)
/// and the stuck-task timeout applied by the sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Chat,
    Image,
    Video,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Chat => "chat",
            TaskKind::Image => "image",
            TaskKind::Video => "video",
        }
    }
}

impl FromStr for TaskKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "chat" => Ok(TaskKind::Chat),
            "image" => Ok(TaskKind::Image),
            "video" => Ok(TaskKind::Video),
            other => anyhow::bail!("unknown task kind: {other}"),
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task status values as stored in the `status` column.
pub mod status {
    pub const PENDING: &str = "pending";
    pub const RUNNING: &str = "running";
    pub const COMPLETED: &str = "completed";
    pub const FAILED: &str = "failed";

    pub fn is_terminal(s: &str) -> bool {
        s == COMPLETED || s == FAILED
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TaskRow {
    pub id: String,
    /// Provider-side job id for image/video tasks. `None` for chat tasks,
    /// which never round-trip through the poller's query path.
    pub external_id: Option<String>,
    pub user_id: String,
    pub conversation_id: Option<String>,
    pub kind: String,
    pub status: String,
    pub model: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub last_polled_at: Option<String>,
    /// Streaming transcript persisted on a throttle so a crash loses at most
    /// one flush interval of output.
    pub accumulated_output: String,
    /// Opaque provider result JSON (urls, metadata) for generation tasks.
    pub result: Option<String>,
    pub credits_locked: i64,
    pub credits_used: i64,
    /// Ledger transaction id from the pre-submit lock, if any.
    pub credit_tx_id: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl TaskRow {
    pub fn kind(&self) -> Result<TaskKind> {
        self.kind.parse()
    }

    pub fn is_terminal(&self) -> bool {
        status::is_terminal(&self.status)
    }

    pub fn started_at(&self) -> Result<DateTime<Utc>> {
        Ok(DateTime::parse_from_rfc3339(&self.started_at)
            .with_context(|| format!("bad started_at on task {}", self.id))?
            .with_timezone(&Utc))
    }

    /// Minutes elapsed since the task started, for the stuck-task sweep.
    pub fn age_minutes(&self, now: DateTime<Utc>) -> Result<i64> {
        Ok((now - self.started_at()?).num_minutes())
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub user_id: String,
    pub role: String,
    pub content: String,
    pub media_url: Option<String>,
    pub credits_cost: i64,
    pub created_at: String,
}

/// Parameters for [`Storage::create_task`].
#[derive(Debug, Clone)]
pub struct NewTask {
    pub user_id: String,
    pub conversation_id: Option<String>,
    pub kind: TaskKind,
    pub model: String,
    pub credits_locked: i64,
    pub credit_tx_id: Option<String>,
}

pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Open (or create) the database under `data_dir` and apply the schema.
    pub async fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;
        let db_path = data_dir.join("gend.db");

        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open database at {}", db_path.display()))?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// In-memory database for tests.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(&self) -> Result<()> {
        // One statement per query; sqlite prepared statements take no more.
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                external_id TEXT,
                user_id TEXT NOT NULL,
                conversation_id TEXT,
                kind TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                model TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                last_polled_at TEXT,
                accumulated_output TEXT NOT NULL DEFAULT '',
                result TEXT,
                credits_locked INTEGER NOT NULL DEFAULT 0,
                credits_used INTEGER NOT NULL DEFAULT 0,
                credit_tx_id TEXT,
                error_code TEXT,
                error_message TEXT
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_user ON tasks(user_id)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_external ON tasks(external_id)",
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                media_url TEXT,
                credits_cost INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_messages_conversation \
             ON messages(conversation_id, created_at)",
            r#"
            CREATE TABLE IF NOT EXISTS credit_accounts (
                user_id TEXT PRIMARY KEY,
                balance INTEGER NOT NULL DEFAULT 0
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS credit_transactions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                task_id TEXT,
                amount INTEGER NOT NULL,
                state TEXT NOT NULL,
                reason TEXT NOT NULL,
                created_at TEXT NOT NULL,
                resolved_at TEXT
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_credit_tx_user ON credit_transactions(user_id)",
        ];
        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("failed to initialize schema")?;
        }
        Ok(())
    }

    // ---- tasks ----

    pub async fn create_task(&self, new: NewTask) -> Result<TaskRow> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO tasks (id, user_id, conversation_id, kind, status, model, started_at, \
             credits_locked, credit_tx_id) VALUES (?, ?, ?, ?, 'pending', ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&new.user_id)
        .bind(&new.conversation_id)
        .bind(new.kind.as_str())
        .bind(&new.model)
        .bind(&now)
        .bind(new.credits_locked)
        .bind(&new.credit_tx_id)
        .execute(&self.pool)
        .await
        .context("failed to insert task")?;

        self.get_task(&id)
            .await?
            .context("task vanished after insert")
    }

    pub async fn get_task(&self, id: &str) -> Result<Option<TaskRow>> {
        let row = sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn set_credit_tx_id(&self, id: &str, credit_tx_id: &str) -> Result<()> {
        sqlx::query("UPDATE tasks SET credit_tx_id = ? WHERE id = ?")
            .bind(credit_tx_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_external_id(&self, id: &str, external_id: &str) -> Result<()> {
        sqlx::query("UPDATE tasks SET external_id = ? WHERE id = ?")
            .bind(external_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Transition pending -> running. Returns false if the task was already
    /// claimed or resolved by someone else.
    pub async fn mark_task_running(&self, id: &str) -> Result<bool> {
        let result =
            sqlx::query("UPDATE tasks SET status = 'running' WHERE id = ? AND status = 'pending'")
                .bind(id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Persist the streaming transcript. Called on a throttle by producers.
    pub async fn update_accumulated(&self, id: &str, content: &str) -> Result<()> {
        sqlx::query("UPDATE tasks SET accumulated_output = ? WHERE id = ?")
            .bind(content)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record a poll attempt without touching status. Used when the provider
    /// query errors so the task stays eligible for later passes.
    pub async fn touch_polled(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE tasks SET last_polled_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Guarded terminal transition to `completed`. Returns true only for the
    /// caller that actually performed the transition; a false return means a
    /// concurrent finalizer won and the caller must not bill or notify.
    pub async fn complete_task(
        &self,
        id: &str,
        result: Option<&str>,
        accumulated: Option<&str>,
        credits_used: i64,
    ) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let outcome = sqlx::query(
            "UPDATE tasks SET status = 'completed', completed_at = ?, result = COALESCE(?, result), \
             accumulated_output = COALESCE(?, accumulated_output), credits_used = ? \
             WHERE id = ? AND status IN ('pending', 'running')",
        )
        .bind(&now)
        .bind(result)
        .bind(accumulated)
        .bind(credits_used)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(outcome.rows_affected() > 0)
    }

    /// Guarded terminal transition to `failed`. Same winner semantics as
    /// [`complete_task`]. Partial output is kept when provided.
    pub async fn fail_task(
        &self,
        id: &str,
        error_code: &str,
        error_message: &str,
        accumulated: Option<&str>,
    ) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let outcome = sqlx::query(
            "UPDATE tasks SET status = 'failed', completed_at = ?, error_code = ?, error_message = ?, \
             accumulated_output = COALESCE(?, accumulated_output) \
             WHERE id = ? AND status IN ('pending', 'running')",
        )
        .bind(&now)
        .bind(error_code)
        .bind(error_message)
        .bind(accumulated)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(outcome.rows_affected() > 0)
    }

    /// All tasks still in a non-terminal state, oldest first.
    pub async fn list_active_tasks(&self) -> Result<Vec<TaskRow>> {
        let rows = sqlx::query_as::<_, TaskRow>(
            "SELECT * FROM tasks WHERE status IN ('pending', 'running') ORDER BY started_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Fail chat tasks left non-terminal by a previous process. Their
    /// producers died with the process, so nothing will ever finish them.
    /// Returns the number of tasks failed.
    pub async fn recover_orphaned_chat_tasks(&self) -> Result<u64> {
        let now = Utc::now().to_rfc3339();
        let outcome = sqlx::query(
            "UPDATE tasks SET status = 'failed', completed_at = ?, error_code = 'interrupted', \
             error_message = 'server restarted during generation' \
             WHERE kind = 'chat' AND status IN ('pending', 'running')",
        )
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(outcome.rows_affected())
    }

    // ---- messages ----

    pub async fn create_message(
        &self,
        conversation_id: &str,
        user_id: &str,
        role: &str,
        content: &str,
        media_url: Option<&str>,
        credits_cost: i64,
    ) -> Result<MessageRow> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO messages (id, conversation_id, user_id, role, content, media_url, \
             credits_cost, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(conversation_id)
        .bind(user_id)
        .bind(role)
        .bind(content)
        .bind(media_url)
        .bind(credits_cost)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("failed to insert message")?;

        let row = sqlx::query_as::<_, MessageRow>("SELECT * FROM messages WHERE id = ?")
            .bind(&id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn list_messages(&self, conversation_id: &str) -> Result<Vec<MessageRow>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT * FROM messages WHERE conversation_id = ? ORDER BY created_at ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn storage() -> Storage {
        Storage::in_memory().await.unwrap()
    }

    fn new_task(kind: TaskKind) -> NewTask {
        NewTask {
            user_id: "u1".into(),
            conversation_id: Some("c1".into()),
            kind,
            model: "test-model".into(),
            credits_locked: 0,
            credit_tx_id: None,
        }
    }

    #[tokio::test]
    async fn create_and_fetch_task() {
        let s = storage().await;
        let task = s.create_task(new_task(TaskKind::Chat)).await.unwrap();
        assert_eq!(task.status, status::PENDING);
        assert_eq!(task.kind().unwrap(), TaskKind::Chat);

        let fetched = s.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, task.id);
    }

    #[tokio::test]
    async fn complete_wins_exactly_once() {
        let s = storage().await;
        let task = s.create_task(new_task(TaskKind::Image)).await.unwrap();
        assert!(s.mark_task_running(&task.id).await.unwrap());

        let first = s.complete_task(&task.id, Some("{}"), None, 5).await.unwrap();
        let second = s.complete_task(&task.id, Some("{}"), None, 5).await.unwrap();
        assert!(first);
        assert!(!second);

        // A late fail transition is also a no-op.
        let failed = s.fail_task(&task.id, "timeout", "too slow", None).await.unwrap();
        assert!(!failed);

        let row = s.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(row.status, status::COMPLETED);
        assert_eq!(row.credits_used, 5);
        assert!(row.completed_at.is_some());
    }

    #[tokio::test]
    async fn mark_running_only_from_pending() {
        let s = storage().await;
        let task = s.create_task(new_task(TaskKind::Chat)).await.unwrap();
        assert!(s.mark_task_running(&task.id).await.unwrap());
        assert!(!s.mark_task_running(&task.id).await.unwrap());
    }

    #[tokio::test]
    async fn fail_preserves_partial_output() {
        let s = storage().await;
        let task = s.create_task(new_task(TaskKind::Chat)).await.unwrap();
        s.mark_task_running(&task.id).await.unwrap();
        s.update_accumulated(&task.id, "partial text").await.unwrap();

        assert!(s
            .fail_task(&task.id, "stream_error", "connection dropped", None)
            .await
            .unwrap());
        let row = s.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(row.status, status::FAILED);
        assert_eq!(row.accumulated_output, "partial text");
        assert_eq!(row.error_code.as_deref(), Some("stream_error"));
    }

    #[tokio::test]
    async fn recover_orphans_only_touches_chat() {
        let s = storage().await;
        let chat = s.create_task(new_task(TaskKind::Chat)).await.unwrap();
        s.mark_task_running(&chat.id).await.unwrap();
        let image = s.create_task(new_task(TaskKind::Image)).await.unwrap();
        s.mark_task_running(&image.id).await.unwrap();

        let recovered = s.recover_orphaned_chat_tasks().await.unwrap();
        assert_eq!(recovered, 1);

        let chat = s.get_task(&chat.id).await.unwrap().unwrap();
        assert_eq!(chat.status, status::FAILED);
        assert_eq!(chat.error_code.as_deref(), Some("interrupted"));

        // Image tasks survive restarts; the poller resumes them.
        let image = s.get_task(&image.id).await.unwrap().unwrap();
        assert_eq!(image.status, status::RUNNING);
    }

    #[tokio::test]
    async fn active_tasks_ordering() {
        let s = storage().await;
        let a = s.create_task(new_task(TaskKind::Image)).await.unwrap();
        let b = s.create_task(new_task(TaskKind::Video)).await.unwrap();
        s.complete_task(&a.id, None, None, 0).await.unwrap();

        let active = s.list_active_tasks().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, b.id);
    }

    #[tokio::test]
    async fn messages_round_trip() {
        let s = storage().await;
        let msg = s
            .create_message("c1", "u1", "assistant", "hi there", None, 3)
            .await
            .unwrap();
        assert_eq!(msg.role, "assistant");
        let listed = s.list_messages("c1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, msg.id);
    }
}
