//! Credit accounts and the lock/confirm/refund transaction ledger.
//!
//! Generation tasks lock an estimate before submission and resolve the lock
//! exactly once when the task reaches a terminal state. Chat tasks deduct
//! after the fact, once the actual usage is known. All balance math happens
//! inside SQL transactions with state-guarded updates, so a double confirm
//! or a confirm-after-refund is a visible error rather than silent double
//! billing.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient credits: need {needed}, have {available}")]
    InsufficientCredits { needed: i64, available: i64 },
    #[error("unknown credit transaction {0}")]
    UnknownTransaction(String),
    #[error("credit transaction {0} already resolved")]
    AlreadyResolved(String),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// Lifecycle states of a ledger transaction row.
pub mod tx_state {
    pub const LOCKED: &str = "locked";
    pub const CONFIRMED: &str = "confirmed";
    pub const REFUNDED: &str = "refunded";
    pub const DEDUCTED: &str = "deducted";
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CreditTransaction {
    pub id: String,
    pub user_id: String,
    pub task_id: Option<String>,
    pub amount: i64,
    pub state: String,
    pub reason: String,
    pub created_at: String,
    pub resolved_at: Option<String>,
}

pub struct CreditLedger {
    pool: SqlitePool,
}

impl CreditLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Add credits to an account, creating it if needed.
    pub async fn grant(&self, user_id: &str, amount: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO credit_accounts (user_id, balance) VALUES (?, ?) \
             ON CONFLICT(user_id) DO UPDATE SET balance = balance + excluded.balance",
        )
        .bind(user_id)
        .bind(amount)
        .execute(&self.pool)
        .await
        .context("failed to grant credits")?;
        Ok(())
    }

    pub async fn balance(&self, user_id: &str) -> Result<i64> {
        let balance: Option<i64> =
            sqlx::query_scalar("SELECT balance FROM credit_accounts WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(balance.unwrap_or(0))
    }

    /// Immediately deduct `amount` from the user's balance. Used by the chat
    /// path where usage is only known at stream end.
    pub async fn deduct(
        &self,
        user_id: &str,
        task_id: Option<&str>,
        amount: i64,
        reason: &str,
    ) -> Result<String, LedgerError> {
        self.take(user_id, task_id, amount, reason, tx_state::DEDUCTED)
            .await
    }

    /// Lock `amount` ahead of provider submission. Returns the transaction id
    /// the caller stores on the task for later confirm/refund.
    pub async fn lock(
        &self,
        user_id: &str,
        task_id: &str,
        amount: i64,
        reason: &str,
    ) -> Result<String, LedgerError> {
        self.take(user_id, Some(task_id), amount, reason, tx_state::LOCKED)
            .await
    }

    async fn take(
        &self,
        user_id: &str,
        task_id: Option<&str>,
        amount: i64,
        reason: &str,
        state: &str,
    ) -> Result<String, LedgerError> {
        let mut tx = self.pool.begin().await?;

        let debited = sqlx::query(
            "UPDATE credit_accounts SET balance = balance - ? WHERE user_id = ? AND balance >= ?",
        )
        .bind(amount)
        .bind(user_id)
        .bind(amount)
        .execute(&mut *tx)
        .await?;

        if debited.rows_affected() == 0 {
            let available: Option<i64> =
                sqlx::query_scalar("SELECT balance FROM credit_accounts WHERE user_id = ?")
                    .bind(user_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            tx.rollback().await?;
            return Err(LedgerError::InsufficientCredits {
                needed: amount,
                available: available.unwrap_or(0),
            });
        }

        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO credit_transactions (id, user_id, task_id, amount, state, reason, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(user_id)
        .bind(task_id)
        .bind(amount)
        .bind(state)
        .bind(reason)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(user_id, amount, state, tx_id = %id, "credits taken");
        Ok(id)
    }

    /// Convert a lock into a final charge. No balance change; the credits
    /// were already removed at lock time.
    pub async fn confirm(&self, tx_id: &str) -> Result<(), LedgerError> {
        let outcome = sqlx::query(
            "UPDATE credit_transactions SET state = 'confirmed', resolved_at = ? \
             WHERE id = ? AND state = 'locked'",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(tx_id)
        .execute(&self.pool)
        .await?;

        if outcome.rows_affected() == 0 {
            return Err(self.resolve_failure(tx_id).await?);
        }
        Ok(())
    }

    /// Release a lock back to the user's balance after a failure or timeout.
    pub async fn refund(&self, tx_id: &str) -> Result<(), LedgerError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, CreditTransaction>(
            "SELECT * FROM credit_transactions WHERE id = ? AND state = 'locked'",
        )
        .bind(tx_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Err(self.resolve_failure(tx_id).await?);
        };

        sqlx::query(
            "UPDATE credit_transactions SET state = 'refunded', resolved_at = ? WHERE id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(tx_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE credit_accounts SET balance = balance + ? WHERE user_id = ?")
            .bind(row.amount)
            .bind(&row.user_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!(tx_id, amount = row.amount, user_id = %row.user_id, "credits refunded");
        Ok(())
    }

    pub async fn get_transaction(&self, tx_id: &str) -> Result<Option<CreditTransaction>> {
        let row = sqlx::query_as::<_, CreditTransaction>(
            "SELECT * FROM credit_transactions WHERE id = ?",
        )
        .bind(tx_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn resolve_failure(&self, tx_id: &str) -> Result<LedgerError, sqlx::Error> {
        let exists: Option<String> =
            sqlx::query_scalar("SELECT state FROM credit_transactions WHERE id = ?")
                .bind(tx_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(match exists {
            Some(_) => LedgerError::AlreadyResolved(tx_id.to_string()),
            None => LedgerError::UnknownTransaction(tx_id.to_string()),
        })
    }
}
