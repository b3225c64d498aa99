//! Persistence layer.
//!
//! One `sessions` row per user in SQLite via `sqlx`. Every write is a
//! compare-and-swap on the `version` column, so concurrent writers for the
//! same session never silently overwrite each other. The `next_run_at`
//! column doubles as the scheduler's persisted delayed-task queue.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info, warn};

use crate::types::{CycleError, Session};

/// Attempts made by [`SessionStore::modify`] before giving up on a
/// contended row.
const MAX_CAS_ATTEMPTS: usize = 3;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id                  TEXT PRIMARY KEY,
    user_id             TEXT NOT NULL UNIQUE,
    wallet_public_key   TEXT NOT NULL,
    wallet_private_key  TEXT NOT NULL,
    trade_size_sol      TEXT NOT NULL,
    is_active           INTEGER NOT NULL DEFAULT 0,
    cycles_completed    INTEGER NOT NULL DEFAULT 0,
    max_cycles          INTEGER NOT NULL,
    total_volume_usd    TEXT NOT NULL DEFAULT '0',
    started_at          INTEGER,
    next_run_at         INTEGER,
    run_id              TEXT,
    created_at          INTEGER NOT NULL,
    updated_at          INTEGER NOT NULL,
    version             INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_sessions_due ON sessions (is_active, next_run_at);
"#;

/// Session repository backed by a SQLite pool.
#[derive(Clone)]
pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    /// Open (creating if needed) the database at `url` and apply the schema.
    pub async fn connect(url: &str) -> Result<Self, CycleError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);

        // Each in-memory connection is its own database, so the pool must
        // hold exactly one and never recycle it.
        let pool = if url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        }
        .connect_with(options)
        .await?;

        let store = Self { pool };
        store.migrate().await?;
        info!(url, "Session store ready");
        Ok(store)
    }

    /// Fresh in-memory store, for tests.
    pub async fn in_memory() -> Result<Self, CycleError> {
        Self::connect("sqlite::memory:").await
    }

    async fn migrate(&self) -> Result<(), CycleError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Load the session of `user_id`, if any.
    pub async fn get(&self, user_id: &str) -> Result<Option<Session>, CycleError> {
        let row = sqlx::query("SELECT * FROM sessions WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_session).transpose()
    }

    /// Load the session of `user_id` or fail with `SessionNotFound`.
    pub async fn require(&self, user_id: &str) -> Result<Session, CycleError> {
        self.get(user_id)
            .await?
            .ok_or_else(|| CycleError::SessionNotFound(user_id.to_string()))
    }

    /// Install a (new) custodied wallet for the session's user.
    ///
    /// An existing row keeps its id but is reset: inactive, counters
    /// zeroed, no pending run. A claim held by an in-flight cycle is kept
    /// so that cycle still releases it.
    pub async fn upsert_wallet(&self, session: &Session) -> Result<Session, CycleError> {
        let now = Utc::now().timestamp_millis();
        sqlx::query(
            r#"
            INSERT INTO sessions (
                id, user_id, wallet_public_key, wallet_private_key, trade_size_sol,
                is_active, cycles_completed, max_cycles, total_volume_usd,
                started_at, next_run_at, run_id, created_at, updated_at, version
            ) VALUES (?, ?, ?, ?, ?, 0, 0, ?, '0', NULL, NULL, NULL, ?, ?, 0)
            ON CONFLICT(user_id) DO UPDATE SET
                wallet_public_key  = excluded.wallet_public_key,
                wallet_private_key = excluded.wallet_private_key,
                trade_size_sol     = excluded.trade_size_sol,
                is_active          = 0,
                cycles_completed   = 0,
                max_cycles         = excluded.max_cycles,
                total_volume_usd   = '0',
                started_at         = NULL,
                next_run_at        = NULL,
                updated_at         = excluded.updated_at,
                version            = sessions.version + 1
            "#,
        )
        .bind(&session.id)
        .bind(&session.user_id)
        .bind(&session.wallet_public_key)
        .bind(&session.wallet_private_key)
        .bind(session.trade_size_sol.to_string())
        .bind(i64::from(session.max_cycles))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        debug!(user_id = %session.user_id, wallet = %session.wallet_public_key, "Wallet stored");
        self.require(&session.user_id).await
    }

    /// Write `session` if its version is still current.
    ///
    /// Returns the stored session with its bumped version, or
    /// `VersionConflict` when someone else wrote first.
    pub async fn update(&self, session: &Session) -> Result<Session, CycleError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE sessions SET
                wallet_public_key  = ?,
                wallet_private_key = ?,
                trade_size_sol     = ?,
                is_active          = ?,
                cycles_completed   = ?,
                max_cycles         = ?,
                total_volume_usd   = ?,
                started_at         = ?,
                next_run_at        = ?,
                run_id             = ?,
                updated_at         = ?,
                version            = version + 1
            WHERE user_id = ? AND version = ?
            "#,
        )
        .bind(&session.wallet_public_key)
        .bind(&session.wallet_private_key)
        .bind(session.trade_size_sol.to_string())
        .bind(session.is_active)
        .bind(i64::from(session.cycles_completed))
        .bind(i64::from(session.max_cycles))
        .bind(session.total_volume_usd.to_string())
        .bind(session.started_at.map(|t| t.timestamp_millis()))
        .bind(session.next_run_at.map(|t| t.timestamp_millis()))
        .bind(session.run_id.as_deref())
        .bind(now.timestamp_millis())
        .bind(&session.user_id)
        .bind(version_to_i64(session.version)?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CycleError::VersionConflict(session.user_id.clone()));
        }

        let mut stored = session.clone();
        stored.version += 1;
        stored.updated_at = now;
        Ok(stored)
    }

    /// Load, mutate and write back a session, retrying on version
    /// conflicts. `f` may be called more than once and must only depend on
    /// the session it is given.
    pub async fn modify<T, F>(&self, user_id: &str, mut f: F) -> Result<(Session, T), CycleError>
    where
        F: FnMut(&mut Session) -> Result<T, CycleError>,
    {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let mut session = self.require(user_id).await?;
            let out = f(&mut session)?;
            match self.update(&session).await {
                Ok(stored) => return Ok((stored, out)),
                Err(CycleError::VersionConflict(_)) => {
                    warn!(user_id, attempt, "Session write conflict, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(CycleError::VersionConflict(user_id.to_string()))
    }

    /// Active sessions whose next run is due at or before `now`.
    pub async fn due_sessions(&self, now: DateTime<Utc>) -> Result<Vec<Session>, CycleError> {
        let rows = sqlx::query(
            "SELECT * FROM sessions
             WHERE is_active = 1 AND next_run_at IS NOT NULL AND next_run_at <= ?
             ORDER BY next_run_at",
        )
        .bind(now.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_session).collect()
    }

    /// Re-queue active sessions that have no pending run (a cycle was in
    /// flight when the process stopped). Returns how many were re-queued.
    pub async fn requeue_orphans(&self, now: DateTime<Utc>) -> Result<u64, CycleError> {
        let result = sqlx::query(
            "UPDATE sessions SET next_run_at = ?, updated_at = ?, version = version + 1
             WHERE is_active = 1 AND next_run_at IS NULL",
        )
        .bind(now.timestamp_millis())
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Drop every outstanding cycle claim. Only valid at startup, when no
    /// runner of this process can hold one.
    pub async fn release_claims(&self) -> Result<u64, CycleError> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE sessions SET run_id = NULL, updated_at = ?, version = version + 1
             WHERE run_id IS NOT NULL",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Deactivate every active session. Returns how many were stopped.
    pub async fn deactivate_all(&self) -> Result<u64, CycleError> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE sessions SET is_active = 0, next_run_at = NULL, updated_at = ?,
                 version = version + 1
             WHERE is_active = 1",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn count_active(&self) -> Result<i64, CycleError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM sessions WHERE is_active = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }
}

fn version_to_i64(version: u64) -> Result<i64, CycleError> {
    i64::try_from(version).map_err(|_| CycleError::Storage(format!("version {version} overflows")))
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>, CycleError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| CycleError::Storage(format!("invalid timestamp {ms}")))
}

fn parse_decimal(raw: &str, column: &str) -> Result<Decimal, CycleError> {
    Decimal::from_str(raw).map_err(|e| CycleError::Storage(format!("bad {column} {raw:?}: {e}")))
}

fn row_to_session(row: &SqliteRow) -> Result<Session, CycleError> {
    let started_at: Option<i64> = row.try_get("started_at")?;
    let next_run_at: Option<i64> = row.try_get("next_run_at")?;
    let cycles: i64 = row.try_get("cycles_completed")?;
    let max_cycles: i64 = row.try_get("max_cycles")?;
    let version: i64 = row.try_get("version")?;
    let trade_size: String = row.try_get("trade_size_sol")?;
    let volume: String = row.try_get("total_volume_usd")?;

    Ok(Session {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        wallet_public_key: row.try_get("wallet_public_key")?,
        wallet_private_key: row.try_get("wallet_private_key")?,
        trade_size_sol: parse_decimal(&trade_size, "trade_size_sol")?,
        is_active: row.try_get("is_active")?,
        cycles_completed: u32::try_from(cycles)
            .map_err(|_| CycleError::Storage(format!("bad cycles_completed {cycles}")))?,
        max_cycles: u32::try_from(max_cycles)
            .map_err(|_| CycleError::Storage(format!("bad max_cycles {max_cycles}")))?,
        total_volume_usd: parse_decimal(&volume, "total_volume_usd")?,
        started_at: started_at.map(millis_to_datetime).transpose()?,
        next_run_at: next_run_at.map(millis_to_datetime).transpose()?,
        run_id: row.try_get("run_id")?,
        created_at: millis_to_datetime(row.try_get("created_at")?)?,
        updated_at: millis_to_datetime(row.try_get("updated_at")?)?,
        version: u64::try_from(version)
            .map_err(|_| CycleError::Storage(format!("bad version {version}")))?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
