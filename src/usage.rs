//! Per-user daily character quota for speech synthesis.
//!
//! Counts live in SQLite so every process sharing the database sees the same
//! totals. The only write is a conditional upsert, so two concurrent charges
//! can never push a user past the limit.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum UsageError {
    #[error("daily limit of {limit} characters reached ({used} used)")]
    DailyLimitExceeded {
        limit: u64,
        used: u64,
        retry_after: Duration,
    },

    #[error("sqlite: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageSnapshot {
    pub user_id: String,
    pub day: String,
    pub used: u64,
    /// 0 when the quota is disabled.
    pub limit: u64,
}

impl UsageSnapshot {
    pub fn remaining(&self) -> Option<u64> {
        (self.limit > 0).then(|| self.limit.saturating_sub(self.used))
    }
}

pub struct UsageLedger {
    conn: Mutex<Connection>,
    daily_limit: u64,
}

impl UsageLedger {
    pub fn open(path: &Path, daily_limit: u64) -> Result<Self, UsageError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let ledger = Self::with_connection(conn, daily_limit)?;
        info!("Usage ledger at {} (daily limit {daily_limit})", path.display());
        Ok(ledger)
    }

    pub fn in_memory(daily_limit: u64) -> Result<Self, UsageError> {
        Self::with_connection(Connection::open_in_memory()?, daily_limit)
    }

    fn with_connection(conn: Connection, daily_limit: u64) -> Result<Self, UsageError> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS tts_usage (
              user_id TEXT NOT NULL,
              day TEXT NOT NULL,
              char_count INTEGER NOT NULL,
              updated_at_ms INTEGER NOT NULL,
              PRIMARY KEY (user_id, day)
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            daily_limit,
        })
    }

    pub fn daily_limit(&self) -> u64 {
        self.daily_limit
    }

    /// Add `chars` to today's count for `user_id`, refusing if that would
    /// exceed the daily limit.
    pub fn charge(
        &self,
        user_id: &str,
        chars: u64,
        now: DateTime<Utc>,
    ) -> Result<UsageSnapshot, UsageError> {
        let day = day_key(now);
        let limit = to_sql(self.daily_limit);
        let conn = self.conn.lock();

        let changed = conn.execute(
            r#"
            INSERT INTO tts_usage(user_id, day, char_count, updated_at_ms)
            SELECT ?1, ?2, ?3, ?4 WHERE ?5 = 0 OR ?3 <= ?5
            ON CONFLICT(user_id, day) DO UPDATE SET
              char_count = tts_usage.char_count + excluded.char_count,
              updated_at_ms = excluded.updated_at_ms
            WHERE ?5 = 0 OR tts_usage.char_count + excluded.char_count <= ?5
            "#,
            params![user_id, day, to_sql(chars), now.timestamp_millis(), limit],
        )?;
        let used = read_count(&conn, user_id, &day)?;

        if changed == 0 {
            debug!("Quota refused {chars} chars for {user_id} ({used}/{})", self.daily_limit);
            return Err(UsageError::DailyLimitExceeded {
                limit: self.daily_limit,
                used,
                retry_after: until_next_day(now),
            });
        }

        Ok(UsageSnapshot {
            user_id: user_id.to_string(),
            day,
            used,
            limit: self.daily_limit,
        })
    }

    pub fn usage(&self, user_id: &str, now: DateTime<Utc>) -> Result<UsageSnapshot, UsageError> {
        let day = day_key(now);
        let used = read_count(&self.conn.lock(), user_id, &day)?;
        Ok(UsageSnapshot {
            user_id: user_id.to_string(),
            day,
            used,
            limit: self.daily_limit,
        })
    }
}

fn read_count(conn: &Connection, user_id: &str, day: &str) -> Result<u64, UsageError> {
    let count = conn
        .query_row(
            "SELECT char_count FROM tts_usage WHERE user_id=?1 AND day=?2",
            params![user_id, day],
            |row| row.get::<_, i64>(0),
        )
        .optional()?
        .unwrap_or(0);
    Ok(count.max(0) as u64)
}

fn to_sql(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn day_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

fn until_next_day(now: DateTime<Utc>) -> Duration {
    let Some(tomorrow) = now.date_naive().succ_opt() else {
        return Duration::from_secs(24 * 60 * 60);
    };
    let midnight = Utc.from_utc_datetime(&tomorrow.and_time(NaiveTime::MIN));
    (midnight - now).to_std().unwrap_or_default()
}
