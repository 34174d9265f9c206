//! SQLite persistence for preview rows.
//!
//! Workers coordinate only through conditional updates on this table. Every
//! state transition is a single `UPDATE ... WHERE <expected state>` and
//! reports whether it applied, so concurrent processes sharing the database
//! file cannot both win the same transition.

use std::path::Path;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;

use super::types::{PreviewKey, PreviewRow, PreviewStatus, ReadyMeta};

pub const MAX_ERROR_CHARS: usize = 500;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("preview row {0} vanished")]
    Missing(String),
}

const SELECT_COLUMNS: &str = r#"
    document_id, namespace, variant, status, source_last_modified_ms, object_key,
    content_type, width, height, byte_size, etag, lease_owner, lease_until_ms,
    attempt_count, last_error, created_at_ms, updated_at_ms
"#;

pub struct PreviewStore {
    conn: Mutex<Connection>,
}

impl PreviewStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Self::with_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;

            CREATE TABLE IF NOT EXISTS document_previews (
              document_id TEXT NOT NULL,
              namespace TEXT NOT NULL,
              variant TEXT NOT NULL,
              status TEXT NOT NULL,
              source_last_modified_ms INTEGER NOT NULL,
              object_key TEXT NOT NULL,
              content_type TEXT,
              width INTEGER,
              height INTEGER,
              byte_size INTEGER,
              etag TEXT,
              lease_owner TEXT,
              lease_until_ms INTEGER,
              attempt_count INTEGER NOT NULL DEFAULT 0,
              last_error TEXT,
              created_at_ms INTEGER NOT NULL,
              updated_at_ms INTEGER NOT NULL,
              PRIMARY KEY (document_id, namespace, variant)
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert a queued row on first sight. An existing row is reset to
    /// queued only when the source version or the object key changed.
    pub fn ensure(
        &self,
        key: &PreviewKey,
        source_last_modified_ms: i64,
        object_key: &str,
        now_ms: i64,
    ) -> Result<PreviewRow, StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO document_previews(
              document_id, namespace, variant, status, source_last_modified_ms, object_key,
              attempt_count, created_at_ms, updated_at_ms
            )
            VALUES (?1, ?2, ?3, 'queued', ?4, ?5, 0, ?6, ?6)
            ON CONFLICT(document_id, namespace, variant) DO UPDATE SET
              status='queued',
              source_last_modified_ms=excluded.source_last_modified_ms,
              object_key=excluded.object_key,
              content_type=NULL,
              width=NULL,
              height=NULL,
              byte_size=NULL,
              etag=NULL,
              lease_owner=NULL,
              lease_until_ms=NULL,
              attempt_count=0,
              last_error=NULL,
              updated_at_ms=excluded.updated_at_ms
            WHERE document_previews.source_last_modified_ms != excluded.source_last_modified_ms
               OR document_previews.object_key != excluded.object_key
            "#,
            params![
                key.document_id,
                key.namespace,
                key.variant,
                source_last_modified_ms,
                object_key,
                now_ms
            ],
        )?;
        select_row(&conn, key)?.ok_or_else(|| StoreError::Missing(key.to_string()))
    }

    /// Claim the row for `owner` until `lease_until_ms`.
    ///
    /// Claimable rows: queued; failed ones last touched at or before
    /// `failed_retry_before_ms` with fewer than `max_attempts` attempts; and
    /// processing ones whose lease has expired. Returns true only for the
    /// single caller whose update applied.
    pub fn try_claim(
        &self,
        key: &PreviewKey,
        owner: &str,
        lease_until_ms: i64,
        failed_retry_before_ms: i64,
        max_attempts: i64,
        now_ms: i64,
    ) -> Result<bool, StoreError> {
        let changed = self.conn.lock().execute(
            r#"
            UPDATE document_previews SET
              status='processing',
              lease_owner=?4,
              lease_until_ms=?5,
              attempt_count=attempt_count + 1,
              updated_at_ms=?6
            WHERE document_id=?1 AND namespace=?2 AND variant=?3
              AND (
                status='queued'
                OR (status='failed' AND updated_at_ms <= ?7 AND attempt_count < ?8)
                OR (status='processing' AND (lease_until_ms IS NULL OR lease_until_ms <= ?6))
              )
            "#,
            params![
                key.document_id,
                key.namespace,
                key.variant,
                owner,
                lease_until_ms,
                now_ms,
                failed_retry_before_ms,
                max_attempts
            ],
        )?;
        Ok(changed == 1)
    }

    /// Record a finished render. Applies only while `owner` holds the lease.
    pub fn mark_ready(
        &self,
        key: &PreviewKey,
        owner: &str,
        meta: &ReadyMeta,
        now_ms: i64,
    ) -> Result<bool, StoreError> {
        let changed = self.conn.lock().execute(
            r#"
            UPDATE document_previews SET
              status='ready',
              content_type=?5,
              width=?6,
              height=?7,
              byte_size=?8,
              etag=?9,
              lease_owner=NULL,
              lease_until_ms=NULL,
              last_error=NULL,
              updated_at_ms=?10
            WHERE document_id=?1 AND namespace=?2 AND variant=?3
              AND status='processing' AND lease_owner=?4
            "#,
            params![
                key.document_id,
                key.namespace,
                key.variant,
                owner,
                meta.content_type,
                meta.width,
                meta.height,
                i64::try_from(meta.byte_size).unwrap_or(i64::MAX),
                meta.etag,
                now_ms
            ],
        )?;
        Ok(changed == 1)
    }

    /// Record a failed render. Applies only while `owner` holds the lease.
    pub fn mark_failed(
        &self,
        key: &PreviewKey,
        owner: &str,
        error: &str,
        now_ms: i64,
    ) -> Result<bool, StoreError> {
        let error: String = error.chars().take(MAX_ERROR_CHARS).collect();
        let changed = self.conn.lock().execute(
            r#"
            UPDATE document_previews SET
              status='failed',
              last_error=?5,
              lease_owner=NULL,
              lease_until_ms=NULL,
              updated_at_ms=?6
            WHERE document_id=?1 AND namespace=?2 AND variant=?3
              AND status='processing' AND lease_owner=?4
            "#,
            params![key.document_id, key.namespace, key.variant, owner, error, now_ms],
        )?;
        Ok(changed == 1)
    }

    /// Send a ready row back to the queue, e.g. when its blob has gone missing.
    pub fn requeue(&self, key: &PreviewKey, now_ms: i64) -> Result<bool, StoreError> {
        let changed = self.conn.lock().execute(
            r#"
            UPDATE document_previews SET
              status='queued',
              content_type=NULL,
              width=NULL,
              height=NULL,
              byte_size=NULL,
              etag=NULL,
              lease_owner=NULL,
              lease_until_ms=NULL,
              attempt_count=0,
              updated_at_ms=?4
            WHERE document_id=?1 AND namespace=?2 AND variant=?3 AND status='ready'
            "#,
            params![key.document_id, key.namespace, key.variant, now_ms],
        )?;
        Ok(changed == 1)
    }

    pub fn get(&self, key: &PreviewKey) -> Result<Option<PreviewRow>, StoreError> {
        select_row(&self.conn.lock(), key)
    }

    pub fn delete(&self, key: &PreviewKey) -> Result<bool, StoreError> {
        let changed = self.conn.lock().execute(
            "DELETE FROM document_previews WHERE document_id=?1 AND namespace=?2 AND variant=?3",
            params![key.document_id, key.namespace, key.variant],
        )?;
        Ok(changed == 1)
    }
}

fn select_row(conn: &Connection, key: &PreviewKey) -> Result<Option<PreviewRow>, StoreError> {
    let sql = format!(
        "SELECT {SELECT_COLUMNS} FROM document_previews \
         WHERE document_id=?1 AND namespace=?2 AND variant=?3"
    );
    Ok(conn
        .query_row(
            &sql,
            params![key.document_id, key.namespace, key.variant],
            map_row,
        )
        .optional()?)
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<PreviewRow> {
    let status: String = row.get(3)?;
    let status = status.parse::<PreviewStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, Type::Text, e.into())
    })?;
    Ok(PreviewRow {
        key: PreviewKey {
            document_id: row.get(0)?,
            namespace: row.get(1)?,
            variant: row.get(2)?,
        },
        status,
        source_last_modified_ms: row.get(4)?,
        object_key: row.get(5)?,
        content_type: row.get(6)?,
        width: row.get(7)?,
        height: row.get(8)?,
        byte_size: row.get::<_, Option<i64>>(9)?.map(|v| v.max(0) as u64),
        etag: row.get(10)?,
        lease_owner: row.get(11)?,
        lease_until_ms: row.get(12)?,
        attempt_count: row.get(13)?,
        last_error: row.get(14)?,
        created_at_ms: row.get(15)?,
        updated_at_ms: row.get(16)?,
    })
}
