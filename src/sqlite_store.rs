//! Relational store: the same records as the chunk directory, keyed by an
//! ingestion session, in a single SQLite file.
//!
//! Every record is kept verbatim in `records` and additionally unpacked
//! into `messages`, `channels`, `users` and `files` for query-friendly
//! reads. A unit's records are inserted in one transaction through
//! [`UnitTx`]; dropping the transaction without committing rolls the
//! whole unit back.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chatvault_core::record::{Record, RecordKind};
use chatvault_core::ts;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use crate::db;
use crate::migrate;

/// Parameters of a new session.
#[derive(Debug, Clone, Default)]
pub struct SessionParams {
    /// Free-form label: `archive`, `resume`, `search`, `convert`, ...
    pub mode: String,
    pub oldest: Option<DateTime<Utc>>,
    pub latest: Option<DateTime<Utc>>,
    pub files: bool,
    pub avatars: bool,
    /// Originating invocation, for humans.
    pub args: String,
    pub parent_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: i64,
    pub run_id: String,
    pub created_at: i64,
    pub parent_id: Option<i64>,
    pub from_ts: Option<String>,
    pub to_ts: Option<String>,
    pub files_enabled: bool,
    pub avatars_enabled: bool,
    pub mode: String,
    pub args: String,
    pub finished: bool,
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl SqliteStore {
    /// Open or create the database and bring its schema up to date.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path)
            .await
            .with_context(|| format!("open database {}", path.display()))?;
        migrate::run_migrations(&pool).await?;
        Ok(Self {
            pool,
            path: path.to_path_buf(),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn new_session(&self, params: &SessionParams) -> Result<i64> {
        let now = Utc::now().timestamp();
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO sessions (run_id, created_at, updated_at, parent_id, from_ts, to_ts,
                                  files_enabled, avatars_enabled, mode, args)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(now)
        .bind(now)
        .bind(params.parent_id)
        .bind(params.oldest.map(|t| t.to_rfc3339()))
        .bind(params.latest.map(|t| t.to_rfc3339()))
        .bind(params.files)
        .bind(params.avatars)
        .bind(&params.mode)
        .bind(&params.args)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// Seal a session. A finished session is immutable.
    pub async fn finish_session(&self, session_id: i64) -> Result<()> {
        let res = sqlx::query("UPDATE sessions SET finished = 1, updated_at = ? WHERE id = ?")
            .bind(Utc::now().timestamp())
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            bail!("no such session: {}", session_id);
        }
        Ok(())
    }

    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        let rows = sqlx::query(
            "SELECT id, run_id, created_at, parent_id, from_ts, to_ts, files_enabled, \
             avatars_enabled, mode, args, finished FROM sessions ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(session_from_row).collect())
    }

    pub async fn session(&self, session_id: i64) -> Result<Option<Session>> {
        let row = sqlx::query(
            "SELECT id, run_id, created_at, parent_id, from_ts, to_ts, files_enabled, \
             avatars_enabled, mode, args, finished FROM sessions WHERE id = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(session_from_row))
    }

    pub async fn last_finished_session(&self) -> Result<Option<i64>> {
        let id: Option<i64> =
            sqlx::query_scalar("SELECT MAX(id) FROM sessions WHERE finished = 1")
                .fetch_one(&self.pool)
                .await?;
        Ok(id)
    }

    async fn ensure_open(&self, session_id: i64) -> Result<()> {
        match self.session(session_id).await? {
            None => bail!("no such session: {}", session_id),
            Some(s) if s.finished => bail!("session {} is finished", session_id),
            Some(_) => Ok(()),
        }
    }

    /// Start a per-unit transaction.
    pub async fn begin_unit(&self, session_id: i64, unit: &str) -> Result<UnitTx> {
        self.ensure_open(session_id).await?;
        Ok(UnitTx {
            tx: self.pool.begin().await?,
            session_id,
            unit: unit.to_string(),
            seq: 0,
        })
    }

    /// Insert a single record in its own transaction.
    pub async fn insert_record(&self, session_id: i64, record: &Record) -> Result<i64> {
        let mut tx = self.begin_unit(session_id, &record.file_stem()).await?;
        let id = tx.insert(record).await?;
        tx.commit().await?;
        Ok(id)
    }

    pub async fn record_count(&self, session_id: Option<i64>) -> Result<i64> {
        let n: i64 = match session_id {
            Some(id) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM records WHERE session_id = ?")
                    .bind(id)
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM records")
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(n)
    }

    /// Whether any session stored a record of this kind.
    pub async fn has_kind(&self, kind: RecordKind) -> Result<bool> {
        let found: i64 = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM records WHERE kind = ?)",
        )
        .bind(kind.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(found != 0)
    }

    /// Raw records of a session, in insertion order.
    pub async fn session_records(&self, session_id: i64) -> Result<Vec<Record>> {
        let rows = sqlx::query("SELECT payload FROM records WHERE session_id = ? ORDER BY id")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| {
                let payload: String = r.get("payload");
                serde_json::from_str(&payload).context("decode stored record")
            })
            .collect()
    }

    /// Move a unit's checkpoint forward. An older timestamp never replaces
    /// a newer one.
    pub async fn set_checkpoint(&self, unit: &str, latest_ts: &str, session_id: i64) -> Result<()> {
        let micros = ts::to_micros(latest_ts)?;
        sqlx::query(
            r#"
            INSERT INTO checkpoints (unit, latest_ts, latest_micros, session_id, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(unit) DO UPDATE SET
                latest_ts = excluded.latest_ts,
                latest_micros = excluded.latest_micros,
                session_id = excluded.session_id,
                updated_at = excluded.updated_at
            WHERE excluded.latest_micros > checkpoints.latest_micros
            "#,
        )
        .bind(unit)
        .bind(latest_ts)
        .bind(micros)
        .bind(session_id)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_checkpoint(&self, unit: &str) -> Result<Option<String>> {
        let ts: Option<String> =
            sqlx::query_scalar("SELECT latest_ts FROM checkpoints WHERE unit = ?")
                .bind(unit)
                .fetch_optional(&self.pool)
                .await?;
        Ok(ts)
    }

    pub async fn checkpoints(&self) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query("SELECT unit, latest_ts FROM checkpoints ORDER BY unit")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|r| (r.get::<String, _>("unit"), r.get::<String, _>("latest_ts")))
            .collect())
    }
}

fn session_from_row(row: &sqlx::sqlite::SqliteRow) -> Session {
    Session {
        id: row.get("id"),
        run_id: row.get("run_id"),
        created_at: row.get("created_at"),
        parent_id: row.get("parent_id"),
        from_ts: row.get("from_ts"),
        to_ts: row.get("to_ts"),
        files_enabled: row.get("files_enabled"),
        avatars_enabled: row.get("avatars_enabled"),
        mode: row.get("mode"),
        args: row.get("args"),
        finished: row.get("finished"),
    }
}

/// All inserts of one logical unit. Commit publishes them atomically;
/// dropping without commit discards them.
pub struct UnitTx {
    tx: Transaction<'static, Sqlite>,
    session_id: i64,
    unit: String,
    seq: i64,
}

impl UnitTx {
    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Insert a record and unpack its payload. Re-inserting an identical
    /// record within the session returns the existing id.
    pub async fn insert(&mut self, record: &Record) -> Result<i64> {
        let payload = serde_json::to_string(record)?;
        let kind = record.kind().as_str();
        let mut hasher = Sha256::new();
        hasher.update(kind.as_bytes());
        hasher.update(payload.as_bytes());
        let digest = format!("{:x}", hasher.finalize());

        let inserted: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO records (session_id, unit, group_id, kind, seq, digest, payload, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(session_id, unit, digest) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(self.session_id)
        .bind(&self.unit)
        .bind(record.group_id())
        .bind(kind)
        .bind(self.seq)
        .bind(&digest)
        .bind(&payload)
        .bind(Utc::now().timestamp())
        .fetch_optional(&mut *self.tx)
        .await?;

        let record_id = match inserted {
            Some(id) => id,
            None => {
                return sqlx::query_scalar(
                    "SELECT id FROM records WHERE session_id = ? AND unit = ? AND digest = ?",
                )
                .bind(self.session_id)
                .bind(&self.unit)
                .bind(&digest)
                .fetch_one(&mut *self.tx)
                .await
                .map_err(Into::into);
            }
        };
        self.seq += 1;
        self.unpack(record_id, record).await?;
        Ok(record_id)
    }

    async fn unpack(&mut self, record_id: i64, record: &Record) -> Result<()> {
        match record {
            Record::Messages {
                channel_id,
                messages,
                ..
            } => {
                for (i, m) in messages.iter().enumerate() {
                    self.insert_message(record_id, channel_id, m, m.is_thread_parent(), i)
                        .await?;
                }
            }
            Record::ThreadMessages {
                channel_id,
                parent,
                thread_only,
                messages,
                ..
            } => {
                if *thread_only {
                    self.insert_message(record_id, channel_id, parent, true, 0).await?;
                }
                for (i, m) in messages.iter().enumerate() {
                    self.insert_message(record_id, channel_id, m, false, i + 1).await?;
                }
            }
            Record::Files {
                channel_id,
                parent,
                files,
                ..
            } => {
                for f in files {
                    sqlx::query(
                        "INSERT INTO files (record_id, session_id, file_id, channel_id, message_ts, data) \
                         VALUES (?, ?, ?, ?, ?, ?)",
                    )
                    .bind(record_id)
                    .bind(self.session_id)
                    .bind(&f.id)
                    .bind(channel_id)
                    .bind(&parent.ts)
                    .bind(serde_json::to_string(f)?)
                    .execute(&mut *self.tx)
                    .await?;
                }
            }
            Record::Channels { channels } => {
                for c in channels {
                    self.insert_channel(record_id, c).await?;
                }
            }
            Record::ChannelInfo { channel, .. } => {
                self.insert_channel(record_id, channel).await?;
            }
            Record::Users { users } => {
                for u in users {
                    sqlx::query(
                        "INSERT INTO users (record_id, session_id, user_id, data) VALUES (?, ?, ?, ?)",
                    )
                    .bind(record_id)
                    .bind(self.session_id)
                    .bind(&u.id)
                    .bind(serde_json::to_string(u)?)
                    .execute(&mut *self.tx)
                    .await?;
                }
            }
            Record::WorkspaceInfo { .. }
            | Record::ChannelUsers { .. }
            | Record::SearchMessages { .. }
            | Record::SearchFiles { .. } => {}
        }
        Ok(())
    }

    async fn insert_message(
        &mut self,
        record_id: i64,
        channel_id: &str,
        m: &chatvault_core::models::Message,
        is_parent: bool,
        seq: usize,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO messages (record_id, session_id, channel_id, ts, ts_micros, thread_ts, \
             is_parent, seq, data) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record_id)
        .bind(self.session_id)
        .bind(channel_id)
        .bind(&m.ts)
        .bind(ts::to_micros(&m.ts)?)
        .bind(&m.thread_ts)
        .bind(is_parent)
        .bind(seq as i64)
        .bind(serde_json::to_string(m)?)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn insert_channel(
        &mut self,
        record_id: i64,
        c: &chatvault_core::models::Channel,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO channels (record_id, session_id, channel_id, data) VALUES (?, ?, ?, ?)",
        )
        .bind(record_id)
        .bind(self.session_id)
        .bind(&c.id)
        .bind(serde_json::to_string(c)?)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
