//! Write side of ingestion and conversion: where records go.
//!
//! | Sink | Unit writes | Checkpoint |
//! |------|-------------|------------|
//! | [`ChunkSink`] | appended as they arrive | derived from the records |
//! | [`DbSink`] | buffered, inserted in one transaction on commit | `checkpoints` table |
//!
//! A unit writer is owned by exactly one task. The database sink holds
//! records in memory until commit so that no write lock is held while the
//! API is being paged.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chatvault_core::models::Channel;
use chatvault_core::record::{Record, RecordKind};
use chatvault_core::source::Sourcer;
use chatvault_core::unit::{self, SlackLink, UnitId};
use tracing::debug;

use crate::directory::Directory;
use crate::fsadapter::{DirTarget, FsTarget};
use crate::source_db::DatabaseSource;
use crate::sqlite_store::{SessionParams, SqliteStore};

#[async_trait]
pub trait UnitWriter: Send {
    async fn write(&mut self, record: Record) -> Result<()>;
    /// Publish everything written. Dropping without commit may discard it.
    async fn commit(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn begin_unit(&self, unit: &UnitId) -> Result<Box<dyn UnitWriter>>;

    /// Channels, users, workspace and search records.
    async fn write_global(&self, record: Record) -> Result<()>;

    async fn has_kind(&self, kind: RecordKind) -> Result<bool>;

    /// Channel list recorded by an earlier run.
    async fn stored_channels(&self) -> Result<Vec<Channel>>;

    async fn set_checkpoint(&self, link: &SlackLink, latest_ts: &str) -> Result<()>;

    /// Where attachment and avatar bodies are written.
    fn files(&self) -> Arc<dyn FsTarget>;

    /// Flush and seal. `completed` is false when the run was aborted.
    async fn finish(&self, completed: bool) -> Result<()>;
}

// ═══════════════════════════════════════════════════════════════════════
// Chunk directory
// ═══════════════════════════════════════════════════════════════════════

pub struct ChunkSink {
    dir: Arc<Directory>,
    files: Arc<dyn FsTarget>,
}

impl ChunkSink {
    pub fn create(path: &Path) -> Result<Self> {
        let dir = Directory::create(path)?;
        let files: Arc<dyn FsTarget> = Arc::new(DirTarget::create(path)?);
        Ok(Self {
            dir: Arc::new(dir),
            files,
        })
    }

    pub fn directory(&self) -> &Arc<Directory> {
        &self.dir
    }
}

struct ChunkUnit {
    dir: Arc<Directory>,
}

#[async_trait]
impl UnitWriter for ChunkUnit {
    async fn write(&mut self, record: Record) -> Result<()> {
        self.dir.encode(record)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl RecordSink for ChunkSink {
    async fn begin_unit(&self, _unit: &UnitId) -> Result<Box<dyn UnitWriter>> {
        Ok(Box::new(ChunkUnit {
            dir: Arc::clone(&self.dir),
        }))
    }

    async fn write_global(&self, record: Record) -> Result<()> {
        self.dir.encode(record)
    }

    async fn has_kind(&self, kind: RecordKind) -> Result<bool> {
        match kind.well_known_stem() {
            Some(stem) => Ok(self
                .dir
                .records(stem)?
                .iter()
                .any(|r| r.kind() == kind && !r.is_empty())),
            None => Ok(self.dir.stat(kind)?.is_present()),
        }
    }

    async fn stored_channels(&self) -> Result<Vec<Channel>> {
        let mut out = Vec::new();
        for rec in self.dir.records(unit::CHANNELS)? {
            if let Record::Channels { channels } = rec {
                out.extend(channels);
            }
        }
        Ok(out)
    }

    async fn set_checkpoint(&self, link: &SlackLink, latest_ts: &str) -> Result<()> {
        debug!(unit = %link, latest_ts, "checkpoint");
        Ok(())
    }

    fn files(&self) -> Arc<dyn FsTarget> {
        Arc::clone(&self.files)
    }

    async fn finish(&self, _completed: bool) -> Result<()> {
        self.dir.close()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Relational store
// ═══════════════════════════════════════════════════════════════════════

pub struct DbSink {
    store: SqliteStore,
    session_id: i64,
    files: Arc<dyn FsTarget>,
}

impl DbSink {
    /// Open the store and start a new session. Attachments go next to the
    /// database file.
    pub async fn create(db_path: &Path, params: &SessionParams) -> Result<Self> {
        let store = SqliteStore::open(db_path).await?;
        let session_id = store.new_session(params).await?;
        let root = db_path.parent().unwrap_or_else(|| Path::new("."));
        Ok(Self {
            store,
            session_id,
            files: Arc::new(DirTarget::create(root)?),
        })
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn session_id(&self) -> i64 {
        self.session_id
    }
}

struct DbUnit {
    store: SqliteStore,
    session_id: i64,
    unit: String,
    buffered: Vec<Record>,
}

#[async_trait]
impl UnitWriter for DbUnit {
    async fn write(&mut self, record: Record) -> Result<()> {
        self.buffered.push(record);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        if self.buffered.is_empty() {
            return Ok(());
        }
        let mut tx = self.store.begin_unit(self.session_id, &self.unit).await?;
        for rec in &self.buffered {
            tx.insert(rec).await?;
        }
        tx.commit().await
    }
}

#[async_trait]
impl RecordSink for DbSink {
    async fn begin_unit(&self, unit: &UnitId) -> Result<Box<dyn UnitWriter>> {
        Ok(Box::new(DbUnit {
            store: self.store.clone(),
            session_id: self.session_id,
            unit: unit.file_stem(),
            buffered: Vec::new(),
        }))
    }

    async fn write_global(&self, record: Record) -> Result<()> {
        self.store.insert_record(self.session_id, &record).await?;
        Ok(())
    }

    async fn has_kind(&self, kind: RecordKind) -> Result<bool> {
        self.store.has_kind(kind).await
    }

    async fn stored_channels(&self) -> Result<Vec<Channel>> {
        let src = DatabaseSource::new(self.store.clone(), None);
        Ok(src.channels().await?)
    }

    async fn set_checkpoint(&self, link: &SlackLink, latest_ts: &str) -> Result<()> {
        self.store
            .set_checkpoint(&link.to_string(), latest_ts, self.session_id)
            .await
    }

    fn files(&self) -> Arc<dyn FsTarget> {
        Arc::clone(&self.files)
    }

    async fn finish(&self, completed: bool) -> Result<()> {
        if completed {
            self.store.finish_session(self.session_id).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatvault_core::models::Message;
    use tempfile::TempDir;

    fn batch(ts: &str) -> Record {
        Record::Messages {
            channel_id: "C1".into(),
            is_last: true,
            thread_count: 0,
            messages: vec![Message {
                ts: ts.into(),
                ..Default::default()
            }],
        }
    }

    #[tokio::test]
    async fn db_unit_is_invisible_until_commit() {
        let tmp = TempDir::new().unwrap();
        let sink = DbSink::create(&tmp.path().join("slackdump.sqlite"), &SessionParams::default())
            .await
            .unwrap();
        let mut w = sink.begin_unit(&UnitId::channel("C1")).await.unwrap();
        w.write(batch("1.0")).await.unwrap();
        assert_eq!(sink.store().record_count(None).await.unwrap(), 0);
        w.commit().await.unwrap();
        assert_eq!(sink.store().record_count(None).await.unwrap(), 1);

        let mut dropped = sink.begin_unit(&UnitId::channel("C2")).await.unwrap();
        dropped.write(batch("2.0")).await.unwrap();
        drop(dropped);
        assert_eq!(sink.store().record_count(None).await.unwrap(), 1);
        assert!(sink.has_kind(RecordKind::Messages).await.unwrap());
        assert!(!sink.has_kind(RecordKind::Users).await.unwrap());
    }

    #[tokio::test]
    async fn chunk_sink_knows_globals() {
        let tmp = TempDir::new().unwrap();
        let sink = ChunkSink::create(tmp.path()).unwrap();
        assert!(!sink.has_kind(RecordKind::Channels).await.unwrap());
        sink.write_global(Record::Channels {
            channels: vec![Channel {
                id: "C1".into(),
                ..Default::default()
            }],
        })
        .await
        .unwrap();
        assert!(sink.has_kind(RecordKind::Channels).await.unwrap());
        assert_eq!(sink.stored_channels().await.unwrap()[0].id, "C1");
        sink.finish(true).await.unwrap();
    }
}
