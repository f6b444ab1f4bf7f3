//! Conversion targets.
//!
//! | Format | Channel output | Index | Attachments |
//! |--------|----------------|-------|-------------|
//! | chunk | `<C>.json.gz` | `channels`, `users`, `workspace` (sentinel) | mattermost |
//! | database | one transaction per channel | global records, session sealed | mattermost |
//! | export | `<name>/<YYYY-MM-DD>.json` | `channels.json`, `groups.json`, `mpims.json`, `dms.json`, `users.json` | standard or mattermost |
//! | dump | `<C>.json`, replies nested | `channels.json`, `users.json`, `workspace.json` | dump |
//!
//! Export and dump targets accept a `.zip` path.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chatvault_core::models::{Channel, Message, User, WorkspaceInfo};
use chatvault_core::paths::FileLayout;
use chatvault_core::record::Record;
use chatvault_core::ts;
use chatvault_core::unit::UnitId;
use serde::Serialize;
use tracing::{debug, warn};

use crate::directory::Directory;
use crate::fsadapter::{self, DirTarget, FsTarget};
use crate::source_dump::{self, Conversation, DumpMessage};
use crate::source_export::{
    ExportIndex, CHANNELS_FILE, DMS_FILE, GROUPS_FILE, MPIMS_FILE, USERS_FILE,
};
use crate::sources::DATABASE_FILE;
use crate::sqlite_store::{SessionParams, SqliteStore};

/// Main-timeline messages per batch record.
const BATCH: usize = 100;

/// Output format of a conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Format {
    Chunk,
    Database,
    Export,
    Dump,
}

impl Format {
    pub fn as_str(&self) -> &'static str {
        match self {
            Format::Chunk => "chunk",
            Format::Database => "database",
            Format::Export => "export",
            Format::Dump => "dump",
        }
    }
}

/// Everything read from a source for one channel.
#[derive(Debug, Clone, Default)]
pub struct ChannelData {
    pub channel: Channel,
    /// Main timeline, sorted.
    pub messages: Vec<Message>,
    /// Parent timestamp to replies, sorted.
    pub threads: BTreeMap<String, (Message, Vec<Message>)>,
}

impl ChannelData {
    /// Every message including thread replies, sorted by timestamp.
    pub fn interleaved(&self) -> Vec<&Message> {
        let mut all: Vec<&Message> = self.messages.iter().collect();
        for (_, replies) in self.threads.values() {
            all.extend(replies.iter());
        }
        all.sort_by_key(|m| ts::sort_key(&m.ts));
        all
    }
}

/// What is written once every channel is done.
#[derive(Debug, Clone, Default)]
pub struct Index {
    pub channels: Vec<Channel>,
    pub users: Vec<User>,
    pub workspace: Option<WorkspaceInfo>,
}

#[async_trait]
pub trait Target: Send + Sync {
    fn name(&self) -> &str;

    fn format(&self) -> Format;

    /// Naming convention for attachments written to this target.
    fn file_layout(&self) -> Option<FileLayout>;

    fn files(&self) -> Arc<dyn FsTarget>;

    async fn write_channel(&self, data: &ChannelData) -> Result<()>;

    async fn write_index(&self, index: &Index) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Where and how to write a conversion. Nothing touches the disk until
/// [`open`](Self::open).
#[derive(Debug, Clone)]
pub struct TargetSpec {
    pub format: Format,
    pub path: PathBuf,
    /// Attachment layout of export targets.
    pub layout: FileLayout,
    /// Database file name when `path` is a directory.
    pub db_file: String,
    /// Invocation recorded in the database session.
    pub args: String,
}

impl TargetSpec {
    pub fn new(format: Format, path: impl Into<PathBuf>) -> Self {
        Self {
            format,
            path: path.into(),
            layout: FileLayout::Standard,
            db_file: DATABASE_FILE.to_string(),
            args: String::new(),
        }
    }

    pub fn with_layout(mut self, layout: FileLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_db_file(mut self, db_file: impl Into<String>) -> Self {
        self.db_file = db_file.into();
        self
    }

    pub fn with_args(mut self, args: impl Into<String>) -> Self {
        self.args = args.into();
        self
    }

    /// Naming convention for attachments the target would write.
    pub fn file_layout(&self) -> Option<FileLayout> {
        match self.format {
            Format::Chunk | Format::Database => Some(FileLayout::Mattermost),
            Format::Export => Some(self.layout),
            Format::Dump => Some(FileLayout::Dump),
        }
    }

    /// Reject combinations no target can write, without touching the disk.
    pub fn check(&self) -> Result<()> {
        let is_zip = self
            .path
            .extension()
            .is_some_and(|e| e.eq_ignore_ascii_case("zip"));
        match self.format {
            Format::Chunk | Format::Database if is_zip => {
                bail!("a {} target cannot be written into a ZIP file", self.format.as_str())
            }
            Format::Export if self.layout == FileLayout::Dump => {
                bail!("export supports the standard and mattermost file layouts, not dump")
            }
            _ => Ok(()),
        }
    }

    /// Create the target on disk. `files` and `avatars` are recorded in
    /// the database session.
    pub async fn open(&self, files: bool, avatars: bool) -> Result<Arc<dyn Target>> {
        self.check()?;
        let target: Arc<dyn Target> = match self.format {
            Format::Chunk => Arc::new(ChunkTarget::create(&self.path)?),
            Format::Database => {
                let params = SessionParams {
                    mode: "convert".into(),
                    files,
                    avatars,
                    args: self.args.clone(),
                    ..Default::default()
                };
                Arc::new(DbTarget::create(&self.path, &self.db_file, &params).await?)
            }
            Format::Export => Arc::new(ExportTarget::create(&self.path, self.layout)?),
            Format::Dump => Arc::new(DumpTarget::create(&self.path)?),
        };
        debug!(format = self.format.as_str(), target = target.name(), "opened target");
        Ok(target)
    }
}

/// Records of one channel in the order the archiver would write them.
pub fn channel_records(data: &ChannelData) -> Vec<Record> {
    let id = &data.channel.id;
    let mut out = vec![Record::ChannelInfo {
        channel: data.channel.clone(),
        thread_ts: String::new(),
    }];

    let empty: &[Message] = &[];
    let batches: Vec<&[Message]> = if data.messages.is_empty() {
        vec![empty]
    } else {
        data.messages.chunks(BATCH).collect()
    };
    let n = batches.len();
    for (i, batch) in batches.into_iter().enumerate() {
        out.push(Record::Messages {
            channel_id: id.clone(),
            is_last: i + 1 == n,
            thread_count: batch.iter().filter(|m| m.is_thread_parent()).count() as u32,
            messages: batch.to_vec(),
        });
        out.extend(file_records(id, batch));
    }

    for (parent, replies) in data.threads.values() {
        out.push(Record::ThreadMessages {
            channel_id: id.clone(),
            parent: parent.clone(),
            is_last: true,
            thread_only: false,
            messages: replies.clone(),
        });
        out.extend(file_records(id, replies));
    }
    out
}

fn file_records<'a>(
    channel_id: &str,
    messages: &'a [Message],
) -> impl Iterator<Item = Record> + 'a {
    let channel_id = channel_id.to_string();
    messages
        .iter()
        .filter(|m| !m.files.is_empty())
        .map(move |m| Record::Files {
            channel_id: channel_id.clone(),
            parent: m.clone(),
            thread_only: false,
            files: m.files.clone(),
        })
}

fn global_records(index: &Index) -> Vec<Record> {
    let mut out = vec![
        Record::Channels {
            channels: index.channels.clone(),
        },
        Record::Users {
            users: index.users.clone(),
        },
    ];
    // the workspace record is the directory sentinel; always last
    out.push(Record::WorkspaceInfo {
        info: index.workspace.clone().unwrap_or_default(),
    });
    out
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec_pretty(value)?)
}

// ═══════════════════════════════════════════════════════════════════════
// Chunk directory
// ═══════════════════════════════════════════════════════════════════════

pub struct ChunkTarget {
    name: String,
    dir: Directory,
    files: Arc<dyn FsTarget>,
}

impl ChunkTarget {
    pub fn create(path: &Path) -> Result<Self> {
        Ok(Self {
            name: path.display().to_string(),
            dir: Directory::create(path)?,
            files: Arc::new(DirTarget::create(path)?),
        })
    }
}

#[async_trait]
impl Target for ChunkTarget {
    fn name(&self) -> &str {
        &self.name
    }

    fn format(&self) -> Format {
        Format::Chunk
    }

    fn file_layout(&self) -> Option<FileLayout> {
        Some(FileLayout::Mattermost)
    }

    fn files(&self) -> Arc<dyn FsTarget> {
        Arc::clone(&self.files)
    }

    async fn write_channel(&self, data: &ChannelData) -> Result<()> {
        for rec in channel_records(data) {
            self.dir.encode(rec)?;
        }
        Ok(())
    }

    async fn write_index(&self, index: &Index) -> Result<()> {
        for rec in global_records(index) {
            self.dir.encode(rec)?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.dir.close()?;
        self.files.close().await
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Relational store
// ═══════════════════════════════════════════════════════════════════════

pub struct DbTarget {
    name: String,
    store: SqliteStore,
    session_id: i64,
    files: Arc<dyn FsTarget>,
}

impl DbTarget {
    /// `path` is either the database file or the directory to put it in.
    pub async fn create(path: &Path, db_file: &str, params: &SessionParams) -> Result<Self> {
        let db_path: PathBuf = if path
            .extension()
            .is_some_and(|e| e == "sqlite" || e == "db")
        {
            path.to_path_buf()
        } else {
            std::fs::create_dir_all(path)
                .with_context(|| format!("create {}", path.display()))?;
            path.join(db_file)
        };
        let store = SqliteStore::open(&db_path).await?;
        let session_id = store.new_session(params).await?;
        let root = db_path.parent().unwrap_or_else(|| Path::new("."));
        Ok(Self {
            name: db_path.display().to_string(),
            files: Arc::new(DirTarget::create(root)?),
            store,
            session_id,
        })
    }
}

#[async_trait]
impl Target for DbTarget {
    fn name(&self) -> &str {
        &self.name
    }

    fn format(&self) -> Format {
        Format::Database
    }

    fn file_layout(&self) -> Option<FileLayout> {
        Some(FileLayout::Mattermost)
    }

    fn files(&self) -> Arc<dyn FsTarget> {
        Arc::clone(&self.files)
    }

    async fn write_channel(&self, data: &ChannelData) -> Result<()> {
        let unit = UnitId::channel(&data.channel.id).file_stem();
        let mut tx = self.store.begin_unit(self.session_id, &unit).await?;
        for rec in channel_records(data) {
            tx.insert(&rec).await?;
        }
        tx.commit().await
    }

    async fn write_index(&self, index: &Index) -> Result<()> {
        for rec in global_records(index) {
            self.store.insert_record(self.session_id, &rec).await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.store.finish_session(self.session_id).await?;
        self.store.close().await;
        self.files.close().await
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Flat export
// ═══════════════════════════════════════════════════════════════════════

pub struct ExportTarget {
    name: String,
    fs: Arc<dyn FsTarget>,
    layout: FileLayout,
}

impl ExportTarget {
    pub fn create(path: &Path, layout: FileLayout) -> Result<Self> {
        Ok(Self {
            name: path.display().to_string(),
            fs: fsadapter::open(path)?,
            layout,
        })
    }
}

#[async_trait]
impl Target for ExportTarget {
    fn name(&self) -> &str {
        &self.name
    }

    fn format(&self) -> Format {
        Format::Export
    }

    fn file_layout(&self) -> Option<FileLayout> {
        Some(self.layout)
    }

    fn files(&self) -> Arc<dyn FsTarget> {
        Arc::clone(&self.fs)
    }

    /// One file per UTC day, replies interleaved with the main timeline.
    async fn write_channel(&self, data: &ChannelData) -> Result<()> {
        let mut days: BTreeMap<String, Vec<&Message>> = BTreeMap::new();
        for m in data.interleaved() {
            match ts::day(&m.ts) {
                Ok(day) => days.entry(day).or_default().push(m),
                Err(e) => warn!(channel_id = %data.channel.id, ts = %m.ts, error = %e, "message dropped"),
            }
        }
        let dir = data.channel.export_name();
        for (day, msgs) in days {
            self.fs
                .write_file(&format!("{}/{}.json", dir, day), &to_json(&msgs)?)
                .await?;
        }
        Ok(())
    }

    async fn write_index(&self, index: &Index) -> Result<()> {
        let idx = ExportIndex::build(&index.channels, index.users.clone());
        self.fs.write_file(CHANNELS_FILE, &to_json(&idx.channels)?).await?;
        self.fs.write_file(GROUPS_FILE, &to_json(&idx.groups)?).await?;
        self.fs.write_file(MPIMS_FILE, &to_json(&idx.mpims)?).await?;
        self.fs.write_file(DMS_FILE, &to_json(&idx.dms)?).await?;
        self.fs.write_file(USERS_FILE, &to_json(&idx.users)?).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.fs.close().await
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Dump
// ═══════════════════════════════════════════════════════════════════════

pub struct DumpTarget {
    name: String,
    fs: Arc<dyn FsTarget>,
}

impl DumpTarget {
    pub fn create(path: &Path) -> Result<Self> {
        Ok(Self {
            name: path.display().to_string(),
            fs: fsadapter::open(path)?,
        })
    }
}

#[async_trait]
impl Target for DumpTarget {
    fn name(&self) -> &str {
        &self.name
    }

    fn format(&self) -> Format {
        Format::Dump
    }

    fn file_layout(&self) -> Option<FileLayout> {
        Some(FileLayout::Dump)
    }

    fn files(&self) -> Arc<dyn FsTarget> {
        Arc::clone(&self.fs)
    }

    async fn write_channel(&self, data: &ChannelData) -> Result<()> {
        let mut replies: HashMap<&str, &[Message]> = HashMap::new();
        for (parent_ts, (_, r)) in &data.threads {
            replies.insert(parent_ts.as_str(), r.as_slice());
        }
        let messages = data
            .messages
            .iter()
            .map(|m| DumpMessage {
                message: m.clone(),
                replies: replies
                    .get(m.ts.as_str())
                    .map(|r| {
                        r.iter()
                            .map(|reply| DumpMessage {
                                message: reply.clone(),
                                replies: Vec::new(),
                            })
                            .collect()
                    })
                    .unwrap_or_default(),
            })
            .collect();
        let conv = Conversation {
            id: data.channel.id.clone(),
            name: data.channel.name.clone(),
            thread_ts: String::new(),
            messages,
        };
        self.fs
            .write_file(&source_dump::channel_file(&conv.id), &to_json(&conv)?)
            .await
    }

    async fn write_index(&self, index: &Index) -> Result<()> {
        self.fs.write_file("users.json", &to_json(&index.users)?).await?;
        self.fs
            .write_file("channels.json", &to_json(&index.channels)?)
            .await?;
        if let Some(ws) = &index.workspace {
            self.fs.write_file("workspace.json", &to_json(ws)?).await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.fs.close().await
    }
}
