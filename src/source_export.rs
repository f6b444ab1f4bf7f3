//! [`Sourcer`] over a flat Slack-style export (directory or ZIP).
//!
//! ```text
//! channels.json  groups.json  mpims.json  dms.json  users.json
//! general/2024-01-01.json      <- day files: arrays of messages
//! general/attachments/F1-a.txt <- standard layout, or __uploads/
//! ```
//!
//! Thread replies live in the day files next to the main timeline. The
//! first thread lookup in a channel scans its day files once and caches
//! which files mention which thread.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chatvault_core::models::{Channel, File, Message, User, WorkspaceInfo};
use chatvault_core::paths::{FileLayout, AVATARS_DIR, UPLOADS_DIR};
use chatvault_core::source::{
    LatestMap, MessageStream, SourceError, SourceKind, SourceResult, Sourcer,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::source_chunk::sort_dedup;
use crate::storage::{read_json, FileStorage, SourceFs};

pub const CHANNELS_FILE: &str = "channels.json";
pub const GROUPS_FILE: &str = "groups.json";
pub const MPIMS_FILE: &str = "mpims.json";
pub const DMS_FILE: &str = "dms.json";
pub const USERS_FILE: &str = "users.json";

/// An entry of `dms.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DmEntry {
    pub id: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub members: Vec<String>,
}

/// The index files of an export.
#[derive(Debug, Clone, Default)]
pub struct ExportIndex {
    pub channels: Vec<Channel>,
    pub groups: Vec<Channel>,
    pub mpims: Vec<Channel>,
    pub dms: Vec<DmEntry>,
    pub users: Vec<User>,
}

impl ExportIndex {
    /// Split a channel list into the index files.
    pub fn build(channels: &[Channel], users: Vec<User>) -> Self {
        let mut idx = ExportIndex {
            users,
            ..Default::default()
        };
        for c in channels {
            if c.is_im {
                let mut members = c.members.clone();
                if members.is_empty() && !c.user.is_empty() {
                    members.push(c.user.clone());
                }
                idx.dms.push(DmEntry {
                    id: c.id.clone(),
                    created: c.created,
                    members,
                });
            } else if c.is_mpim {
                idx.mpims.push(c.clone());
            } else if c.is_private {
                idx.groups.push(c.clone());
            } else {
                idx.channels.push(c.clone());
            }
        }
        idx
    }

    fn load(fs: &SourceFs) -> SourceResult<Self> {
        Ok(ExportIndex {
            channels: optional(read_json(fs, CHANNELS_FILE))?,
            groups: optional(read_json(fs, GROUPS_FILE))?,
            mpims: optional(read_json(fs, MPIMS_FILE))?,
            dms: optional(read_json(fs, DMS_FILE))?,
            users: optional(read_json(fs, USERS_FILE))?,
        })
    }

    /// Every conversation, IMs restored from their DM entries.
    pub fn restore(&self) -> Vec<Channel> {
        let me = most_frequent_member(&self.dms);
        let mut out = Vec::with_capacity(
            self.channels.len() + self.groups.len() + self.mpims.len() + self.dms.len(),
        );
        out.extend(self.channels.iter().cloned());
        out.extend(self.groups.iter().cloned());
        out.extend(self.mpims.iter().cloned());
        for dm in &self.dms {
            let user = dm
                .members
                .iter()
                .find(|m| Some(m.as_str()) != me.as_deref())
                .or_else(|| dm.members.first())
                .cloned()
                .unwrap_or_default();
            out.push(Channel {
                id: dm.id.clone(),
                created: dm.created,
                is_im: true,
                user,
                members: dm.members.clone(),
                ..Default::default()
            });
        }
        out
    }
}

fn optional<T: Default>(r: SourceResult<T>) -> SourceResult<T> {
    match r {
        Err(SourceError::NotFound(_)) => Ok(T::default()),
        other => other,
    }
}

/// The member present in most DMs: the archiving user.
fn most_frequent_member(dms: &[DmEntry]) -> Option<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for m in dms.iter().flat_map(|d| d.members.iter()) {
        *counts.entry(m.as_str()).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(a.0)))
        .map(|(m, _)| m.to_string())
}

type ThreadFiles = HashMap<String, Vec<String>>;

pub struct ExportSource {
    fs: SourceFs,
    name: String,
    channels: Vec<Channel>,
    users: Vec<User>,
    storage: FileStorage,
    /// channel dir -> thread ts -> day files mentioning it
    threads: Mutex<HashMap<String, ThreadFiles>>,
}

impl ExportSource {
    pub fn open(fs: SourceFs) -> anyhow::Result<Self> {
        let idx = ExportIndex::load(&fs)?;
        let layout = if fs.exists(UPLOADS_DIR) {
            FileLayout::Mattermost
        } else {
            FileLayout::Standard
        };
        let avatars = fs.exists(AVATARS_DIR);
        Ok(Self {
            name: fs.location().display().to_string(),
            channels: idx.restore(),
            users: idx.users,
            storage: FileStorage::new(fs.clone(), Some(layout), avatars),
            fs,
            threads: Mutex::new(HashMap::new()),
        })
    }

    fn channel(&self, channel_id: &str) -> SourceResult<&Channel> {
        self.channels
            .iter()
            .find(|c| c.id == channel_id)
            .ok_or_else(|| SourceError::NotFound(channel_id.to_string()))
    }

    fn dir_of(&self, channel_id: &str) -> SourceResult<String> {
        let dir = self.channel(channel_id)?.export_name().to_string();
        if !self.fs.exists(&dir) {
            return Err(SourceError::NotFound(dir));
        }
        Ok(dir)
    }

    fn day_files(&self, dir: &str) -> SourceResult<Vec<String>> {
        Ok(self
            .fs
            .list(dir)?
            .into_iter()
            .filter(|n| n.ends_with(".json"))
            .map(|n| format!("{}/{}", dir, n))
            .collect())
    }

    /// Messages of one day file. A file that is not valid JSON is skipped.
    fn read_day(&self, file: &str) -> SourceResult<Vec<Message>> {
        let items: Vec<Value> = match read_json(&self.fs, file) {
            Ok(v) => v,
            Err(SourceError::Json(e)) => {
                warn!(file, error = %e, "skipping broken file");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };
        let mut out = Vec::with_capacity(items.len());
        for (i, item) in items.into_iter().enumerate() {
            match serde_json::from_value::<Message>(item) {
                Ok(m) if !m.ts.is_empty() => out.push(m),
                _ => debug!(file, index = i, "skipping an empty message"),
            }
        }
        Ok(out)
    }

    fn thread_files(&self, dir: &str) -> SourceResult<ThreadFiles> {
        if let Ok(cache) = self.threads.lock() {
            if let Some(t) = cache.get(dir) {
                return Ok(t.clone());
            }
        }
        let mut index: ThreadFiles = HashMap::new();
        for file in self.day_files(dir)? {
            for m in self.read_day(&file)? {
                if m.thread_ts.is_empty() {
                    continue;
                }
                let files = index.entry(m.thread_ts.clone()).or_default();
                if files.last() != Some(&file) {
                    files.push(file.clone());
                }
            }
        }
        debug!(channel_dir = dir, threads = index.len(), "thread index built");
        if let Ok(mut cache) = self.threads.lock() {
            cache.insert(dir.to_string(), index.clone());
        }
        Ok(index)
    }
}

#[async_trait]
impl Sourcer for ExportSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Export
    }

    async fn channels(&self) -> SourceResult<Vec<Channel>> {
        Ok(self.channels.clone())
    }

    async fn users(&self) -> SourceResult<Vec<User>> {
        if self.users.is_empty() {
            return Err(SourceError::NotFound(USERS_FILE.into()));
        }
        Ok(self.users.clone())
    }

    async fn all_messages(&self, channel_id: &str) -> SourceResult<MessageStream> {
        let dir = self.dir_of(channel_id)?;
        let mut out = Vec::new();
        for file in self.day_files(&dir)? {
            out.extend(
                self.read_day(&file)?
                    .into_iter()
                    .filter(|m| !m.is_thread_reply()),
            );
        }
        Ok(futures::stream::iter(sort_dedup(out).into_iter().map(Ok)).boxed())
    }

    async fn all_thread_messages(
        &self,
        channel_id: &str,
        thread_ts: &str,
    ) -> SourceResult<MessageStream> {
        let dir = self.dir_of(channel_id)?;
        let files = self
            .thread_files(&dir)?
            .remove(thread_ts)
            .ok_or_else(|| SourceError::NotFound(format!("{}:{}", channel_id, thread_ts)))?;
        let mut parent = None;
        let mut replies = Vec::new();
        for file in files {
            for m in self.read_day(&file)? {
                if m.thread_ts != thread_ts {
                    continue;
                }
                if m.ts == thread_ts {
                    parent = Some(m);
                } else {
                    replies.push(m);
                }
            }
        }
        let all: Vec<Message> = parent.into_iter().chain(sort_dedup(replies)).collect();
        Ok(futures::stream::iter(all.into_iter().map(Ok)).boxed())
    }

    async fn channel_info(&self, channel_id: &str) -> SourceResult<Channel> {
        self.channel(channel_id).cloned()
    }

    async fn workspace_info(&self) -> SourceResult<WorkspaceInfo> {
        Err(SourceError::NotSupported("workspace info in exports"))
    }

    async fn latest(&self) -> SourceResult<LatestMap> {
        Err(SourceError::NotSupported("latest in exports"))
    }

    fn file_layout(&self) -> Option<FileLayout> {
        self.storage.layout()
    }

    fn file_path(&self, channel_id: &str, file: &File) -> SourceResult<String> {
        let channel = self.channel(channel_id)?;
        self.storage.file_path(channel, file)
    }

    fn avatar_path(&self, user: &User) -> SourceResult<String> {
        self.storage.avatar_path(user)
    }

    async fn read_path(&self, path: &str) -> SourceResult<Vec<u8>> {
        self.storage.read(path)
    }
}
