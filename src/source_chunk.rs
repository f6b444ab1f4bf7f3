//! [`Sourcer`] over a chunk directory.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chatvault_core::models::{Channel, File, Message, User, WorkspaceInfo};
use chatvault_core::paths::FileLayout;
use chatvault_core::record::Record;
use chatvault_core::source::{
    LatestMap, MessageStream, SourceError, SourceKind, SourceResult, Sourcer,
};
use chatvault_core::ts;
use chatvault_core::unit::{self, SlackLink, UnitId};
use futures::StreamExt;
use tracing::warn;

use crate::chunkfile::ChunkReader;
use crate::directory::Directory;
use crate::storage::{FileStorage, SourceFs};

pub struct ChunkSource {
    dir: Arc<Directory>,
    name: String,
    storage: FileStorage,
}

impl ChunkSource {
    /// Wrap a directory. Fails when the workspace sentinel is missing.
    pub fn open(dir: Arc<Directory>) -> anyhow::Result<Self> {
        if !dir.has_sentinel() {
            anyhow::bail!(
                "{} is not a chunk directory (no {} file)",
                dir.root().display(),
                unit::WORKSPACE
            );
        }
        let fs = SourceFs::Dir(dir.root().to_path_buf());
        let avatars = dir.root().join(chatvault_core::paths::AVATARS_DIR).is_dir();
        let storage = FileStorage::new(fs, Some(FileLayout::Mattermost), avatars);
        Ok(Self {
            name: dir.root().display().to_string(),
            dir,
            storage,
        })
    }

    pub fn directory(&self) -> &Arc<Directory> {
        &self.dir
    }

    /// Complete records of a unit. A corrupt tail is logged and the
    /// records before it are kept.
    fn records(&self, stem: &str) -> SourceResult<Vec<Record>> {
        if !self.dir.exists(stem) {
            return Err(SourceError::NotFound(stem.to_string()));
        }
        let mut out = Vec::new();
        for frame in ChunkReader::open(&self.dir.path_of(stem))? {
            match frame {
                Ok(f) => out.push(f.record),
                Err(e) => {
                    warn!(unit = stem, error = %format!("{:#}", e), "skipping corrupt tail of chunk file");
                    break;
                }
            }
        }
        Ok(out)
    }

    fn channel_by_id(&self, channel_id: &str) -> Channel {
        self.records(channel_id)
            .ok()
            .and_then(|recs| last_channel_info(&recs))
            .unwrap_or_else(|| Channel {
                id: channel_id.to_string(),
                ..Default::default()
            })
    }

    fn thread_messages(&self, channel_id: &str, thread_ts: &str) -> SourceResult<Vec<Message>> {
        let mut parent: Option<Message> = None;
        let mut replies: Vec<Message> = Vec::new();
        let mut found = false;
        let thread_stem = UnitId::thread(channel_id, thread_ts).file_stem();
        for stem in [channel_id.to_string(), thread_stem] {
            let recs = match self.records(&stem) {
                Ok(r) => r,
                Err(SourceError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            for rec in recs {
                match rec {
                    Record::ThreadMessages {
                        parent: p,
                        messages,
                        ..
                    } if root_of(&p) == thread_ts => {
                        found = true;
                        parent = Some(p);
                        replies.extend(messages.into_iter().filter(|m| m.ts != thread_ts));
                    }
                    Record::Messages { messages, .. } if parent.is_none() => {
                        parent = messages.into_iter().find(|m| m.ts == thread_ts);
                    }
                    _ => {}
                }
            }
        }
        if !found {
            return Err(SourceError::NotFound(format!("{}:{}", channel_id, thread_ts)));
        }
        let mut out: Vec<Message> = parent.into_iter().collect();
        out.extend(sort_dedup(replies));
        Ok(out)
    }
}

fn root_of(parent: &Message) -> &str {
    if parent.thread_ts.is_empty() {
        &parent.ts
    } else {
        &parent.thread_ts
    }
}

fn last_channel_info(recs: &[Record]) -> Option<Channel> {
    recs.iter().rev().find_map(|r| match r {
        Record::ChannelInfo { channel, .. } => Some(channel.clone()),
        _ => None,
    })
}

/// Stable sort by timestamp; a later copy of the same message replaces an
/// earlier one.
pub(crate) fn sort_dedup(messages: Vec<Message>) -> Vec<Message> {
    let mut by_ts: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<Message> = Vec::with_capacity(messages.len());
    for m in messages {
        match by_ts.get(&m.ts) {
            Some(&i) => out[i] = m,
            None => {
                by_ts.insert(m.ts.clone(), out.len());
                out.push(m);
            }
        }
    }
    out.sort_by_key(|m| ts::sort_key(&m.ts));
    out
}

fn into_stream(messages: Vec<Message>) -> MessageStream {
    futures::stream::iter(messages.into_iter().map(Ok)).boxed()
}

#[async_trait]
impl Sourcer for ChunkSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Chunk
    }

    async fn channels(&self) -> SourceResult<Vec<Channel>> {
        let mut order: Vec<String> = Vec::new();
        let mut by_id: HashMap<String, Channel> = HashMap::new();
        fn add(order: &mut Vec<String>, by_id: &mut HashMap<String, Channel>, c: Channel) {
            if !by_id.contains_key(&c.id) {
                order.push(c.id.clone());
            }
            by_id.insert(c.id.clone(), c);
        }
        if self.dir.exists(unit::CHANNELS) {
            for rec in self.records(unit::CHANNELS)? {
                if let Record::Channels { channels } = rec {
                    for c in channels {
                        add(&mut order, &mut by_id, c);
                    }
                }
            }
        }
        if order.is_empty() {
            // No channel list: fall back to per-channel info records.
            let stems = self.dir.stems().map_err(SourceError::from)?;
            for stem in stems {
                if UnitId::from_file_stem(&stem).is_none() {
                    continue;
                }
                if let Some(c) = last_channel_info(&self.records(&stem)?) {
                    add(&mut order, &mut by_id, c);
                }
            }
        }
        Ok(order
            .into_iter()
            .filter_map(|id| by_id.remove(&id))
            .collect())
    }

    async fn users(&self) -> SourceResult<Vec<User>> {
        let mut order: Vec<String> = Vec::new();
        let mut by_id: HashMap<String, User> = HashMap::new();
        for rec in self.records(unit::USERS)? {
            if let Record::Users { users } = rec {
                for u in users {
                    if !by_id.contains_key(&u.id) {
                        order.push(u.id.clone());
                    }
                    by_id.insert(u.id.clone(), u);
                }
            }
        }
        Ok(order
            .into_iter()
            .filter_map(|id| by_id.remove(&id))
            .collect())
    }

    async fn all_messages(&self, channel_id: &str) -> SourceResult<MessageStream> {
        let mut messages = Vec::new();
        for rec in self.records(channel_id)? {
            if let Record::Messages {
                channel_id: c,
                messages: m,
                ..
            } = rec
            {
                if c == channel_id {
                    messages.extend(m);
                }
            }
        }
        Ok(into_stream(sort_dedup(messages)))
    }

    async fn all_thread_messages(
        &self,
        channel_id: &str,
        thread_ts: &str,
    ) -> SourceResult<MessageStream> {
        Ok(into_stream(self.thread_messages(channel_id, thread_ts)?))
    }

    async fn channel_info(&self, channel_id: &str) -> SourceResult<Channel> {
        if let Ok(recs) = self.records(channel_id) {
            if let Some(c) = last_channel_info(&recs) {
                return Ok(c);
            }
        }
        self.channels()
            .await?
            .into_iter()
            .find(|c| c.id == channel_id)
            .ok_or_else(|| SourceError::NotFound(channel_id.to_string()))
    }

    async fn workspace_info(&self) -> SourceResult<WorkspaceInfo> {
        for stem in [unit::WORKSPACE, unit::USERS, unit::CHANNELS] {
            let recs = match self.records(stem) {
                Ok(r) => r,
                Err(SourceError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            let found = recs.into_iter().rev().find_map(|r| match r {
                Record::WorkspaceInfo { info } => Some(info),
                _ => None,
            });
            if let Some(info) = found {
                return Ok(info);
            }
        }
        Err(SourceError::NotFound("workspace info".into()))
    }

    async fn latest(&self) -> SourceResult<LatestMap> {
        let mut latest = LatestMap::new();
        let stems = self.dir.stems().map_err(SourceError::from)?;
        for stem in stems {
            if UnitId::from_file_stem(&stem).is_none() {
                continue;
            }
            for rec in self.records(&stem)? {
                let ts_max = match rec.latest_ts() {
                    Some(t) => t.to_string(),
                    None => continue,
                };
                let link = match &rec {
                    Record::ThreadMessages {
                        channel_id, parent, ..
                    } => SlackLink {
                        channel: channel_id.clone(),
                        thread_ts: root_of(parent).to_string(),
                    },
                    Record::Messages { channel_id, .. } => SlackLink {
                        channel: channel_id.clone(),
                        thread_ts: String::new(),
                    },
                    _ => continue,
                };
                let entry = latest.entry(link).or_insert_with(|| ts_max.clone());
                if ts::sort_key(&ts_max) > ts::sort_key(entry) {
                    *entry = ts_max;
                }
            }
        }
        Ok(latest)
    }

    fn file_layout(&self) -> Option<FileLayout> {
        self.storage.layout()
    }

    fn file_path(&self, channel_id: &str, file: &File) -> SourceResult<String> {
        self.storage.file_path(&self.channel_by_id(channel_id), file)
    }

    fn avatar_path(&self, user: &User) -> SourceResult<String> {
        self.storage.avatar_path(user)
    }

    async fn read_path(&self, path: &str) -> SourceResult<Vec<u8>> {
        self.storage.read(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatvault_core::models::WorkspaceInfo;
    use futures::TryStreamExt;
    use tempfile::TempDir;

    fn m(ts: &str) -> Message {
        Message {
            ts: ts.into(),
            ..Default::default()
        }
    }

    fn setup() -> (TempDir, ChunkSource) {
        let tmp = TempDir::new().unwrap();
        let dir = Arc::new(Directory::create(tmp.path()).unwrap());
        dir.encode(Record::WorkspaceInfo {
            info: WorkspaceInfo {
                team_id: "T1".into(),
                ..Default::default()
            },
        })
        .unwrap();
        dir.encode(Record::Messages {
            channel_id: "C1".into(),
            is_last: false,
            thread_count: 0,
            messages: vec![m("3.0"), m("1.0")],
        })
        .unwrap();
        let parent = Message {
            ts: "2.0".into(),
            thread_ts: "2.0".into(),
            reply_count: 2,
            ..Default::default()
        };
        dir.encode(Record::Messages {
            channel_id: "C1".into(),
            is_last: true,
            thread_count: 1,
            messages: vec![parent.clone(), m("10.0")],
        })
        .unwrap();
        dir.encode(Record::ThreadMessages {
            channel_id: "C1".into(),
            parent,
            is_last: true,
            thread_only: false,
            messages: vec![m("2.5"), m("2.2")],
        })
        .unwrap();
        let src = ChunkSource::open(dir).unwrap();
        (tmp, src)
    }

    #[tokio::test]
    async fn messages_sorted_numerically() {
        let (_tmp, src) = setup();
        let msgs: Vec<Message> = src.all_messages("C1").await.unwrap().try_collect().await.unwrap();
        let ts: Vec<&str> = msgs.iter().map(|m| m.ts.as_str()).collect();
        assert_eq!(ts, vec!["1.0", "2.0", "3.0", "10.0"]);
    }

    #[tokio::test]
    async fn thread_parent_first() {
        let (_tmp, src) = setup();
        let msgs: Vec<Message> = src
            .all_thread_messages("C1", "2.0")
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        let ts: Vec<&str> = msgs.iter().map(|m| m.ts.as_str()).collect();
        assert_eq!(ts, vec!["2.0", "2.2", "2.5"]);
        assert!(src
            .all_thread_messages("C1", "9.0")
            .await
            .err()
            .unwrap()
            .is_not_found());
    }

    #[tokio::test]
    async fn latest_per_unit() {
        let (_tmp, src) = setup();
        let latest = src.latest().await.unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[&SlackLink::parse("C1").unwrap()], "10.0");
        assert_eq!(latest[&SlackLink::parse("C1:2.0").unwrap()], "2.5");
    }

    #[tokio::test]
    async fn missing_users_is_not_found() {
        let (_tmp, src) = setup();
        assert!(src.users().await.unwrap_err().is_not_found());
        assert_eq!(src.workspace_info().await.unwrap().team_id, "T1");
        assert!(src.avatar_path(&User::default()).unwrap_err().is_not_supported());
    }

    fn chan(id: &str, name: &str) -> Channel {
        Channel {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    fn with_records(records: Vec<Record>) -> (TempDir, ChunkSource) {
        let tmp = TempDir::new().unwrap();
        let dir = Arc::new(Directory::create(tmp.path()).unwrap());
        for rec in records {
            dir.encode(rec).unwrap();
        }
        dir.encode(Record::WorkspaceInfo {
            info: WorkspaceInfo::default(),
        })
        .unwrap();
        let src = ChunkSource::open(dir).unwrap();
        (tmp, src)
    }

    #[tokio::test]
    async fn channel_list_keeps_first_order_and_last_value() {
        let (_tmp, src) = with_records(vec![
            Record::Channels {
                channels: vec![chan("C2", "old"), chan("C1", "general")],
            },
            Record::Channels {
                channels: vec![chan("C2", "random"), chan("C3", "dev")],
            },
        ]);
        let channels = src.channels().await.unwrap();
        let got: Vec<(&str, &str)> = channels
            .iter()
            .map(|c| (c.id.as_str(), c.name.as_str()))
            .collect();
        assert_eq!(got, [("C2", "random"), ("C1", "general"), ("C3", "dev")]);
    }

    #[tokio::test]
    async fn channels_fall_back_to_channel_info() {
        let (_tmp, src) = with_records(vec![
            Record::ChannelInfo {
                channel: chan("C1", "general"),
                thread_ts: String::new(),
            },
            Record::Messages {
                channel_id: "C1".into(),
                is_last: true,
                thread_count: 0,
                messages: vec![m("1.0")],
            },
        ]);
        let channels = src.channels().await.unwrap();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].name, "general");
    }

    #[test]
    fn requires_sentinel() {
        let tmp = TempDir::new().unwrap();
        let dir = Arc::new(Directory::create(tmp.path()).unwrap());
        assert!(ChunkSource::open(dir).is_err());
    }
}
