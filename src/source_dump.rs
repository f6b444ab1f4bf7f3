//! [`Sourcer`] over a legacy dump: one JSON document per conversation.
//!
//! ```text
//! C1.json          {"channel_id":"C1","name":"general","messages":[...]}
//! C1-1.000001.json a single thread, parent first
//! channels.json  users.json  workspace.json   (optional)
//! C1/F1-a.txt      attachments
//! ```
//!
//! Thread replies are nested under their parent in
//! `slackdump_thread_replies`.

use async_trait::async_trait;
use chatvault_core::models::{Channel, File, Message, User, WorkspaceInfo};
use chatvault_core::paths::FileLayout;
use chatvault_core::source::{
    LatestMap, MessageStream, SourceError, SourceKind, SourceResult, Sourcer,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::source_chunk::sort_dedup;
use crate::storage::{read_json, FileStorage, SourceFs};

/// A message as stored in a dump, replies nested.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DumpMessage {
    #[serde(flatten)]
    pub message: Message,
    #[serde(
        rename = "slackdump_thread_replies",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub replies: Vec<DumpMessage>,
}

/// One dump document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    #[serde(rename = "channel_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub thread_ts: String,
    #[serde(default)]
    pub messages: Vec<DumpMessage>,
}

/// `C…`, `D…` or `G…` followed by anything, ending in `.json`.
pub fn is_dump_file(name: &str) -> bool {
    name.ends_with(".json") && matches!(name.chars().next(), Some('C' | 'D' | 'G'))
}

pub fn channel_file(channel_id: &str) -> String {
    format!("{}.json", channel_id)
}

pub fn thread_file(channel_id: &str, thread_ts: &str) -> String {
    format!("{}-{}.json", channel_id, thread_ts)
}

pub struct DumpSource {
    fs: SourceFs,
    name: String,
    channels: Vec<Channel>,
    storage: FileStorage,
}

impl DumpSource {
    pub fn open(fs: SourceFs) -> anyhow::Result<Self> {
        let channels = load_channels(&fs)?;
        Ok(Self {
            name: fs.location().display().to_string(),
            storage: FileStorage::new(fs.clone(), Some(FileLayout::Dump), false),
            fs,
            channels,
        })
    }

    fn conversation(&self, rel: &str) -> SourceResult<Conversation> {
        read_json(&self.fs, rel)
    }

    /// With no channel file, the first message of each thread file.
    fn thread_heads(&self, channel_id: &str) -> SourceResult<Vec<Message>> {
        let prefix = format!("{}-", channel_id);
        let mut heads = Vec::new();
        let mut any = false;
        for name in self.fs.list("")? {
            if !(name.starts_with(&prefix) && name.ends_with(".json")) {
                continue;
            }
            any = true;
            let conv = self.conversation(&name)?;
            match conv.messages.into_iter().next() {
                Some(m) => heads.push(m.message),
                None => debug!(file = %name, "no messages in file"),
            }
        }
        if !any {
            return Err(SourceError::NotFound(channel_file(channel_id)));
        }
        Ok(sort_dedup(heads))
    }
}

fn load_channels(fs: &SourceFs) -> SourceResult<Vec<Channel>> {
    match read_json::<Vec<Channel>>(fs, "channels.json") {
        Ok(c) => return Ok(c),
        Err(SourceError::NotFound(_)) => {}
        Err(e) => return Err(e),
    }
    let mut out: Vec<Channel> = Vec::new();
    for name in fs.list("")? {
        if name.ends_with('/') || !is_dump_file(&name) {
            continue;
        }
        let conv: Conversation = match read_json(fs, &name) {
            Ok(c) => c,
            Err(SourceError::Json(e)) => {
                debug!(file = %name, error = %e, "skipping file with invalid JSON");
                continue;
            }
            Err(e) => return Err(e),
        };
        if out.iter().any(|c| c.id == conv.id) {
            continue;
        }
        // private conversations carry no name in dumps
        let name = if conv.name.is_empty() {
            conv.id.clone()
        } else {
            conv.name
        };
        out.push(Channel {
            id: conv.id,
            name,
            ..Default::default()
        });
    }
    Ok(out)
}

fn stream(messages: Vec<Message>) -> MessageStream {
    futures::stream::iter(messages.into_iter().map(Ok)).boxed()
}

#[async_trait]
impl Sourcer for DumpSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Dump
    }

    async fn channels(&self) -> SourceResult<Vec<Channel>> {
        Ok(self.channels.clone())
    }

    async fn users(&self) -> SourceResult<Vec<User>> {
        read_json(&self.fs, "users.json")
    }

    async fn all_messages(&self, channel_id: &str) -> SourceResult<MessageStream> {
        match self.conversation(&channel_file(channel_id)) {
            Ok(conv) => Ok(stream(sort_dedup(
                conv.messages.into_iter().map(|m| m.message).collect(),
            ))),
            Err(SourceError::NotFound(_)) => Ok(stream(self.thread_heads(channel_id)?)),
            Err(e) => Err(e),
        }
    }

    async fn all_thread_messages(
        &self,
        channel_id: &str,
        thread_ts: &str,
    ) -> SourceResult<MessageStream> {
        match self.conversation(&channel_file(channel_id)) {
            Ok(conv) => {
                if let Some(parent) = conv
                    .messages
                    .into_iter()
                    .find(|m| m.message.ts == thread_ts)
                {
                    let replies = parent
                        .replies
                        .into_iter()
                        .map(|m| m.message)
                        .filter(|m| m.ts != thread_ts)
                        .collect();
                    let all = std::iter::once(parent.message)
                        .chain(sort_dedup(replies))
                        .collect();
                    return Ok(stream(all));
                }
            }
            Err(SourceError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        let conv = self.conversation(&thread_file(channel_id, thread_ts))?;
        Ok(stream(conv.messages.into_iter().map(|m| m.message).collect()))
    }

    async fn channel_info(&self, channel_id: &str) -> SourceResult<Channel> {
        self.channels
            .iter()
            .find(|c| c.id == channel_id)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(channel_id.to_string()))
    }

    async fn workspace_info(&self) -> SourceResult<WorkspaceInfo> {
        read_json(&self.fs, "workspace.json")
    }

    async fn latest(&self) -> SourceResult<LatestMap> {
        Err(SourceError::NotSupported("latest in dumps"))
    }

    fn file_layout(&self) -> Option<FileLayout> {
        self.storage.layout()
    }

    fn file_path(&self, channel_id: &str, file: &File) -> SourceResult<String> {
        let channel = Channel {
            id: channel_id.to_string(),
            ..Default::default()
        };
        self.storage.file_path(&channel, file)
    }

    fn avatar_path(&self, _user: &User) -> SourceResult<String> {
        Err(SourceError::NotSupported("avatars in dumps"))
    }

    async fn read_path(&self, path: &str) -> SourceResult<Vec<u8>> {
        self.storage.read(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use std::fs;
    use tempfile::TempDir;

    fn sample() -> (TempDir, DumpSource) {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::write(
            root.join("C1.json"),
            r#"{"channel_id":"C1","name":"general","messages":[
                {"ts":"2.0","text":"later"},
                {"ts":"1.0","text":"parent","thread_ts":"1.0","reply_count":1,
                 "slackdump_thread_replies":[{"ts":"1.0","text":"parent"},{"ts":"1.5","text":"reply"}]}
            ]}"#,
        )
        .unwrap();
        fs::write(
            root.join("G1-3.0.json"),
            r#"{"channel_id":"G1","thread_ts":"3.0","messages":[{"ts":"3.0","text":"head"},{"ts":"3.1"}]}"#,
        )
        .unwrap();
        fs::write(root.join("Cbroken.json"), "{").unwrap();
        fs::create_dir_all(root.join("C1")).unwrap();
        fs::write(root.join("C1/F1-a.txt"), "x").unwrap();
        let src = DumpSource::open(SourceFs::open(root).unwrap()).unwrap();
        (tmp, src)
    }

    #[tokio::test]
    async fn channels_from_documents() {
        let (_tmp, src) = sample();
        let chans = src.channels().await.unwrap();
        let ids: Vec<&str> = chans.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["C1", "G1"]);
        assert_eq!(chans[1].name, "G1");
    }

    #[tokio::test]
    async fn nested_replies() {
        let (_tmp, src) = sample();
        let main: Vec<Message> = src.all_messages("C1").await.unwrap().try_collect().await.unwrap();
        assert_eq!(main[0].ts, "1.0");
        assert!(!main[0].extra.contains_key("slackdump_thread_replies"));

        let thread: Vec<Message> = src
            .all_thread_messages("C1", "1.0")
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        let ts: Vec<&str> = thread.iter().map(|m| m.ts.as_str()).collect();
        assert_eq!(ts, vec!["1.0", "1.5"]);
    }

    #[tokio::test]
    async fn thread_files_stand_in_for_channels() {
        let (_tmp, src) = sample();
        let heads: Vec<Message> = src.all_messages("G1").await.unwrap().try_collect().await.unwrap();
        assert_eq!(heads.len(), 1);
        assert_eq!(heads[0].text, "head");
        let thread: Vec<Message> = src
            .all_thread_messages("G1", "3.0")
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(thread.len(), 2);
    }

    #[tokio::test]
    async fn optional_pieces() {
        let (_tmp, src) = sample();
        assert!(src.users().await.unwrap_err().is_not_found());
        assert!(src.workspace_info().await.unwrap_err().is_not_found());
        assert!(src.latest().await.unwrap_err().is_not_supported());
        let f = File {
            id: "F1".into(),
            name: "a.txt".into(),
            ..Default::default()
        };
        assert_eq!(src.file_path("C1", &f).unwrap(), "C1/F1-a.txt");
    }
}
