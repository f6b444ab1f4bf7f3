//! In-memory Slack API used by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chatvault::archive::Remote;
use chatvault::stream::{Fetcher, Page, Streamer, Window};
use chatvault_core::models::{
    Channel, File, Message, Profile, SearchMessage, User, WorkspaceInfo,
};

pub const T0: i64 = 1_700_000_000;

/// `T0 + secs` as a Slack timestamp.
pub fn ts(secs: i64) -> String {
    format!("{}.000000", T0 + secs)
}

pub fn msg(secs: i64, text: &str) -> Message {
    Message {
        ts: ts(secs),
        kind: "message".into(),
        user: "U1".into(),
        text: text.into(),
        ..Default::default()
    }
}

pub fn file(id: &str, name: &str) -> File {
    File {
        id: id.into(),
        name: name.into(),
        title: name.into(),
        mimetype: "text/plain".into(),
        size: 4,
        url_private_download: format!("https://files.example/{}/{}", id, name),
        ..Default::default()
    }
}

fn channel(id: &str, name: &str) -> Channel {
    Channel {
        id: id.into(),
        name: name.into(),
        is_member: true,
        created: T0,
        ..Default::default()
    }
}

fn user(id: &str, name: &str) -> User {
    User {
        id: id.into(),
        team_id: "T1".into(),
        name: name.into(),
        real_name: name.into(),
        profile: Profile {
            real_name: name.into(),
            image_original: format!("https://avatars.example/{}/original.png", id),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub struct FakeSlack {
    pub team_id: Mutex<String>,
    pub channels: Vec<Channel>,
    pub users: Vec<User>,
    /// Main timelines, oldest first.
    history: Mutex<HashMap<String, Vec<Message>>>,
    /// Replies keyed by `(channel, thread_ts)`, without the parent.
    replies: Mutex<HashMap<(String, String), Vec<Message>>>,
    pub fail_history: Mutex<HashSet<String>>,
    pub page_size: usize,
    pub fetches: AtomicUsize,
}

impl FakeSlack {
    /// `general` (C1): ten messages, one with two attachments, one thread
    /// parent with a single reply. `random` (C2): empty.
    pub fn workspace() -> Arc<Self> {
        let mut general: Vec<Message> = (1..=10).map(|i| msg(i, &format!("m{}", i))).collect();
        general[2].thread_ts = general[2].ts.clone();
        general[2].reply_count = 1;
        general[4].files = vec![file("F1", "a.txt"), file("F2", "b.txt")];

        let mut reply = msg(3, "reply");
        reply.ts = format!("{}.500000", T0 + 3);
        reply.thread_ts = ts(3);
        reply.user = "U2".into();

        let mut history = HashMap::new();
        history.insert("C1".to_string(), general);
        history.insert("C2".to_string(), Vec::new());
        let mut replies = HashMap::new();
        replies.insert(("C1".to_string(), ts(3)), vec![reply]);

        Arc::new(Self {
            team_id: Mutex::new("T1".into()),
            channels: vec![channel("C1", "general"), channel("C2", "random")],
            users: vec![user("U1", "alice"), user("U2", "bob")],
            history: Mutex::new(history),
            replies: Mutex::new(replies),
            fail_history: Mutex::new(HashSet::new()),
            page_size: 3,
            fetches: AtomicUsize::new(0),
        })
    }

    pub fn post(&self, channel_id: &str, m: Message) {
        self.history
            .lock()
            .unwrap()
            .entry(channel_id.to_string())
            .or_default()
            .push(m);
    }

    pub fn set_team(&self, team_id: &str) {
        *self.team_id.lock().unwrap() = team_id.to_string();
    }

    pub fn fail(&self, channel_id: &str) {
        self.fail_history
            .lock()
            .unwrap()
            .insert(channel_id.to_string());
    }

    pub fn remote(self: &Arc<Self>) -> Remote {
        Remote {
            streamer: self.clone(),
            fetcher: self.clone(),
        }
    }

    fn page<T: Clone>(&self, items: &[T], cursor: Option<&str>) -> Result<Page<T>> {
        let start: usize = match cursor {
            Some(c) => c.parse()?,
            None => 0,
        };
        let end = (start + self.page_size).min(items.len());
        let next_cursor = (end < items.len()).then(|| end.to_string());
        Ok(Page {
            items: items[start.min(end)..end].to_vec(),
            next_cursor,
        })
    }
}

#[async_trait]
impl Streamer for FakeSlack {
    async fn workspace_info(&self) -> Result<WorkspaceInfo> {
        Ok(WorkspaceInfo {
            team: "Example".into(),
            team_id: self.team_id.lock().unwrap().clone(),
            url: "https://example.slack.com/".into(),
            user: "alice".into(),
            user_id: "U1".into(),
            ..Default::default()
        })
    }

    async fn list_channels(&self, cursor: Option<&str>) -> Result<Page<Channel>> {
        self.page(&self.channels, cursor)
    }

    async fn list_users(&self, cursor: Option<&str>) -> Result<Page<User>> {
        self.page(&self.users, cursor)
    }

    async fn channel_info(&self, channel_id: &str) -> Result<Channel> {
        self.channels
            .iter()
            .find(|c| c.id == channel_id)
            .cloned()
            .ok_or_else(|| anyhow!("channel_not_found"))
    }

    async fn channel_members(&self, _channel_id: &str, _cursor: Option<&str>) -> Result<Page<String>> {
        Ok(Page::last(self.users.iter().map(|u| u.id.clone()).collect()))
    }

    async fn history(
        &self,
        channel_id: &str,
        window: &Window,
        cursor: Option<&str>,
    ) -> Result<Page<Message>> {
        if self.fail_history.lock().unwrap().contains(channel_id) {
            bail!("ratelimited");
        }
        let all: Vec<Message> = self
            .history
            .lock()
            .unwrap()
            .get(channel_id)
            .ok_or_else(|| anyhow!("channel_not_found"))?
            .iter()
            .filter(|m| window.contains(&m.ts))
            .cloned()
            .collect();
        self.page(&all, cursor)
    }

    async fn replies(
        &self,
        channel_id: &str,
        thread_ts: &str,
        window: &Window,
        cursor: Option<&str>,
    ) -> Result<Page<Message>> {
        let parent = self
            .history
            .lock()
            .unwrap()
            .get(channel_id)
            .and_then(|h| h.iter().find(|m| m.ts == thread_ts).cloned())
            .ok_or_else(|| anyhow!("thread_not_found"))?;
        let mut all = vec![parent];
        if let Some(r) = self
            .replies
            .lock()
            .unwrap()
            .get(&(channel_id.to_string(), thread_ts.to_string()))
        {
            all.extend(r.iter().filter(|m| window.contains(&m.ts)).cloned());
        }
        self.page(&all, cursor)
    }

    async fn search_messages(&self, query: &str, cursor: Option<&str>) -> Result<Page<SearchMessage>> {
        let history = self.history.lock().unwrap();
        let mut hits = Vec::new();
        for (chan, msgs) in history.iter() {
            for m in msgs.iter().filter(|m| m.text.contains(query)) {
                hits.push(SearchMessage {
                    ts: m.ts.clone(),
                    user: m.user.clone(),
                    text: m.text.clone(),
                    channel: chatvault_core::models::SearchChannel {
                        id: chan.clone(),
                        ..Default::default()
                    },
                    ..Default::default()
                });
            }
        }
        hits.sort_by(|a, b| a.ts.cmp(&b.ts));
        self.page(&hits, cursor)
    }

    async fn search_files(&self, query: &str, cursor: Option<&str>) -> Result<Page<File>> {
        let history = self.history.lock().unwrap();
        let files: Vec<File> = history
            .values()
            .flatten()
            .flat_map(|m| m.files.iter())
            .filter(|f| f.name.contains(query))
            .cloned()
            .collect();
        self.page(&files, cursor)
    }
}

#[async_trait]
impl Fetcher for FakeSlack {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        Ok(format!("body of {}", url).into_bytes())
    }
}
