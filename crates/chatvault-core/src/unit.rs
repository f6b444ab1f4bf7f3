//! Logical units and Slack links.
//!
//! A logical unit is either a channel's main timeline or a single thread.
//! Every unit maps to exactly one storage file stem:
//!
//! | Unit | Stem |
//! |------|------|
//! | channel `C123` | `C123` |
//! | thread archived with its channel | `C123` |
//! | thread archived on its own | `C123-1700000000.000100` |
//! | workspace-wide records | `channels`, `users`, `workspace`, `search` |

use std::fmt;

use anyhow::{bail, Result};

/// Stem of the channel list file.
pub const CHANNELS: &str = "channels";
/// Stem of the user list file.
pub const USERS: &str = "users";
/// Stem of the workspace sentinel. A chunk directory without it is not a
/// valid source.
pub const WORKSPACE: &str = "workspace";
/// Stem of the search results file.
pub const SEARCH: &str = "search";

/// Separator between channel id and thread timestamp in link notation.
pub const LINK_SEP: char = ':';

/// Composite key of a logical unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId {
    pub channel_id: String,
    pub thread_ts: String,
    /// When set together with a thread timestamp, the thread is stored in
    /// its own file instead of its channel's file.
    pub is_thread: bool,
}

impl UnitId {
    pub fn channel(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            thread_ts: String::new(),
            is_thread: false,
        }
    }

    /// A thread that lives in its own file.
    pub fn thread(channel_id: impl Into<String>, thread_ts: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            thread_ts: thread_ts.into(),
            is_thread: true,
        }
    }

    /// Storage file stem for this unit.
    pub fn file_stem(&self) -> String {
        if self.is_thread && !self.thread_ts.is_empty() {
            format!("{}-{}", self.channel_id, self.thread_ts)
        } else {
            self.channel_id.clone()
        }
    }

    /// Inverse of [`file_stem`](Self::file_stem) for channel and thread
    /// stems. Well-known stems return `None`.
    pub fn from_file_stem(stem: &str) -> Option<Self> {
        if matches!(stem, CHANNELS | USERS | WORKSPACE | SEARCH) || stem.is_empty() {
            return None;
        }
        match stem.split_once('-') {
            Some((chan, ts)) if !chan.is_empty() && !ts.is_empty() => {
                Some(Self::thread(chan, ts))
            }
            _ => Some(Self::channel(stem)),
        }
    }

    pub fn link(&self) -> SlackLink {
        SlackLink {
            channel: self.channel_id.clone(),
            thread_ts: self.thread_ts.clone(),
        }
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_stem())
    }
}

/// A reference to a channel or a thread, as typed by a user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlackLink {
    pub channel: String,
    pub thread_ts: String,
}

impl SlackLink {
    pub fn is_thread(&self) -> bool {
        !self.channel.is_empty() && !self.thread_ts.is_empty()
    }

    /// Parse `C123`, `C123:1700000000.000100`, or an archive URL such as
    /// `https://team.slack.com/archives/C123/p1700000000000100?thread_ts=1699999999.000200`.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.starts_with("https://") || s.starts_with("http://") {
            return Self::parse_url(s);
        }
        let (channel, thread_ts) = match s.split_once(LINK_SEP) {
            Some((c, t)) => (c, t),
            None => (s, ""),
        };
        if !valid_id(channel) {
            bail!("invalid channel id: {:?}", s);
        }
        if !thread_ts.is_empty() && !valid_ts(thread_ts) {
            bail!("invalid thread timestamp: {:?}", s);
        }
        Ok(Self {
            channel: channel.to_string(),
            thread_ts: thread_ts.to_string(),
        })
    }

    fn parse_url(s: &str) -> Result<Self> {
        let (path, query) = match s.split_once('?') {
            Some((p, q)) => (p, q),
            None => (s, ""),
        };
        let mut parts = path.split('/').skip_while(|p| *p != "archives").skip(1);
        let channel = match parts.next() {
            Some(c) if valid_id(c) => c.to_string(),
            _ => bail!("not a slack archive link: {:?}", s),
        };
        let thread_from_query = query
            .split('&')
            .find_map(|kv| kv.strip_prefix("thread_ts="))
            .map(str::to_string);
        let thread_ts = match (thread_from_query, parts.next()) {
            (Some(ts), _) if valid_ts(&ts) => ts,
            (Some(_), _) => bail!("invalid thread_ts in link: {:?}", s),
            (None, Some(p)) => permalink_ts(p)?,
            (None, None) => String::new(),
        };
        Ok(Self { channel, thread_ts })
    }
}

impl fmt::Display for SlackLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_thread() {
            write!(f, "{}{}{}", self.channel, LINK_SEP, self.thread_ts)
        } else {
            f.write_str(&self.channel)
        }
    }
}

/// `p1700000000000100` -> `1700000000.000100`
fn permalink_ts(p: &str) -> Result<String> {
    let digits = match p.strip_prefix('p') {
        Some(d) if d.len() == 16 && d.bytes().all(|b| b.is_ascii_digit()) => d,
        _ => bail!("invalid permalink segment: {:?}", p),
    };
    Ok(format!("{}.{}", &digits[..10], &digits[10..]))
}

fn valid_id(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && s.len() > 1
        && chars.all(|c| c.is_ascii_alphanumeric())
}

fn valid_ts(s: &str) -> bool {
    match s.split_once('.') {
        Some((a, b)) => {
            !a.is_empty()
                && !b.is_empty()
                && a.bytes().all(|c| c.is_ascii_digit())
                && b.bytes().all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}
