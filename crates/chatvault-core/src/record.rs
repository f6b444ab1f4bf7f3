//! The typed record model.
//!
//! A [`Record`] is the unit of storage and transfer: one API page turned
//! into one tagged value. Every backend (chunk files, relational store,
//! conversion targets) speaks records.
//!
//! Records serialize with short keys to keep archives small:
//!
//! | Key | Field |
//! |-----|-------|
//! | `t` | record kind |
//! | `id` | channel id |
//! | `l` | last batch for the unit |
//! | `r` | thread timestamp for thread-only placement |
//! | `to` | thread-only run |
//! | `p` | parent message |
//! | `m` / `f` / `u` / `ch` | messages / files / users / channels |
//! | `ci` / `cu` / `w` | channel info / channel users / workspace |
//! | `sq` / `sm` / `sf` | search query / message hits / file hits |

use serde::{Deserialize, Serialize};

use crate::models::{Channel, File, Message, SearchMessage, User, WorkspaceInfo};
use crate::ts;
use crate::unit::{self, UnitId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum Record {
    Channels {
        #[serde(rename = "ch")]
        channels: Vec<Channel>,
    },
    Users {
        #[serde(rename = "u")]
        users: Vec<User>,
    },
    /// One page of a channel's main timeline.
    Messages {
        #[serde(rename = "id")]
        channel_id: String,
        #[serde(rename = "l", default, skip_serializing_if = "is_false")]
        is_last: bool,
        #[serde(rename = "nt", default, skip_serializing_if = "is_zero")]
        thread_count: u32,
        #[serde(rename = "m", default)]
        messages: Vec<Message>,
    },
    /// One page of replies of a thread. The parent is repeated in every
    /// page so a single page is self-describing.
    ThreadMessages {
        #[serde(rename = "id")]
        channel_id: String,
        #[serde(rename = "p")]
        parent: Message,
        #[serde(rename = "l", default, skip_serializing_if = "is_false")]
        is_last: bool,
        #[serde(rename = "to", default, skip_serializing_if = "is_false")]
        thread_only: bool,
        #[serde(rename = "m", default)]
        messages: Vec<Message>,
    },
    Files {
        #[serde(rename = "id")]
        channel_id: String,
        #[serde(rename = "p")]
        parent: Message,
        #[serde(rename = "to", default, skip_serializing_if = "is_false")]
        thread_only: bool,
        #[serde(rename = "f", default)]
        files: Vec<File>,
    },
    WorkspaceInfo {
        #[serde(rename = "w")]
        info: WorkspaceInfo,
    },
    ChannelInfo {
        #[serde(rename = "ci")]
        channel: Channel,
        #[serde(rename = "r", default, skip_serializing_if = "String::is_empty")]
        thread_ts: String,
    },
    ChannelUsers {
        #[serde(rename = "id")]
        channel_id: String,
        #[serde(rename = "r", default, skip_serializing_if = "String::is_empty")]
        thread_ts: String,
        #[serde(rename = "cu", default)]
        user_ids: Vec<String>,
    },
    SearchMessages {
        #[serde(rename = "sq")]
        query: String,
        #[serde(rename = "sm", default)]
        messages: Vec<SearchMessage>,
    },
    SearchFiles {
        #[serde(rename = "sq")]
        query: String,
        #[serde(rename = "sf", default)]
        files: Vec<File>,
    },
}

/// Discriminant of a [`Record`], used for stats and the relational schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKind {
    Channels,
    Users,
    Messages,
    ThreadMessages,
    Files,
    WorkspaceInfo,
    ChannelInfo,
    ChannelUsers,
    SearchMessages,
    SearchFiles,
}

impl RecordKind {
    pub const ALL: [RecordKind; 10] = [
        RecordKind::Channels,
        RecordKind::Users,
        RecordKind::Messages,
        RecordKind::ThreadMessages,
        RecordKind::Files,
        RecordKind::WorkspaceInfo,
        RecordKind::ChannelInfo,
        RecordKind::ChannelUsers,
        RecordKind::SearchMessages,
        RecordKind::SearchFiles,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Channels => "channels",
            RecordKind::Users => "users",
            RecordKind::Messages => "messages",
            RecordKind::ThreadMessages => "thread_messages",
            RecordKind::Files => "files",
            RecordKind::WorkspaceInfo => "workspace_info",
            RecordKind::ChannelInfo => "channel_info",
            RecordKind::ChannelUsers => "channel_users",
            RecordKind::SearchMessages => "search_messages",
            RecordKind::SearchFiles => "search_files",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }

    /// Stem of the file holding this kind, when the kind is workspace-wide.
    pub fn well_known_stem(&self) -> Option<&'static str> {
        match self {
            RecordKind::Channels => Some(unit::CHANNELS),
            RecordKind::Users => Some(unit::USERS),
            RecordKind::WorkspaceInfo => Some(unit::WORKSPACE),
            RecordKind::SearchMessages | RecordKind::SearchFiles => Some(unit::SEARCH),
            _ => None,
        }
    }
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Channels { .. } => RecordKind::Channels,
            Record::Users { .. } => RecordKind::Users,
            Record::Messages { .. } => RecordKind::Messages,
            Record::ThreadMessages { .. } => RecordKind::ThreadMessages,
            Record::Files { .. } => RecordKind::Files,
            Record::WorkspaceInfo { .. } => RecordKind::WorkspaceInfo,
            Record::ChannelInfo { .. } => RecordKind::ChannelInfo,
            Record::ChannelUsers { .. } => RecordKind::ChannelUsers,
            Record::SearchMessages { .. } => RecordKind::SearchMessages,
            Record::SearchFiles { .. } => RecordKind::SearchFiles,
        }
    }

    /// The logical unit a channel-scoped record belongs to.
    pub fn unit(&self) -> Option<UnitId> {
        match self {
            Record::Messages { channel_id, .. } => Some(UnitId::channel(channel_id)),
            Record::ThreadMessages {
                channel_id,
                parent,
                thread_only,
                ..
            }
            | Record::Files {
                channel_id,
                parent,
                thread_only,
                ..
            } => Some(UnitId {
                channel_id: channel_id.clone(),
                thread_ts: thread_root(parent).to_string(),
                is_thread: *thread_only,
            }),
            Record::ChannelInfo { channel, thread_ts } => Some(placed(&channel.id, thread_ts)),
            Record::ChannelUsers {
                channel_id,
                thread_ts,
                ..
            } => Some(placed(channel_id, thread_ts)),
            _ => None,
        }
    }

    /// Storage file stem the record is appended to.
    pub fn file_stem(&self) -> String {
        match self.kind().well_known_stem() {
            Some(stem) => stem.to_string(),
            None => self.unit().map(|u| u.file_stem()).unwrap_or_default(),
        }
    }

    /// Group id: a stable key for all records of the same kind and entity.
    pub fn group_id(&self) -> String {
        match self {
            Record::Messages { channel_id, .. } => channel_id.clone(),
            Record::ThreadMessages {
                channel_id, parent, ..
            } => thread_group_id(channel_id, thread_root(parent)),
            Record::Files {
                channel_id, parent, ..
            } => format!("f{}:{}", channel_id, parent.ts),
            Record::ChannelInfo { channel, .. } => format!("ic{}", channel.id),
            Record::ChannelUsers { channel_id, .. } => format!("lcu{}", channel_id),
            Record::Users { .. } => "lusr".to_string(),
            Record::Channels { .. } => "lch".to_string(),
            Record::WorkspaceInfo { .. } => "iw".to_string(),
            Record::SearchMessages { .. } => "sm".to_string(),
            Record::SearchFiles { .. } => "sf".to_string(),
        }
    }

    /// Number of payload elements.
    pub fn len(&self) -> usize {
        match self {
            Record::Channels { channels } => channels.len(),
            Record::Users { users } => users.len(),
            Record::Messages { messages, .. } | Record::ThreadMessages { messages, .. } => {
                messages.len()
            }
            Record::Files { files, .. } | Record::SearchFiles { files, .. } => files.len(),
            Record::WorkspaceInfo { .. } | Record::ChannelInfo { .. } => 1,
            Record::ChannelUsers { user_ids, .. } => user_ids.len(),
            Record::SearchMessages { messages, .. } => messages.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Newest message timestamp carried by a message or thread batch.
    pub fn latest_ts(&self) -> Option<&str> {
        match self {
            Record::Messages { messages, .. } | Record::ThreadMessages { messages, .. } => messages
                .iter()
                .map(|m| m.ts.as_str())
                .max_by_key(|t| ts::sort_key(t)),
            _ => None,
        }
    }
}

/// `t{channel}:{thread_ts}`
pub fn thread_group_id(channel_id: &str, thread_ts: &str) -> String {
    format!("t{}:{}", channel_id, thread_ts)
}

/// Decode a message or thread group id back into its logical unit
/// coordinates: `C1` -> `("C1", "")`, `tC1:1.0` -> `("C1", "1.0")`.
pub fn parse_group_id(group: &str) -> Option<(String, String)> {
    if let Some(rest) = group.strip_prefix('t') {
        let (chan, ts) = rest.split_once(':')?;
        return Some((chan.to_string(), ts.to_string()));
    }
    // Slack ids start with an uppercase letter; every other group id
    // carries a lowercase category prefix.
    match group.chars().next() {
        Some(c) if c.is_ascii_uppercase() => Some((group.to_string(), String::new())),
        _ => None,
    }
}

fn thread_root(parent: &Message) -> &str {
    if parent.thread_ts.is_empty() {
        &parent.ts
    } else {
        &parent.thread_ts
    }
}

fn placed(channel_id: &str, thread_ts: &str) -> UnitId {
    if thread_ts.is_empty() {
        UnitId::channel(channel_id)
    } else {
        UnitId::thread(channel_id, thread_ts)
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(ts: &str) -> Message {
        Message {
            ts: ts.to_string(),
            text: format!("m{}", ts),
            ..Default::default()
        }
    }

    #[test]
    fn short_keys_on_the_wire() {
        let r = Record::Messages {
            channel_id: "C1".into(),
            is_last: true,
            thread_count: 0,
            messages: vec![msg("1.0")],
        };
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["t"], "messages");
        assert_eq!(v["id"], "C1");
        assert_eq!(v["l"], true);
        assert!(v.get("nt").is_none());
        let back: Record = serde_json::from_value(v).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn placement() {
        let parent = Message {
            ts: "5.0".into(),
            thread_ts: "5.0".into(),
            reply_count: 1,
            ..Default::default()
        };
        let folded = Record::ThreadMessages {
            channel_id: "C1".into(),
            parent: parent.clone(),
            is_last: true,
            thread_only: false,
            messages: vec![msg("6.0")],
        };
        assert_eq!(folded.file_stem(), "C1");
        assert_eq!(folded.group_id(), "tC1:5.0");

        let own = Record::ThreadMessages {
            channel_id: "C1".into(),
            parent,
            is_last: true,
            thread_only: true,
            messages: vec![],
        };
        assert_eq!(own.file_stem(), "C1-5.0");

        let users = Record::Users { users: vec![] };
        assert_eq!(users.file_stem(), "users");
        assert_eq!(users.group_id(), "lusr");
    }

    #[test]
    fn latest_is_numeric_max() {
        let r = Record::Messages {
            channel_id: "C1".into(),
            is_last: false,
            thread_count: 0,
            messages: vec![msg("999999999.000001"), msg("1000000000.000000"), msg("5.0")],
        };
        assert_eq!(r.latest_ts(), Some("1000000000.000000"));
    }

    #[test]
    fn group_id_parsing() {
        assert_eq!(parse_group_id("C1"), Some(("C1".into(), "".into())));
        assert_eq!(parse_group_id("tC1:1.0"), Some(("C1".into(), "1.0".into())));
        assert_eq!(parse_group_id("lusr"), None);
        assert_eq!(parse_group_id("icC1"), None);
        assert_eq!(parse_group_id("fC1:1.0"), None);
    }

    #[test]
    fn kind_names_roundtrip() {
        for k in RecordKind::ALL {
            assert_eq!(RecordKind::parse(k.as_str()), Some(k));
        }
    }
}
