//! The read abstraction shared by every storage backend.
//!
//! A [`Sourcer`] is implemented by the chunk directory, the relational
//! store, and flat export / dump archives. Conversion and resume only ever
//! talk to this trait, so any backend can feed any target.
//!
//! Capabilities a backend lacks fail with [`SourceError::NotSupported`];
//! callers degrade on that variant. [`SourceError::NotFound`] means the
//! unit genuinely has no data.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::models::{Channel, File, Message, User, WorkspaceInfo};
use crate::paths::FileLayout;
use crate::unit::SlackLink;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("operation not supported by this source: {0}")]
    NotSupported(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Backend(String),
}

impl SourceError {
    pub fn is_not_supported(&self) -> bool {
        matches!(self, SourceError::NotSupported(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SourceError::NotFound(_))
    }
}

impl From<anyhow::Error> for SourceError {
    fn from(err: anyhow::Error) -> Self {
        SourceError::Backend(format!("{:#}", err))
    }
}

pub type SourceResult<T> = std::result::Result<T, SourceError>;

/// A finite, single-pass sequence of messages. Errors are yielded inline;
/// a consumer that sees an error may stop or continue.
pub type MessageStream = BoxStream<'static, SourceResult<Message>>;

/// `logical unit -> newest recorded message timestamp`.
pub type LatestMap = BTreeMap<SlackLink, String>;

/// Storage flavour behind a [`Sourcer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Chunk,
    Database,
    Export,
    Dump,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Chunk => "chunk",
            SourceKind::Database => "database",
            SourceKind::Export => "export",
            SourceKind::Dump => "dump",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "chunk" => Some(SourceKind::Chunk),
            "database" | "db" => Some(SourceKind::Database),
            "export" => Some(SourceKind::Export),
            "dump" => Some(SourceKind::Dump),
            _ => None,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only capability set over an archived workspace.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`channels`](Sourcer::channels) | All known conversations |
/// | [`users`](Sourcer::users) | All known users |
/// | [`all_messages`](Sourcer::all_messages) | A channel's timeline, oldest first |
/// | [`all_thread_messages`](Sourcer::all_thread_messages) | Parent then replies of a thread |
/// | [`channel_info`](Sourcer::channel_info) | One channel's metadata |
/// | [`workspace_info`](Sourcer::workspace_info) | Identity of the archived workspace |
/// | [`latest`](Sourcer::latest) | Newest message per logical unit |
/// | [`file_path`](Sourcer::file_path) / [`avatar_path`](Sourcer::avatar_path) | Attachment locations |
/// | [`read_path`](Sourcer::read_path) | Body of a resolved attachment |
#[async_trait]
pub trait Sourcer: Send + Sync {
    /// Human-readable location (directory, file name).
    fn name(&self) -> &str;

    fn kind(&self) -> SourceKind;

    async fn channels(&self) -> SourceResult<Vec<Channel>>;

    async fn users(&self) -> SourceResult<Vec<User>>;

    /// Every message of a channel's main timeline, sorted by timestamp.
    async fn all_messages(&self, channel_id: &str) -> SourceResult<MessageStream>;

    /// The thread parent followed by its replies, sorted by timestamp.
    async fn all_thread_messages(
        &self,
        channel_id: &str,
        thread_ts: &str,
    ) -> SourceResult<MessageStream>;

    async fn channel_info(&self, channel_id: &str) -> SourceResult<Channel>;

    async fn workspace_info(&self) -> SourceResult<WorkspaceInfo>;

    /// Newest recorded message timestamp per logical unit. Thread units
    /// are keyed by their thread link.
    async fn latest(&self) -> SourceResult<LatestMap>;

    /// Naming convention of attachments in this source, if it holds any.
    fn file_layout(&self) -> Option<FileLayout>;

    /// Location of a file body inside this source.
    fn file_path(&self, channel_id: &str, file: &File) -> SourceResult<String>;

    /// Location of a user's avatar inside this source.
    fn avatar_path(&self, user: &User) -> SourceResult<String>;

    /// Read the bytes at a path returned by `file_path` or `avatar_path`.
    async fn read_path(&self, path: &str) -> SourceResult<Vec<u8>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinguishes_not_supported() {
        let e = SourceError::NotSupported("avatars");
        assert!(e.is_not_supported());
        assert!(!e.is_not_found());
        let e = SourceError::NotFound("C1".into());
        assert!(e.is_not_found());
    }

    #[test]
    fn anyhow_becomes_backend() {
        let e: SourceError = anyhow::anyhow!("disk on fire").into();
        assert!(matches!(e, SourceError::Backend(ref s) if s == "disk on fire"));
    }

    #[test]
    fn kind_names() {
        for k in [
            SourceKind::Chunk,
            SourceKind::Database,
            SourceKind::Export,
            SourceKind::Dump,
        ] {
            assert_eq!(SourceKind::parse(k.as_str()), Some(k));
        }
    }
}
