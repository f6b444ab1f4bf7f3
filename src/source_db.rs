//! [`Sourcer`] over the relational store.
//!
//! Several sessions may hold copies of the same message (a resumed run
//! re-fetches nothing, but a refresh or a repeated archive does). Reads
//! collapse duplicates by `(channel, ts)` and keep the most recently
//! inserted row. Passing a session id restricts every read to that
//! session.

use std::path::Path;

use async_trait::async_trait;
use chatvault_core::models::{Channel, File, Message, User, WorkspaceInfo};
use chatvault_core::paths::{FileLayout, AVATARS_DIR};
use chatvault_core::record::{self, Record};
use chatvault_core::source::{
    LatestMap, MessageStream, SourceError, SourceKind, SourceResult, Sourcer,
};
use chatvault_core::ts;
use chatvault_core::unit::SlackLink;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use sqlx::Row;
use tracing::{debug, warn};

use crate::sqlite_store::SqliteStore;
use crate::storage::{FileStorage, SourceFs};

pub struct DatabaseSource {
    store: SqliteStore,
    session: Option<i64>,
    name: String,
    storage: FileStorage,
}

fn db_err(e: sqlx::Error) -> SourceError {
    SourceError::Backend(format!("database: {}", e))
}

fn decode<T: DeserializeOwned>(rows: &[sqlx::sqlite::SqliteRow]) -> SourceResult<Vec<T>> {
    rows.iter()
        .map(|r| {
            let data: String = r.get("data");
            serde_json::from_str(&data).map_err(SourceError::from)
        })
        .collect()
}

impl DatabaseSource {
    /// Open the database at `path`. Attachments and avatars are looked up
    /// next to it.
    pub async fn open(path: &Path, session: Option<i64>) -> anyhow::Result<Self> {
        let store = SqliteStore::open(path).await?;
        if let Some(id) = session {
            match store.session(id).await? {
                None => anyhow::bail!("{} has no session {}", path.display(), id),
                Some(s) if !s.finished => {
                    warn!(session = id, "session was never finished, reading partial data")
                }
                Some(_) => {}
            }
        }
        Ok(Self::new(store, session))
    }

    pub fn new(store: SqliteStore, session: Option<i64>) -> Self {
        let root = store
            .path()
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let avatars = root.join(AVATARS_DIR).is_dir();
        let storage = FileStorage::new(SourceFs::Dir(root), Some(FileLayout::Mattermost), avatars);
        Self {
            name: store.path().display().to_string(),
            store,
            session,
            storage,
        }
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    async fn messages_where(&self, filter: &str, binds: &[&str]) -> SourceResult<Vec<Message>> {
        let sql = format!(
            "SELECT m.data AS data FROM messages m WHERE m.id IN ( \
               SELECT MAX(m.id) FROM messages m JOIN records r ON r.id = m.record_id \
               WHERE {} AND (?1 IS NULL OR m.session_id = ?1) \
               GROUP BY m.channel_id, m.ts \
             ) ORDER BY m.ts_micros, m.id",
            filter
        );
        let mut q = sqlx::query(&sql).bind(self.session);
        for b in binds {
            q = q.bind(*b);
        }
        let rows = q.fetch_all(self.store.pool()).await.map_err(db_err)?;
        decode(&rows)
    }
}

#[async_trait]
impl Sourcer for DatabaseSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Database
    }

    async fn channels(&self) -> SourceResult<Vec<Channel>> {
        let rows = sqlx::query(
            "SELECT data FROM channels WHERE id IN ( \
               SELECT MAX(id) FROM channels WHERE (?1 IS NULL OR session_id = ?1) \
               GROUP BY channel_id \
             ) ORDER BY channel_id",
        )
        .bind(self.session)
        .fetch_all(self.store.pool())
        .await
        .map_err(db_err)?;
        decode(&rows)
    }

    async fn users(&self) -> SourceResult<Vec<User>> {
        let rows = sqlx::query(
            "SELECT data FROM users WHERE id IN ( \
               SELECT MAX(id) FROM users WHERE (?1 IS NULL OR session_id = ?1) \
               GROUP BY user_id \
             ) ORDER BY user_id",
        )
        .bind(self.session)
        .fetch_all(self.store.pool())
        .await
        .map_err(db_err)?;
        if rows.is_empty() {
            return Err(SourceError::NotFound("users".into()));
        }
        decode(&rows)
    }

    async fn all_messages(&self, channel_id: &str) -> SourceResult<MessageStream> {
        let msgs = self
            .messages_where("r.kind = 'messages' AND m.channel_id = ?2", &[channel_id])
            .await?;
        if msgs.is_empty() {
            return Err(SourceError::NotFound(channel_id.to_string()));
        }
        Ok(futures::stream::iter(msgs.into_iter().map(Ok)).boxed())
    }

    async fn all_thread_messages(
        &self,
        channel_id: &str,
        thread_ts: &str,
    ) -> SourceResult<MessageStream> {
        let group = record::thread_group_id(channel_id, thread_ts);
        let replies = self
            .messages_where(
                "r.kind = 'thread_messages' AND r.group_id = ?2 AND m.ts <> ?3",
                &[&group, thread_ts],
            )
            .await?;
        let parent = self
            .messages_where("m.channel_id = ?2 AND m.ts = ?3", &[channel_id, thread_ts])
            .await?;
        if replies.is_empty() && parent.is_empty() {
            return Err(SourceError::NotFound(format!("{}:{}", channel_id, thread_ts)));
        }
        let all: Vec<Message> = parent.into_iter().chain(replies).collect();
        Ok(futures::stream::iter(all.into_iter().map(Ok)).boxed())
    }

    async fn channel_info(&self, channel_id: &str) -> SourceResult<Channel> {
        let row = sqlx::query(
            "SELECT data FROM channels WHERE channel_id = ?2 AND (?1 IS NULL OR session_id = ?1) \
             ORDER BY id DESC LIMIT 1",
        )
        .bind(self.session)
        .bind(channel_id)
        .fetch_optional(self.store.pool())
        .await
        .map_err(db_err)?;
        match row {
            Some(r) => Ok(decode::<Channel>(&[r])?.remove(0)),
            None => Err(SourceError::NotFound(channel_id.to_string())),
        }
    }

    async fn workspace_info(&self) -> SourceResult<WorkspaceInfo> {
        let payload: Option<String> = sqlx::query_scalar(
            "SELECT payload FROM records WHERE kind = 'workspace_info' \
             AND (?1 IS NULL OR session_id = ?1) ORDER BY id DESC LIMIT 1",
        )
        .bind(self.session)
        .fetch_optional(self.store.pool())
        .await
        .map_err(db_err)?;
        match payload {
            Some(p) => match serde_json::from_str::<Record>(&p)? {
                Record::WorkspaceInfo { info } => Ok(info),
                _ => Err(SourceError::Backend("workspace record has wrong kind".into())),
            },
            None => Err(SourceError::NotFound("workspace info".into())),
        }
    }

    async fn latest(&self) -> SourceResult<LatestMap> {
        // SQLite returns the bare column from the row that holds the MAX.
        let rows = sqlx::query(
            "SELECT r.group_id AS group_id, m.ts AS ts, MAX(m.ts_micros) AS micros \
             FROM messages m JOIN records r ON r.id = m.record_id \
             WHERE r.kind IN ('messages', 'thread_messages') \
               AND (?1 IS NULL OR m.session_id = ?1) \
             GROUP BY r.group_id",
        )
        .bind(self.session)
        .fetch_all(self.store.pool())
        .await
        .map_err(db_err)?;

        let mut latest = LatestMap::new();
        for row in rows {
            let group: String = row.get("group_id");
            let Some((channel, thread_ts)) = record::parse_group_id(&group) else {
                continue;
            };
            latest.insert(SlackLink { channel, thread_ts }, row.get("ts"));
        }

        if self.session.is_none() {
            for (unit, cp) in self.store.checkpoints().await? {
                let link = match SlackLink::parse(&unit) {
                    Ok(l) => l,
                    Err(e) => {
                        debug!(unit = %unit, error = %e, "ignoring malformed checkpoint");
                        continue;
                    }
                };
                let entry = latest.entry(link).or_insert_with(|| cp.clone());
                if ts::sort_key(&cp) > ts::sort_key(entry) {
                    *entry = cp;
                }
            }
        }
        Ok(latest)
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

    fn avatar_path(&self, user: &User) -> SourceResult<String> {
        self.storage.avatar_path(user)
    }

    async fn read_path(&self, path: &str) -> SourceResult<Vec<u8>> {
        self.storage.read(path)
    }
}
