//! Archive, resume and search runs: wiring the API client, a sink and the
//! controller together.
//!
//! The remote side is passed in as a [`Remote`] so the same flows run
//! against [`SlackClient`] or a fake.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Result};
use chatvault_core::entity::EntityList;
use chatvault_core::source::SourceKind;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::ApiConfig;
use crate::controller::{Controller, ControllerOptions, SearchType, Summary};
use crate::progress::{NoProgress, ProgressReporter};
use crate::resume::{self, ResumeOptions};
use crate::sink::{ChunkSink, DbSink, RecordSink};
use crate::slack_api::SlackClient;
use crate::sources::{self, LoadOptions};
use crate::sqlite_store::{SessionParams, SqliteStore};
use crate::stream::{Fetcher, Streamer};

/// API access for a run.
#[derive(Clone)]
pub struct Remote {
    pub streamer: Arc<dyn Streamer>,
    pub fetcher: Arc<dyn Fetcher>,
}

impl Remote {
    pub fn slack(config: &ApiConfig) -> Result<Self> {
        let client = Arc::new(SlackClient::new(config)?);
        Ok(Self {
            streamer: client.clone(),
            fetcher: client,
        })
    }
}

/// Progress sink and cancellation shared by a run.
#[derive(Clone)]
pub struct RunEnv {
    pub progress: Arc<dyn ProgressReporter>,
    pub cancel: CancellationToken,
}

impl Default for RunEnv {
    fn default() -> Self {
        Self {
            progress: Arc::new(NoProgress),
            cancel: CancellationToken::new(),
        }
    }
}

/// Storage flavour of an archive being written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum StoreKind {
    Chunk,
    Database,
}

/// Where a run writes.
#[derive(Debug, Clone)]
pub struct StoreSpec {
    pub kind: StoreKind,
    /// Archive directory.
    pub path: PathBuf,
    /// Database file name inside `path`.
    pub db_file: String,
    /// Invocation recorded with database sessions.
    pub args: String,
}

impl StoreSpec {
    pub fn db_path(&self) -> PathBuf {
        self.path.join(&self.db_file)
    }
}

async fn open_sink(
    store: &StoreSpec,
    mode: &str,
    opts: &ControllerOptions,
    parent_id: Option<i64>,
) -> Result<Arc<dyn RecordSink>> {
    let sink: Arc<dyn RecordSink> = match store.kind {
        StoreKind::Chunk => Arc::new(ChunkSink::create(&store.path)?),
        StoreKind::Database => {
            let params = SessionParams {
                mode: mode.to_string(),
                oldest: opts.oldest,
                latest: opts.latest,
                files: opts.files,
                avatars: opts.avatars,
                args: store.args.clone(),
                parent_id,
            };
            Arc::new(DbSink::create(&store.db_path(), &params).await?)
        }
    };
    Ok(sink)
}

/// Archive the units selected by `list` (everything when it has no
/// includes).
pub async fn archive(
    remote: &Remote,
    store: &StoreSpec,
    list: &EntityList,
    opts: ControllerOptions,
    env: &RunEnv,
) -> Result<Summary> {
    let sink = open_sink(store, "archive", &opts, None).await?;
    info!(path = %store.path.display(), kind = ?store.kind, "archiving");
    Controller::new(
        Arc::clone(&remote.streamer),
        Arc::clone(&remote.fetcher),
        sink,
        opts,
    )
    .with_progress(Arc::clone(&env.progress))
    .with_cancel(env.cancel.clone())
    .run(list)
    .await
}

/// Continue an existing archive from its checkpoints.
pub async fn resume(
    remote: &Remote,
    path: &Path,
    db_file: &str,
    args: &str,
    ropts: &ResumeOptions,
    mut opts: ControllerOptions,
    env: &RunEnv,
) -> Result<Summary> {
    let found = sources::detect(path, db_file)?;
    let (kind, root) = match found.kind {
        SourceKind::Chunk => (StoreKind::Chunk, found.path.clone()),
        SourceKind::Database => (
            StoreKind::Database,
            found
                .path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        ),
        other => bail!("cannot resume into a {} archive, only chunk or database", other),
    };
    let source = sources::load(
        path,
        &LoadOptions {
            session: None,
            db_file: Some(db_file.to_string()),
        },
    )
    .await?;
    let list = resume::plan(source.as_ref(), remote.streamer.as_ref(), ropts).await?;
    drop(source);

    if list.include_count() == 0 {
        info!("nothing to resume");
        return Ok(Summary::default());
    }

    let store_spec = StoreSpec {
        kind,
        path: root,
        db_file: found
            .path
            .file_name()
            .filter(|_| kind == StoreKind::Database)
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| db_file.to_string()),
        args: args.to_string(),
    };
    let parent_id = match kind {
        StoreKind::Database => {
            let store = SqliteStore::open(&store_spec.db_path()).await?;
            let last = store.last_finished_session().await?;
            store.close().await;
            last
        }
        StoreKind::Chunk => None,
    };

    // the plan already carries the channel list
    opts.refresh = false;
    opts.latest = ropts.latest.or(opts.latest);
    let sink = open_sink(&store_spec, "resume", &opts, parent_id).await?;
    Controller::new(
        Arc::clone(&remote.streamer),
        Arc::clone(&remote.fetcher),
        sink,
        opts,
    )
    .with_progress(Arc::clone(&env.progress))
    .with_cancel(env.cancel.clone())
    .run(&list)
    .await
}

/// Record search results for `query`.
pub async fn search(
    remote: &Remote,
    store: &StoreSpec,
    query: &str,
    kind: SearchType,
    opts: ControllerOptions,
    env: &RunEnv,
) -> Result<Summary> {
    let sink = open_sink(store, "search", &opts, None).await?;
    Controller::new(
        Arc::clone(&remote.streamer),
        Arc::clone(&remote.fetcher),
        sink,
        opts,
    )
    .with_progress(Arc::clone(&env.progress))
    .with_cancel(env.cancel.clone())
    .search(query, kind)
    .await
}
