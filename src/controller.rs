//! Ingestion controller: streams a workspace from the API into a sink.
//!
//! One controller instance drives one run through these states:
//!
//! ```text
//! Idle ──► ListingChannels ──► StreamingUnits ──► Finalizing ──► Done
//!   └────────────┴──────────────────┴─────────────────┴──────► Aborted
//! ```
//!
//! A run executes three subroutines concurrently:
//!
//! | Subroutine | Work |
//! |------------|------|
//! | `workspace` | `auth.test` identity, once per store |
//! | `users` | full user list; avatars queued for download |
//! | `conversations` | channel generator feeding a pool of `workers` unit tasks |
//!
//! Each logical unit (a channel, or a single thread given as a link) is
//! owned by one task. Its pages are written in API order; threads found in
//! a channel are archived inline, right after the page that announced
//! them. Attachments are handed to the [`DownloadPool`] and never block the
//! unit.
//!
//! # Failures
//!
//! Worker errors are sent to one aggregation queue and collected before
//! the verdict. An API error fails only its unit. A sink error is fatal:
//! the run is cancelled, in-flight units stop at their next page, and the
//! state ends in `Aborted`. Download failures are counted in
//! [`DownloadSummary`] and never fail the run.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Result};
use chatvault_core::entity::EntityList;
use chatvault_core::models::{File, Message, User};
use chatvault_core::paths;
use chatvault_core::record::{Record, RecordKind};
use chatvault_core::ts;
use chatvault_core::unit::{SlackLink, UnitId};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ArchiveConfig;
use crate::downloader::{self, DownloadPool, DownloadSummary, Downloader};
use crate::progress::{NoProgress, Phase, ProgressEvent, ProgressReporter};
use crate::sink::{RecordSink, UnitWriter};
use crate::stream::{Fetcher, Page, Streamer, Window};

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Units archived concurrently.
    pub workers: usize,
    pub files: bool,
    pub avatars: bool,
    /// List channels from the API even when the store already has a list.
    pub refresh: bool,
    /// Skip conversations the authenticated user is not a member of.
    pub member_only: bool,
    /// Default bounds for units that carry none.
    pub oldest: Option<DateTime<Utc>>,
    pub latest: Option<DateTime<Utc>>,
    pub download_workers: usize,
    pub download_queue: usize,
}

impl ControllerOptions {
    pub fn from_config(config: &ArchiveConfig) -> Self {
        Self {
            workers: config.workers,
            files: config.files,
            avatars: config.avatars,
            refresh: false,
            member_only: config.member_only,
            oldest: None,
            latest: None,
            download_workers: config.download_workers,
            download_queue: config.download_queue,
        }
    }
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self::from_config(&ArchiveConfig::default())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum State {
    #[default]
    Idle,
    ListingChannels,
    StreamingUnits,
    Finalizing,
    Done,
    Aborted,
}

/// Where in a subroutine an error happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Generate,
    Stream,
    Store,
    Finalize,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Generate => "generate",
            Stage::Stream => "stream",
            Stage::Store => "store",
            Stage::Finalize => "finalize",
        })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{subroutine} ({stage}): {error:#}")]
pub struct ControllerError {
    pub subroutine: &'static str,
    pub stage: Stage,
    pub error: anyhow::Error,
}

impl ControllerError {
    pub fn new(subroutine: &'static str, stage: Stage, error: anyhow::Error) -> Self {
        Self {
            subroutine,
            stage,
            error,
        }
    }

    /// Sink failures end the run.
    pub fn is_fatal(&self) -> bool {
        self.stage == Stage::Store
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SearchType {
    Messages,
    Files,
    All,
}

#[derive(Debug, Default)]
pub struct Summary {
    pub state: State,
    /// Logical units archived successfully.
    pub channels: u64,
    pub messages: u64,
    pub threads: u64,
    /// File metadata recorded (downloaded or not).
    pub files: u64,
    pub users: u64,
    pub downloads: DownloadSummary,
    pub errors: Vec<ControllerError>,
}

impl Summary {
    pub fn is_success(&self) -> bool {
        self.state == State::Done && self.errors.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Controller
// ═══════════════════════════════════════════════════════════════════════

pub struct Controller {
    streamer: Arc<dyn Streamer>,
    fetcher: Arc<dyn Fetcher>,
    sink: Arc<dyn RecordSink>,
    opts: Arc<ControllerOptions>,
    progress: Arc<dyn ProgressReporter>,
    cancel: CancellationToken,
    state: Mutex<State>,
}

impl Controller {
    pub fn new(
        streamer: Arc<dyn Streamer>,
        fetcher: Arc<dyn Fetcher>,
        sink: Arc<dyn RecordSink>,
        opts: ControllerOptions,
    ) -> Self {
        Self {
            streamer,
            fetcher,
            sink,
            opts: Arc::new(opts),
            progress: Arc::new(NoProgress),
            cancel: CancellationToken::new(),
            state: Mutex::new(State::Idle),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Cancelling `token` aborts the run.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn state(&self) -> State {
        self.state.lock().map(|s| *s).unwrap_or(State::Aborted)
    }

    fn set_state(&self, next: State) {
        if let Ok(mut s) = self.state.lock() {
            debug!(from = ?*s, to = ?next, "controller state");
            *s = next;
        }
    }

    fn begin(&self, first: State) -> Result<()> {
        let mut s = self
            .state
            .lock()
            .map_err(|_| anyhow!("controller state poisoned"))?;
        if *s != State::Idle {
            bail!("controller already used (state {:?})", *s);
        }
        *s = first;
        Ok(())
    }

    /// Archive every unit selected by `list`. An empty list (or one with
    /// only exclusions) means every channel.
    pub async fn run(&self, list: &EntityList) -> Result<Summary> {
        self.begin(State::ListingChannels)?;
        let (ctx, pool, errors) = self.context(self.opts.files || self.opts.avatars);

        tokio::join!(
            async {
                if let Err(e) = workspace(&ctx).await {
                    ctx.report(e.into_error("workspace"));
                }
            },
            async {
                if let Err(e) = users(&ctx).await {
                    ctx.report(e.into_error("users"));
                }
            },
            self.conversations(&ctx, list),
        );

        self.finalize(ctx, pool, errors).await
    }

    /// Record raw search result pages for `query`.
    pub async fn search(&self, query: &str, kind: SearchType) -> Result<Summary> {
        if query.trim().is_empty() {
            bail!("search query is empty");
        }
        self.begin(State::StreamingUnits)?;
        let (ctx, pool, errors) = self.context(self.opts.files);
        let want_messages = matches!(kind, SearchType::Messages | SearchType::All);
        let want_files = matches!(kind, SearchType::Files | SearchType::All);

        tokio::join!(
            async {
                if want_messages {
                    if let Err(e) = search_messages(&ctx, query).await {
                        ctx.report(e.into_error("search"));
                    }
                }
            },
            async {
                if want_files {
                    if let Err(e) = search_files(&ctx, query).await {
                        ctx.report(e.into_error("search"));
                    }
                }
            },
        );

        self.finalize(ctx, pool, errors).await
    }

    fn context(
        &self,
        downloads: bool,
    ) -> (
        Ctx,
        Option<DownloadPool>,
        mpsc::UnboundedReceiver<ControllerError>,
    ) {
        let cancel = self.cancel.child_token();
        let pool = downloads.then(|| {
            DownloadPool::start(
                Arc::clone(&self.fetcher),
                self.sink.files(),
                self.opts.download_workers,
                self.opts.download_queue,
                cancel.clone(),
            )
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = Ctx {
            streamer: Arc::clone(&self.streamer),
            sink: Arc::clone(&self.sink),
            downloads: pool.as_ref().map(DownloadPool::handle),
            opts: Arc::clone(&self.opts),
            counters: Arc::new(Counters::default()),
            errors: tx,
            cancel,
            progress: Arc::clone(&self.progress),
        };
        (ctx, pool, rx)
    }

    async fn conversations(&self, ctx: &Ctx, list: &EntityList) {
        let jobs = match generate(ctx, list).await {
            Ok(jobs) => jobs,
            Err(e) => {
                ctx.report(e.into_error("conversations"));
                return;
            }
        };
        self.set_state(State::StreamingUnits);
        info!(units = jobs.len(), workers = ctx.opts.workers, "archiving units");

        let width = ctx.opts.workers.max(1);
        let total = jobs.len() as u64;
        let done = Arc::new(AtomicU64::new(0));
        let (tx, rx) = mpsc::channel::<Job>(width);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut set = JoinSet::new();
        for _ in 0..width {
            let ctx = ctx.clone();
            let rx = Arc::clone(&rx);
            let done = Arc::clone(&done);
            set.spawn(async move {
                loop {
                    let next = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            _ = ctx.cancel.cancelled() => None,
                            job = rx.recv() => job,
                        }
                    };
                    let Some(job) = next else { break };
                    let result = if job.link.is_thread() {
                        archive_thread_unit(&ctx, &job).await
                    } else {
                        archive_channel(&ctx, &job).await
                    };
                    let n = done.fetch_add(1, Ordering::Relaxed) + 1;
                    match result {
                        Ok(stats) => {
                            ctx.counters.add(&stats);
                            info!(
                                unit = %job.link,
                                messages = stats.messages,
                                threads = stats.threads,
                                "unit archived"
                            );
                            ctx.progress.report(ProgressEvent::UnitDone {
                                phase: Phase::Archiving,
                                unit: job.link.to_string(),
                                messages: stats.messages,
                                n,
                                total,
                            });
                        }
                        Err(e) => {
                            let err = Staged {
                                stage: e.stage,
                                error: e.error.context(format!("unit {}", job.link)),
                            };
                            ctx.report(err.into_error("conversations"));
                        }
                    }
                }
            });
        }

        for job in jobs {
            tokio::select! {
                _ = ctx.cancel.cancelled() => break,
                sent = tx.send(job) => if sent.is_err() { break },
            }
        }
        drop(tx);

        while let Some(res) = set.join_next().await {
            if let Err(e) = res {
                ctx.report(ControllerError::new(
                    "conversations",
                    Stage::Stream,
                    anyhow!("unit worker panicked: {}", e),
                ));
            }
        }
    }

    async fn finalize(
        &self,
        ctx: Ctx,
        pool: Option<DownloadPool>,
        mut errors_rx: mpsc::UnboundedReceiver<ControllerError>,
    ) -> Result<Summary> {
        self.set_state(State::Finalizing);
        let cancel = ctx.cancel.clone();
        let counters = Arc::clone(&ctx.counters);
        drop(ctx);

        let downloads = match pool {
            Some(pool) => pool.finish().await,
            None => DownloadSummary::default(),
        };

        let mut errors = Vec::new();
        while let Some(e) = errors_rx.recv().await {
            errors.push(e);
        }

        let aborted = cancel.is_cancelled();
        if aborted && !errors.iter().any(ControllerError::is_fatal) {
            errors.push(ControllerError::new(
                "controller",
                Stage::Finalize,
                anyhow!("run cancelled"),
            ));
        }
        if let Err(e) = self.sink.finish(!aborted).await {
            errors.push(ControllerError::new("controller", Stage::Finalize, e));
        }

        let state = if aborted { State::Aborted } else { State::Done };
        self.set_state(state);

        let summary = Summary {
            state,
            channels: counters.channels.load(Ordering::Relaxed),
            messages: counters.messages.load(Ordering::Relaxed),
            threads: counters.threads.load(Ordering::Relaxed),
            files: counters.files.load(Ordering::Relaxed),
            users: counters.users.load(Ordering::Relaxed),
            downloads,
            errors,
        };
        info!(
            state = ?summary.state,
            units = summary.channels,
            messages = summary.messages,
            threads = summary.threads,
            files = summary.files,
            errors = summary.errors.len(),
            "run finished"
        );
        Ok(summary)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Shared run state
// ═══════════════════════════════════════════════════════════════════════

#[derive(Clone)]
struct Ctx {
    streamer: Arc<dyn Streamer>,
    sink: Arc<dyn RecordSink>,
    downloads: Option<Downloader>,
    opts: Arc<ControllerOptions>,
    counters: Arc<Counters>,
    errors: mpsc::UnboundedSender<ControllerError>,
    cancel: CancellationToken,
    progress: Arc<dyn ProgressReporter>,
}

impl Ctx {
    fn report(&self, err: ControllerError) {
        if err.is_fatal() {
            warn!(error = %err, "fatal error, cancelling run");
            self.cancel.cancel();
        } else if self.cancel.is_cancelled() {
            // Fallout of an abort already being reported.
            debug!(error = %err, "error after cancellation");
            return;
        } else {
            warn!(error = %err, "unit failed");
        }
        let _ = self.errors.send(err);
    }

    fn check_cancel(&self) -> StageResult<()> {
        if self.cancel.is_cancelled() {
            return Err(Staged::new(Stage::Stream, anyhow!("run cancelled")));
        }
        Ok(())
    }

    async fn download_files(&self, files: &[File]) {
        let Some(dl) = self.downloads.as_ref().filter(|_| self.opts.files) else {
            return;
        };
        for f in files {
            if let Some(reason) = paths::invalid_reason(f) {
                debug!(file_id = %f.id, reason, "file not downloadable");
                continue;
            }
            if f.url_private_download.is_empty() {
                debug!(file_id = %f.id, "file has no download url");
                continue;
            }
            let req = downloader::Request {
                kind: downloader::Kind::File,
                id: f.id.clone(),
                url: f.url_private_download.clone(),
                path: paths::mattermost_path(f),
            };
            if let Err(e) = dl.enqueue(req).await {
                warn!(file_id = %f.id, error = %e, "file not queued");
            }
        }
    }

    async fn download_avatars(&self, users: &[User]) {
        let Some(dl) = self.downloads.as_ref().filter(|_| self.opts.avatars) else {
            return;
        };
        for u in users {
            let Some(path) = paths::avatar_path(u) else {
                continue;
            };
            let req = downloader::Request {
                kind: downloader::Kind::Avatar,
                id: u.id.clone(),
                url: u.profile.image_original.clone(),
                path,
            };
            if let Err(e) = dl.enqueue(req).await {
                warn!(user_id = %u.id, error = %e, "avatar not queued");
            }
        }
    }
}

#[derive(Default)]
struct Counters {
    channels: AtomicU64,
    messages: AtomicU64,
    threads: AtomicU64,
    files: AtomicU64,
    users: AtomicU64,
}

impl Counters {
    fn add(&self, s: &UnitStats) {
        self.channels.fetch_add(1, Ordering::Relaxed);
        self.messages.fetch_add(s.messages, Ordering::Relaxed);
        self.threads.fetch_add(s.threads, Ordering::Relaxed);
        self.files.fetch_add(s.files, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
struct UnitStats {
    messages: u64,
    threads: u64,
    files: u64,
    /// Newest timestamp written for the unit.
    latest: Option<String>,
}

impl UnitStats {
    fn saw(&mut self, msg_ts: &str) {
        self.latest = Some(match self.latest.take() {
            Some(cur) => ts::max(&cur, msg_ts).to_string(),
            None => msg_ts.to_string(),
        });
    }
}

struct Staged {
    stage: Stage,
    error: anyhow::Error,
}

impl Staged {
    fn new(stage: Stage, error: anyhow::Error) -> Self {
        Self { stage, error }
    }

    fn into_error(self, subroutine: &'static str) -> ControllerError {
        ControllerError::new(subroutine, self.stage, self.error)
    }
}

type StageResult<T> = std::result::Result<T, Staged>;

trait AtStage<T> {
    fn stage(self, stage: Stage) -> StageResult<T>;
}

impl<T, E: Into<anyhow::Error>> AtStage<T> for std::result::Result<T, E> {
    fn stage(self, stage: Stage) -> StageResult<T> {
        self.map_err(|e| Staged::new(stage, e.into()))
    }
}

/// One logical unit to archive.
#[derive(Debug, Clone)]
struct Job {
    link: SlackLink,
    oldest: Option<DateTime<Utc>>,
    latest: Option<DateTime<Utc>>,
}

impl Job {
    /// No lower bound: nothing of this unit has been archived before.
    fn is_fresh(&self) -> bool {
        self.oldest.is_none()
    }

    fn window(&self) -> Window {
        Window::new(self.oldest, self.latest)
    }
}

async fn collect_pages<T, F, Fut>(cancel: &CancellationToken, mut next: F) -> Result<Vec<T>>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<Page<T>>>,
{
    let mut out = Vec::new();
    let mut cursor = None;
    loop {
        if cancel.is_cancelled() {
            bail!("run cancelled");
        }
        let page = next(cursor.take()).await?;
        let last = page.is_last();
        out.extend(page.items);
        if last {
            return Ok(out);
        }
        cursor = page.next_cursor;
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Subroutines
// ═══════════════════════════════════════════════════════════════════════

async fn workspace(ctx: &Ctx) -> StageResult<()> {
    if !ctx.opts.refresh && ctx.sink.has_kind(RecordKind::WorkspaceInfo).await.stage(Stage::Store)? {
        return Ok(());
    }
    let info = ctx.streamer.workspace_info().await.stage(Stage::Stream)?;
    debug!(team_id = %info.team_id, team = %info.team, "workspace");
    ctx.sink
        .write_global(Record::WorkspaceInfo { info })
        .await
        .stage(Stage::Store)
}

async fn users(ctx: &Ctx) -> StageResult<()> {
    if !ctx.opts.refresh && ctx.sink.has_kind(RecordKind::Users).await.stage(Stage::Store)? {
        debug!("users already recorded");
        return Ok(());
    }
    ctx.progress.report(ProgressEvent::Listing { what: "users" });
    let streamer = ctx.streamer.as_ref();
    let users = collect_pages(&ctx.cancel, |c| async move {
        streamer.list_users(c.as_deref()).await
    })
    .await
    .stage(Stage::Stream)?;
    if users.is_empty() {
        return Err(Staged::new(Stage::Stream, anyhow!("API returned no users")));
    }
    ctx.counters.users.store(users.len() as u64, Ordering::Relaxed);
    ctx.download_avatars(&users).await;
    ctx.sink
        .write_global(Record::Users { users })
        .await
        .stage(Stage::Store)
}

/// Turn the entity list into units: explicit includes as given, otherwise
/// every known channel minus exclusions.
async fn generate(ctx: &Ctx, list: &EntityList) -> StageResult<Vec<Job>> {
    let opts = &ctx.opts;
    if list.has_includes() {
        let mut jobs = Vec::with_capacity(list.include_count());
        for item in list.includes() {
            jobs.push(Job {
                link: item.link().stage(Stage::Generate)?,
                oldest: item.oldest.or(opts.oldest),
                latest: item.latest.or(opts.latest),
            });
        }
        return Ok(jobs);
    }

    ctx.progress.report(ProgressEvent::Listing { what: "channels" });
    let stored = if opts.refresh {
        Vec::new()
    } else {
        ctx.sink.stored_channels().await.stage(Stage::Store)?
    };
    let channels = if stored.is_empty() {
        let streamer = ctx.streamer.as_ref();
        let listed = collect_pages(&ctx.cancel, |c| async move {
            streamer.list_channels(c.as_deref()).await
        })
        .await
        .stage(Stage::Generate)?;
        ctx.sink
            .write_global(Record::Channels {
                channels: listed.clone(),
            })
            .await
            .stage(Stage::Store)?;
        listed
    } else {
        debug!(channels = stored.len(), "using stored channel list");
        stored
    };

    Ok(channels
        .into_iter()
        .filter(|c| !opts.member_only || c.is_member || c.is_im)
        .filter(|c| !list.is_excluded(&c.id))
        .map(|c| Job {
            link: SlackLink {
                channel: c.id,
                thread_ts: String::new(),
            },
            oldest: opts.oldest,
            latest: opts.latest,
        })
        .collect())
}

/// Channel metadata and members, written at the start of a fresh unit.
async fn describe(
    ctx: &Ctx,
    w: &mut dyn UnitWriter,
    channel_id: &str,
    thread_ts: &str,
) -> StageResult<()> {
    let channel = ctx
        .streamer
        .channel_info(channel_id)
        .await
        .stage(Stage::Stream)?;
    let streamer = ctx.streamer.as_ref();
    let user_ids = collect_pages(&ctx.cancel, |c| async move {
        streamer.channel_members(channel_id, c.as_deref()).await
    })
    .await
    .stage(Stage::Stream)?;
    w.write(Record::ChannelInfo {
        channel,
        thread_ts: thread_ts.to_string(),
    })
    .await
    .stage(Stage::Store)?;
    w.write(Record::ChannelUsers {
        channel_id: channel_id.to_string(),
        thread_ts: thread_ts.to_string(),
        user_ids,
    })
    .await
    .stage(Stage::Store)
}

async fn archive_channel(ctx: &Ctx, job: &Job) -> StageResult<UnitStats> {
    let channel_id = job.link.channel.as_str();
    let mut w = ctx
        .sink
        .begin_unit(&UnitId::channel(channel_id))
        .await
        .stage(Stage::Store)?;
    if job.is_fresh() {
        describe(ctx, w.as_mut(), channel_id, "").await?;
    }

    let window = job.window();
    let thread_window = Window::new(None, job.latest);
    let mut stats = UnitStats::default();
    let mut cursor: Option<String> = None;
    loop {
        ctx.check_cancel()?;
        let page = ctx
            .streamer
            .history(channel_id, &window, cursor.as_deref())
            .await
            .stage(Stage::Stream)?;
        let is_last = page.is_last();
        let Page {
            items: messages,
            next_cursor,
        } = page;

        if !messages.is_empty() || (is_last && job.is_fresh()) {
            let parents: Vec<Message> = messages
                .iter()
                .filter(|m| m.is_thread_parent())
                .cloned()
                .collect();
            let with_files: Vec<Message> = messages
                .iter()
                .filter(|m| !m.files.is_empty())
                .cloned()
                .collect();
            for m in &messages {
                stats.saw(&m.ts);
            }
            stats.messages += messages.len() as u64;

            w.write(Record::Messages {
                channel_id: channel_id.to_string(),
                is_last,
                thread_count: parents.len() as u32,
                messages,
            })
            .await
            .stage(Stage::Store)?;
            for m in with_files {
                stats.files += record_files(ctx, w.as_mut(), channel_id, m, false).await?;
            }
            for parent in parents {
                let t = archive_thread(
                    ctx,
                    w.as_mut(),
                    channel_id,
                    &parent.ts,
                    &thread_window,
                    false,
                    true,
                )
                .await?;
                stats.threads += 1;
                stats.messages += t.messages;
                stats.files += t.files;
            }
        }

        if is_last {
            break;
        }
        cursor = next_cursor;
    }

    w.commit().await.stage(Stage::Store)?;
    if let Some(latest) = &stats.latest {
        ctx.sink
            .set_checkpoint(&job.link, latest)
            .await
            .stage(Stage::Store)?;
    }
    Ok(stats)
}

/// A thread given as a link: archived alone into its own file.
async fn archive_thread_unit(ctx: &Ctx, job: &Job) -> StageResult<UnitStats> {
    let SlackLink { channel, thread_ts } = &job.link;
    let mut w = ctx
        .sink
        .begin_unit(&UnitId::thread(channel, thread_ts))
        .await
        .stage(Stage::Store)?;
    if job.is_fresh() {
        describe(ctx, w.as_mut(), channel, thread_ts).await?;
    }
    let mut stats = archive_thread(
        ctx,
        w.as_mut(),
        channel,
        thread_ts,
        &job.window(),
        true,
        job.is_fresh(),
    )
    .await?;
    stats.threads = 1;

    w.commit().await.stage(Stage::Store)?;
    if let Some(latest) = &stats.latest {
        ctx.sink
            .set_checkpoint(&job.link, latest)
            .await
            .stage(Stage::Store)?;
    }
    Ok(stats)
}

/// Page through a thread's replies. The parent arrives first on the first
/// page and is carried in every record instead of being counted.
async fn archive_thread(
    ctx: &Ctx,
    w: &mut dyn UnitWriter,
    channel_id: &str,
    thread_ts: &str,
    window: &Window,
    thread_only: bool,
    write_empty: bool,
) -> StageResult<UnitStats> {
    let mut stats = UnitStats::default();
    let mut parent: Option<Message> = None;
    let mut cursor: Option<String> = None;
    loop {
        ctx.check_cancel()?;
        let page = ctx
            .streamer
            .replies(channel_id, thread_ts, window, cursor.as_deref())
            .await
            .stage(Stage::Stream)?;
        let is_last = page.is_last();
        let Page { items, next_cursor } = page;

        let mut replies = Vec::with_capacity(items.len());
        for m in items {
            if m.ts == thread_ts {
                parent.get_or_insert(m);
            } else {
                replies.push(m);
            }
        }
        let Some(head) = parent.as_ref() else {
            return Err(Staged::new(
                Stage::Stream,
                anyhow!("thread {}:{} has no parent message", channel_id, thread_ts),
            ));
        };

        if !replies.is_empty() || (is_last && write_empty) {
            let with_files: Vec<Message> = replies
                .iter()
                .filter(|m| !m.files.is_empty())
                .cloned()
                .collect();
            for m in &replies {
                stats.saw(&m.ts);
            }
            stats.messages += replies.len() as u64;
            w.write(Record::ThreadMessages {
                channel_id: channel_id.to_string(),
                parent: head.clone(),
                is_last,
                thread_only,
                messages: replies,
            })
            .await
            .stage(Stage::Store)?;
            for m in with_files {
                stats.files += record_files(ctx, w, channel_id, m, thread_only).await?;
            }
        }

        if is_last {
            break;
        }
        cursor = next_cursor;
    }

    if thread_only {
        if let Some(head) = &parent {
            stats.saw(&head.ts);
            if write_empty && !head.files.is_empty() {
                stats.files += record_files(ctx, w, channel_id, head.clone(), true).await?;
            }
        }
    }
    Ok(stats)
}

async fn record_files(
    ctx: &Ctx,
    w: &mut dyn UnitWriter,
    channel_id: &str,
    msg: Message,
    thread_only: bool,
) -> StageResult<u64> {
    ctx.download_files(&msg.files).await;
    let files = msg.files.clone();
    let n = files.len() as u64;
    w.write(Record::Files {
        channel_id: channel_id.to_string(),
        parent: msg,
        thread_only,
        files,
    })
    .await
    .stage(Stage::Store)?;
    Ok(n)
}

async fn search_messages(ctx: &Ctx, query: &str) -> StageResult<()> {
    let mut cursor: Option<String> = None;
    loop {
        ctx.check_cancel()?;
        let page = ctx
            .streamer
            .search_messages(query, cursor.as_deref())
            .await
            .stage(Stage::Stream)?;
        let is_last = page.is_last();
        let Page {
            items: messages,
            next_cursor,
        } = page;
        ctx.counters
            .messages
            .fetch_add(messages.len() as u64, Ordering::Relaxed);
        ctx.sink
            .write_global(Record::SearchMessages {
                query: query.to_string(),
                messages,
            })
            .await
            .stage(Stage::Store)?;
        if is_last {
            return Ok(());
        }
        cursor = next_cursor;
    }
}

async fn search_files(ctx: &Ctx, query: &str) -> StageResult<()> {
    let mut cursor: Option<String> = None;
    loop {
        ctx.check_cancel()?;
        let page = ctx
            .streamer
            .search_files(query, cursor.as_deref())
            .await
            .stage(Stage::Stream)?;
        let is_last = page.is_last();
        let Page {
            items: files,
            next_cursor,
        } = page;
        ctx.counters
            .files
            .fetch_add(files.len() as u64, Ordering::Relaxed);
        ctx.download_files(&files).await;
        ctx.sink
            .write_global(Record::SearchFiles {
                query: query.to_string(),
                files,
            })
            .await
            .stage(Stage::Store)?;
        if is_last {
            return Ok(());
        }
        cursor = next_cursor;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_are_fatal() {
        let e = ControllerError::new("conversations", Stage::Store, anyhow!("disk full"));
        assert!(e.is_fatal());
        assert_eq!(e.to_string(), "conversations (store): disk full");
        let e = ControllerError::new("users", Stage::Stream, anyhow!("429"));
        assert!(!e.is_fatal());
    }

    #[test]
    fn unit_stats_track_newest() {
        let mut s = UnitStats::default();
        s.saw("1700000000.000200");
        s.saw("1700000000.000100");
        s.saw("1699999999.999999");
        assert_eq!(s.latest.as_deref(), Some("1700000000.000200"));
    }

    #[test]
    fn job_freshness() {
        let j = Job {
            link: SlackLink::parse("C1").unwrap(),
            oldest: None,
            latest: None,
        };
        assert!(j.is_fresh());
        assert_eq!(j.window(), Window::new(None, None));
    }
}
