//! Conversion engine: re-emit any source into any target.
//!
//! ```text
//!                  ┌─► channel worker 1 ─┐
//! channels() ──────┼─► channel worker 2 ─┼──► Target::write_channel
//!   (queue)        └─► channel worker N ─┘
//!                           │ copy requests
//!                           ▼
//!                      copy worker ──────┐
//! users() ──────────► avatar worker ─────┴──► FsTarget (one writer)
//!
//!              all workers joined ──► Target::write_index ──► close
//! ```
//!
//! # Steps
//!
//! 1. **Validate**: source and target set; path conventions on both sides
//!    when files are requested; the source's users resolvable and
//!    non-empty. Nothing is converted otherwise.
//! 2. **Channels**: a pool of `workers` (default 8) tasks, each converting
//!    one whole channel (threads included) before taking the next.
//! 3. **Files**: one copy worker, since a ZIP target holds one open entry
//!    at a time. Avatars are copied by a second worker; a source without
//!    avatars is skipped, not failed.
//! 4. **Index**: written only after every worker has finished.
//!
//! A failed channel does not stop the others, but any channel failure
//! marks the conversion failed. A file or avatar that cannot be copied is
//! counted and logged, never fatal.

pub mod targets;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chatvault_core::models::{Channel, File, Message, User};
use chatvault_core::paths::{self, FileLayout};
use chatvault_core::source::{MessageStream, Sourcer};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::ConvertConfig;
use crate::fsadapter::FsTarget;
use crate::progress::{NoProgress, Phase, ProgressEvent, ProgressReporter};

pub use targets::{ChannelData, Format, Index, Target, TargetSpec};

const COPY_QUEUE: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("no source to convert from")]
    NoSource,
    #[error("no target to convert to")]
    NoTarget,
    #[error("source has no users: {0}")]
    NoUsers(String),
    #[error("files requested, but the {0} has no file naming convention")]
    MissingPathFunc(&'static str),
    #[error("invalid target: {0}")]
    InvalidTarget(String),
    #[error("open target: {error:#}")]
    Target { error: anyhow::Error },
    #[error("read source: {error:#}")]
    Source { error: anyhow::Error },
    #[error("write index: {error:#}")]
    IndexWrite { error: anyhow::Error },
    #[error("conversion failed with {} error(s): {}", .errors.len(), .errors.join("; "))]
    Failed { errors: Vec<String> },
}

#[derive(Debug, Clone)]
pub struct ConvertOptions {
    pub workers: usize,
    pub files: bool,
    pub avatars: bool,
}

impl ConvertOptions {
    pub fn from_config(config: &ConvertConfig) -> Self {
        Self {
            workers: config.workers,
            files: config.files,
            avatars: config.avatars,
        }
    }
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self::from_config(&ConvertConfig::default())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopySummary {
    pub copied: u64,
    /// Invalid, empty, or already present.
    pub skipped: u64,
    /// Missing from the source or unwritable.
    pub failed: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ConvertSummary {
    pub channels: u64,
    pub messages: u64,
    pub threads: u64,
    pub files: CopySummary,
    pub avatars: CopySummary,
    /// False when avatars were requested but the source has none.
    pub avatars_supported: bool,
}

/// Convert with default progress (none).
pub async fn convert(
    source: Option<Arc<dyn Sourcer>>,
    target: Option<TargetSpec>,
    opts: &ConvertOptions,
) -> Result<ConvertSummary, ConvertError> {
    Converter::new(opts.clone()).run(source, target).await
}

pub struct Converter {
    opts: ConvertOptions,
    progress: Arc<dyn ProgressReporter>,
}

impl Converter {
    pub fn new(opts: ConvertOptions) -> Self {
        Self {
            opts,
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Validate, then open the target and convert. Nothing is written
    /// when validation fails.
    pub async fn run(
        &self,
        source: Option<Arc<dyn Sourcer>>,
        target: Option<TargetSpec>,
    ) -> Result<ConvertSummary, ConvertError> {
        let (source, dest, users) = self.validate(source, target).await?;
        let channels = source
            .channels()
            .await
            .map_err(|e| ConvertError::Source { error: e.into() })?;
        let target = dest
            .open(self.opts.files, self.opts.avatars)
            .await
            .map_err(|error| ConvertError::Target { error })?;
        info!(
            source = source.name(),
            target = target.name(),
            format = target.format().as_str(),
            channels = channels.len(),
            "converting"
        );

        let fs = target.files();
        let layout = target.file_layout().unwrap_or(FileLayout::Mattermost);

        let (copy_tx, copy_rx) = mpsc::channel::<CopyRequest>(COPY_QUEUE);
        let copier = tokio::spawn(copy_worker(
            Arc::clone(&source),
            Arc::clone(&fs),
            layout,
            copy_rx,
        ));
        let avatars = self.opts.avatars.then(|| {
            tokio::spawn(avatar_worker(
                Arc::clone(&source),
                Arc::clone(&fs),
                users.clone(),
            ))
        });

        let counters = Arc::new(Counters::default());
        let mut errors = self
            .channels(&source, &target, &channels, copy_tx, &counters)
            .await;

        let files = match copier.await {
            Ok(s) => s,
            Err(e) => {
                errors.push(format!("copy worker: {}", e));
                CopySummary::default()
            }
        };
        let (avatar_summary, avatars_supported) = match avatars {
            Some(handle) => match handle.await {
                Ok(r) => r,
                Err(e) => {
                    errors.push(format!("avatar worker: {}", e));
                    (CopySummary::default(), true)
                }
            },
            None => (CopySummary::default(), true),
        };

        let workspace = match source.workspace_info().await {
            Ok(w) => Some(w),
            Err(e) => {
                debug!(error = %e, "source has no workspace info");
                None
            }
        };
        let index = Index {
            channels,
            users,
            workspace,
        };
        target
            .write_index(&index)
            .await
            .map_err(|error| ConvertError::IndexWrite { error })?;
        target
            .close()
            .await
            .map_err(|error| ConvertError::IndexWrite { error })?;

        let summary = ConvertSummary {
            channels: counters.channels.load(Ordering::Relaxed),
            messages: counters.messages.load(Ordering::Relaxed),
            threads: counters.threads.load(Ordering::Relaxed),
            files,
            avatars: avatar_summary,
            avatars_supported,
        };
        info!(
            channels = summary.channels,
            messages = summary.messages,
            files_copied = summary.files.copied,
            files_failed = summary.files.failed,
            avatars_copied = summary.avatars.copied,
            errors = errors.len(),
            "conversion finished"
        );
        if !errors.is_empty() {
            return Err(ConvertError::Failed { errors });
        }
        Ok(summary)
    }

    async fn validate(
        &self,
        source: Option<Arc<dyn Sourcer>>,
        target: Option<TargetSpec>,
    ) -> Result<(Arc<dyn Sourcer>, TargetSpec, Vec<User>), ConvertError> {
        let source = source.ok_or(ConvertError::NoSource)?;
        let target = target.ok_or(ConvertError::NoTarget)?;
        target
            .check()
            .map_err(|e| ConvertError::InvalidTarget(e.to_string()))?;
        if self.opts.files {
            if source.file_layout().is_none() {
                return Err(ConvertError::MissingPathFunc("source"));
            }
            if target.file_layout().is_none() {
                return Err(ConvertError::MissingPathFunc("target"));
            }
        }
        let users = match source.users().await {
            Ok(u) if !u.is_empty() => u,
            Ok(_) => return Err(ConvertError::NoUsers("user list is empty".into())),
            Err(e) => return Err(ConvertError::NoUsers(e.to_string())),
        };
        Ok((source, target, users))
    }

    /// Run the channel pool; returns the error of every failed channel.
    async fn channels(
        &self,
        source: &Arc<dyn Sourcer>,
        target: &Arc<dyn Target>,
        channels: &[Channel],
        copy_tx: mpsc::Sender<CopyRequest>,
        counters: &Arc<Counters>,
    ) -> Vec<String> {
        let width = self.opts.workers.max(1);
        let total = channels.len() as u64;
        let (job_tx, job_rx) = mpsc::channel::<Channel>(width);
        let job_rx = Arc::new(tokio::sync::Mutex::new(job_rx));
        let (err_tx, mut err_rx) = mpsc::unbounded_channel::<String>();

        let mut set = JoinSet::new();
        for _ in 0..width {
            let source = Arc::clone(source);
            let target = Arc::clone(target);
            let copy_tx = self.opts.files.then(|| copy_tx.clone());
            let counters = Arc::clone(counters);
            let progress = Arc::clone(&self.progress);
            let job_rx = Arc::clone(&job_rx);
            let err_tx = err_tx.clone();
            set.spawn(async move {
                loop {
                    let next = job_rx.lock().await.recv().await;
                    let Some(channel) = next else { break };
                    match convert_channel(source.as_ref(), target.as_ref(), &channel, copy_tx.as_ref())
                        .await
                    {
                        Ok(data) => {
                            let n = counters.channels.fetch_add(1, Ordering::Relaxed) + 1;
                            let messages = data.messages.len() as u64
                                + data.threads.values().map(|(_, r)| r.len() as u64).sum::<u64>();
                            counters.messages.fetch_add(messages, Ordering::Relaxed);
                            counters
                                .threads
                                .fetch_add(data.threads.len() as u64, Ordering::Relaxed);
                            debug!(channel_id = %channel.id, messages, "channel converted");
                            progress.report(ProgressEvent::UnitDone {
                                phase: Phase::Converting,
                                unit: channel.id.clone(),
                                messages,
                                n,
                                total,
                            });
                        }
                        Err(e) => {
                            warn!(channel_id = %channel.id, error = %format!("{:#}", e), "channel failed");
                            let _ = err_tx.send(format!("{}: {:#}", channel.id, e));
                        }
                    }
                }
            });
        }
        drop(copy_tx);
        drop(err_tx);

        for c in channels {
            if job_tx.send(c.clone()).await.is_err() {
                break;
            }
        }
        drop(job_tx);

        let mut errors = Vec::new();
        while let Some(res) = set.join_next().await {
            if let Err(e) = res {
                errors.push(format!("channel worker panicked: {}", e));
            }
        }
        while let Some(e) = err_rx.recv().await {
            errors.push(e);
        }
        errors
    }
}

#[derive(Default)]
struct Counters {
    channels: AtomicU64,
    messages: AtomicU64,
    threads: AtomicU64,
}

struct CopyRequest {
    channel: Arc<Channel>,
    file: File,
}

async fn convert_channel(
    source: &dyn Sourcer,
    target: &dyn Target,
    channel: &Channel,
    copy_tx: Option<&mpsc::Sender<CopyRequest>>,
) -> Result<ChannelData> {
    let data = read_channel(source, channel).await?;
    target
        .write_channel(&data)
        .await
        .with_context(|| format!("write channel {}", channel.id))?;

    if let Some(tx) = copy_tx {
        let shared = Arc::new(channel.clone());
        let all = data
            .messages
            .iter()
            .chain(data.threads.values().flat_map(|(_, r)| r.iter()));
        for m in all {
            for f in &m.files {
                let req = CopyRequest {
                    channel: Arc::clone(&shared),
                    file: f.clone(),
                };
                tx.send(req)
                    .await
                    .map_err(|_| anyhow!("copy worker stopped"))?;
            }
        }
    }
    Ok(data)
}

/// Read a channel's timeline and threads from the source. A channel with
/// no stored messages converts to an empty timeline.
pub async fn read_channel(source: &dyn Sourcer, channel: &Channel) -> Result<ChannelData> {
    let messages = match source.all_messages(&channel.id).await {
        Ok(stream) => collect(stream)
            .await
            .with_context(|| format!("read messages of {}", channel.id))?,
        Err(e) if e.is_not_found() => {
            debug!(channel_id = %channel.id, "no messages");
            Vec::new()
        }
        Err(e) => return Err(e).with_context(|| format!("read messages of {}", channel.id)),
    };

    let mut threads = BTreeMap::new();
    for parent in messages.iter().filter(|m| m.is_thread_parent()) {
        let stream = match source.all_thread_messages(&channel.id, &parent.ts).await {
            Ok(s) => s,
            Err(e) if e.is_not_found() => {
                debug!(channel_id = %channel.id, thread_ts = %parent.ts, "thread not archived");
                continue;
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("read thread {}:{}", channel.id, parent.ts))
            }
        };
        let mut all = collect(stream)
            .await
            .with_context(|| format!("read thread {}:{}", channel.id, parent.ts))?;
        let head = match all.first() {
            Some(first) if first.ts == parent.ts => all.remove(0),
            _ => parent.clone(),
        };
        threads.insert(parent.ts.clone(), (head, all));
    }

    Ok(ChannelData {
        channel: channel.clone(),
        messages,
        threads,
    })
}

async fn collect(mut stream: MessageStream) -> Result<Vec<Message>> {
    let mut out = Vec::new();
    while let Some(m) = stream.next().await {
        out.push(m?);
    }
    Ok(out)
}

async fn copy_worker(
    source: Arc<dyn Sourcer>,
    fs: Arc<dyn FsTarget>,
    layout: FileLayout,
    mut rx: mpsc::Receiver<CopyRequest>,
) -> CopySummary {
    let mut s = CopySummary::default();
    while let Some(CopyRequest { channel, file }) = rx.recv().await {
        if let Some(reason) = paths::invalid_reason(&file) {
            debug!(file_id = %file.id, reason, "file skipped");
            s.skipped += 1;
            continue;
        }
        let from = match source.file_path(&channel.id, &file) {
            Ok(p) => p,
            Err(e) => {
                warn!(channel_id = %channel.id, file_id = %file.id, error = %e, "file missing in source");
                s.failed += 1;
                continue;
            }
        };
        let to = layout.file_path(&channel, &file);
        if fs.exists(&to).await {
            s.skipped += 1;
            continue;
        }
        copy_one(source.as_ref(), fs.as_ref(), &from, &to, &mut s).await;
    }
    s
}

async fn avatar_worker(
    source: Arc<dyn Sourcer>,
    fs: Arc<dyn FsTarget>,
    users: Vec<User>,
) -> (CopySummary, bool) {
    let mut s = CopySummary::default();
    for u in &users {
        let Some(to) = paths::avatar_path(u) else {
            continue;
        };
        let from = match source.avatar_path(u) {
            Ok(p) => p,
            Err(e) if e.is_not_supported() => {
                info!(source = source.name(), "source has no avatars, skipping");
                return (s, false);
            }
            Err(e) => {
                warn!(user_id = %u.id, error = %e, "avatar missing in source");
                s.failed += 1;
                continue;
            }
        };
        if fs.exists(&to).await {
            s.skipped += 1;
            continue;
        }
        copy_one(source.as_ref(), fs.as_ref(), &from, &to, &mut s).await;
    }
    (s, true)
}

async fn copy_one(source: &dyn Sourcer, fs: &dyn FsTarget, from: &str, to: &str, s: &mut CopySummary) {
    match source.read_path(from).await {
        Ok(bytes) if bytes.is_empty() => {
            debug!(path = from, "empty file skipped");
            s.skipped += 1;
        }
        Ok(bytes) => match fs.write_file(to, &bytes).await {
            Ok(()) => {
                s.copied += 1;
                s.bytes += bytes.len() as u64;
            }
            Err(e) => {
                warn!(path = to, error = %format!("{:#}", e), "file not written");
                s.failed += 1;
            }
        },
        Err(e) => {
            warn!(path = from, error = %e, "file not readable");
            s.failed += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_lists_every_error() {
        let e = ConvertError::Failed {
            errors: vec!["C1: boom".into(), "C2: bang".into()],
        };
        assert_eq!(
            e.to_string(),
            "conversion failed with 2 error(s): C1: boom; C2: bang"
        );
    }

    #[tokio::test]
    async fn missing_source_and_target() {
        let err = convert(None, None, &ConvertOptions::default()).await.unwrap_err();
        assert!(matches!(err, ConvertError::NoSource));
    }
}
