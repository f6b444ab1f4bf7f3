//! Attachment and avatar download pool.
//!
//! The controller enqueues requests on a bounded queue; `workers` tasks
//! take them in turn, fetch the body and write it into the target. A
//! failed download is logged and counted, never fatal. Once the pool is
//! finished every request that was accepted has been resolved.
//!
//! ```text
//! controller ──enqueue──► [bounded queue] ──► worker 1 ─┐
//!                                          ├─► worker 2 ─┼─► FsTarget
//!                                          └─► worker N ─┘
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::fsadapter::FsTarget;
use crate::stream::Fetcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    File,
    Avatar,
}

/// One body to download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub kind: Kind,
    /// File or user id, for logs.
    pub id: String,
    pub url: String,
    /// Destination, relative to the target root.
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadSummary {
    pub files: u64,
    pub avatars: u64,
    /// Already present in the target.
    pub skipped: u64,
    pub failed: u64,
    pub bytes: u64,
}

#[derive(Default)]
struct Counters {
    files: AtomicU64,
    avatars: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    bytes: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> DownloadSummary {
        DownloadSummary {
            files: self.files.load(Ordering::Relaxed),
            avatars: self.avatars.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }
}

/// Cloneable handle for enqueueing requests.
#[derive(Clone)]
pub struct Downloader {
    tx: mpsc::Sender<Request>,
}

impl Downloader {
    /// Wait for room in the queue. Fails when the pool has stopped.
    pub async fn enqueue(&self, req: Request) -> Result<()> {
        self.tx
            .send(req)
            .await
            .map_err(|_| anyhow::anyhow!("download pool is closed"))
    }
}

pub struct DownloadPool {
    tx: mpsc::Sender<Request>,
    workers: JoinSet<()>,
    counters: Arc<Counters>,
}

impl DownloadPool {
    pub fn start(
        fetcher: Arc<dyn Fetcher>,
        target: Arc<dyn FsTarget>,
        workers: usize,
        queue: usize,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<Request>(queue.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let counters = Arc::new(Counters::default());
        let mut set = JoinSet::new();
        for n in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            let fetcher = Arc::clone(&fetcher);
            let target = Arc::clone(&target);
            let counters = Arc::clone(&counters);
            let cancel = cancel.clone();
            set.spawn(async move {
                loop {
                    let next = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            _ = cancel.cancelled() => None,
                            r = rx.recv() => r,
                        }
                    };
                    let Some(req) = next else { break };
                    process(fetcher.as_ref(), target.as_ref(), &counters, req).await;
                }
                debug!(worker = n, "download worker done");
            });
        }
        Self {
            tx,
            workers: set,
            counters,
        }
    }

    pub fn handle(&self) -> Downloader {
        Downloader {
            tx: self.tx.clone(),
        }
    }

    /// Stop accepting requests and wait for the queue to drain. Handles
    /// still held elsewhere must be dropped first.
    pub async fn finish(mut self) -> DownloadSummary {
        drop(self.tx);
        while let Some(res) = self.workers.join_next().await {
            if let Err(e) = res {
                warn!(error = %e, "download worker panicked");
            }
        }
        self.counters.snapshot()
    }
}

async fn process(fetcher: &dyn Fetcher, target: &dyn FsTarget, counters: &Counters, req: Request) {
    if target.exists(&req.path).await {
        counters.skipped.fetch_add(1, Ordering::Relaxed);
        return;
    }
    match fetch_into(fetcher, target, &req).await {
        Ok(n) => {
            counters.bytes.fetch_add(n, Ordering::Relaxed);
            match req.kind {
                Kind::File => counters.files.fetch_add(1, Ordering::Relaxed),
                Kind::Avatar => counters.avatars.fetch_add(1, Ordering::Relaxed),
            };
            debug!(id = %req.id, path = %req.path, bytes = n, "downloaded");
        }
        Err(e) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(id = %req.id, url = %req.url, error = %format!("{:#}", e), "download failed");
        }
    }
}

async fn fetch_into(fetcher: &dyn Fetcher, target: &dyn FsTarget, req: &Request) -> Result<u64> {
    let body = fetcher.fetch(&req.url).await?;
    target
        .write_file(&req.path, &body)
        .await
        .with_context(|| format!("store {}", req.path))?;
    Ok(body.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsadapter::DirTarget;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct Fake;

    #[async_trait]
    impl Fetcher for Fake {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
            if url.contains("broken") {
                anyhow::bail!("404");
            }
            Ok(url.as_bytes().to_vec())
        }
    }

    fn req(kind: Kind, id: &str, url: &str) -> Request {
        Request {
            kind,
            id: id.into(),
            url: url.into(),
            path: format!("__uploads/{}/x", id),
        }
    }

    #[tokio::test]
    async fn failures_are_counted_not_fatal() {
        let tmp = TempDir::new().unwrap();
        let target = Arc::new(DirTarget::create(tmp.path()).unwrap());
        let pool = DownloadPool::start(Arc::new(Fake), target, 3, 2, CancellationToken::new());
        let h = pool.handle();
        h.enqueue(req(Kind::File, "F1", "http://x/1")).await.unwrap();
        h.enqueue(req(Kind::File, "F2", "http://x/broken")).await.unwrap();
        h.enqueue(req(Kind::Avatar, "U1", "http://x/u")).await.unwrap();
        h.enqueue(req(Kind::File, "F1", "http://x/1")).await.unwrap();
        drop(h);
        let s = pool.finish().await;
        assert_eq!(s.failed, 1);
        assert_eq!(s.files + s.avatars + s.skipped, 3);
        assert!(tmp.path().join("__uploads/F1/x").is_file());
    }
}
