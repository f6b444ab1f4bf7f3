//! Write-side filesystem targets: a plain directory or a ZIP archive.
//!
//! A ZIP file can only have one entry open for writing at a time. The ZIP
//! target therefore hands out an ownership token with every entry writer:
//! [`FsTarget::create`] acquires it, and the writer releases it when it is
//! closed or dropped. A concurrent `create` waits until then.
//!
//! ```text
//!   create("a") ──► [token held] write.. write.. close ──► [token free]
//!   create("b") ──────────── waits ──────────────────────► [token held] ...
//! ```

use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

/// An open entry. Bytes become visible under the final name on `close`.
pub trait EntryWriter: Send {
    fn write_all(&mut self, buf: &[u8]) -> Result<()>;
    fn close(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait FsTarget: Send + Sync {
    /// Where the target lives on disk.
    fn location(&self) -> &Path;

    /// Open a new entry for writing.
    async fn create(&self, rel: &str) -> Result<Box<dyn EntryWriter>>;

    /// Whether an entry was already written.
    async fn exists(&self, rel: &str) -> bool;

    /// Write a whole entry at once.
    async fn write_file(&self, rel: &str, bytes: &[u8]) -> Result<()> {
        let mut w = self.create(rel).await?;
        w.write_all(bytes)?;
        w.close()
    }

    /// Flush everything. No entry may be created afterwards.
    async fn close(&self) -> Result<()>;
}

fn check_rel(rel: &str) -> Result<()> {
    let p = Path::new(rel);
    if rel.is_empty()
        || p.is_absolute()
        || p.components().any(|c| matches!(c, Component::ParentDir))
    {
        bail!("invalid target path: {:?}", rel);
    }
    Ok(())
}

/// Open a directory or ZIP target depending on the extension of `path`.
pub fn open(path: &Path) -> Result<Arc<dyn FsTarget>> {
    let is_zip = path
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case("zip"));
    if is_zip {
        Ok(Arc::new(ZipTarget::create(path)?))
    } else {
        Ok(Arc::new(DirTarget::create(path)?))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Directory
// ═══════════════════════════════════════════════════════════════════════

pub struct DirTarget {
    root: PathBuf,
}

impl DirTarget {
    pub fn create(root: &Path) -> Result<Self> {
        fs::create_dir_all(root).with_context(|| format!("create {}", root.display()))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }
}

struct DirEntry {
    file: Option<fs::File>,
    tmp: PathBuf,
    dest: PathBuf,
}

impl EntryWriter for DirEntry {
    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        match self.file.as_mut() {
            Some(f) => f
                .write_all(buf)
                .with_context(|| format!("write {}", self.tmp.display())),
            None => bail!("entry {} already closed", self.dest.display()),
        }
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        if let Some(f) = self.file.take() {
            f.sync_data()?;
        }
        fs::rename(&self.tmp, &self.dest)
            .with_context(|| format!("rename into {}", self.dest.display()))
    }
}

impl Drop for DirEntry {
    fn drop(&mut self) {
        if self.file.is_some() {
            let _ = fs::remove_file(&self.tmp);
        }
    }
}

#[async_trait]
impl FsTarget for DirTarget {
    fn location(&self) -> &Path {
        &self.root
    }

    async fn create(&self, rel: &str) -> Result<Box<dyn EntryWriter>> {
        check_rel(rel)?;
        let dest = self.root.join(rel);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut tmp = dest.clone().into_os_string();
        tmp.push(".part");
        let tmp = PathBuf::from(tmp);
        let file = fs::File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
        Ok(Box::new(DirEntry {
            file: Some(file),
            tmp,
            dest,
        }))
    }

    async fn exists(&self, rel: &str) -> bool {
        check_rel(rel).is_ok() && self.root.join(rel).is_file()
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// ZIP
// ═══════════════════════════════════════════════════════════════════════

type SharedZip = Arc<Mutex<Option<ZipWriter<fs::File>>>>;

pub struct ZipTarget {
    path: PathBuf,
    writer: SharedZip,
    written: std::sync::Mutex<std::collections::HashSet<String>>,
}

impl ZipTarget {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file =
            fs::File::create(path).with_context(|| format!("create {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Arc::new(Mutex::new(Some(ZipWriter::new(file)))),
            written: std::sync::Mutex::new(Default::default()),
        })
    }
}

/// Holds the ownership token for as long as the entry is open.
struct ZipEntry {
    token: OwnedMutexGuard<Option<ZipWriter<fs::File>>>,
    name: String,
}

impl EntryWriter for ZipEntry {
    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        match self.token.as_mut() {
            Some(w) => w
                .write_all(buf)
                .with_context(|| format!("write zip entry {}", self.name)),
            None => bail!("zip archive already closed"),
        }
    }

    fn close(self: Box<Self>) -> Result<()> {
        // dropping the guard releases the token
        Ok(())
    }
}

#[async_trait]
impl FsTarget for ZipTarget {
    fn location(&self) -> &Path {
        &self.path
    }

    async fn create(&self, rel: &str) -> Result<Box<dyn EntryWriter>> {
        check_rel(rel)?;
        let name = rel.replace('\\', "/");
        let mut token = Arc::clone(&self.writer).lock_owned().await;
        match token.as_mut() {
            Some(w) => w
                .start_file(name.as_str(), SimpleFileOptions::default())
                .with_context(|| format!("start zip entry {}", name))?,
            None => bail!("zip archive {} already closed", self.path.display()),
        }
        if let Ok(mut written) = self.written.lock() {
            written.insert(name.clone());
        }
        Ok(Box::new(ZipEntry { token, name }))
    }

    async fn exists(&self, rel: &str) -> bool {
        self.written
            .lock()
            .map(|w| w.contains(&rel.replace('\\', "/")))
            .unwrap_or(false)
    }

    async fn close(&self) -> Result<()> {
        let mut guard = self.writer.lock().await;
        if let Some(w) = guard.take() {
            w.finish()
                .with_context(|| format!("finish {}", self.path.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn dir_target_renames_on_close() {
        let tmp = TempDir::new().unwrap();
        let t = DirTarget::create(tmp.path()).unwrap();
        let mut w = t.create("a/b.txt").await.unwrap();
        w.write_all(b"hi").unwrap();
        assert!(!t.exists("a/b.txt").await);
        w.close().unwrap();
        assert!(t.exists("a/b.txt").await);
        assert_eq!(fs::read(tmp.path().join("a/b.txt")).unwrap(), b"hi");

        let w = t.create("c.txt").await.unwrap();
        drop(w);
        assert!(!tmp.path().join("c.txt.part").exists());
        assert!(t.create("../x").await.is_err());
    }

    #[tokio::test]
    async fn zip_second_create_waits_for_close() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("out.zip");
        let t = Arc::new(ZipTarget::create(&path).unwrap());

        let mut first = t.create("one.txt").await.unwrap();
        first.write_all(b"1").unwrap();

        let t2 = Arc::clone(&t);
        let second = tokio::spawn(async move { t2.write_file("two.txt", b"2").await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished());

        first.close().unwrap();
        second.await.unwrap().unwrap();
        t.close().await.unwrap();

        let mut z = zip::ZipArchive::new(fs::File::open(&path).unwrap()).unwrap();
        let mut s = String::new();
        z.by_name("one.txt").unwrap().read_to_string(&mut s).unwrap();
        assert_eq!(s, "1");
        assert_eq!(z.len(), 2);
        assert!(t.create("three.txt").await.is_err());
    }
}
