//! Read-only view over an archive's files, whether it is a directory or a
//! ZIP file, plus attachment resolution on top of it.

use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chatvault_core::models::{Channel, File, User};
use chatvault_core::paths::{self, FileLayout};
use chatvault_core::source::{SourceError, SourceResult};
use serde::de::DeserializeOwned;

/// A directory tree or a ZIP archive, addressed with `/`-separated
/// relative paths.
#[derive(Clone)]
pub enum SourceFs {
    Dir(PathBuf),
    Zip(Arc<ZipFs>),
}

pub struct ZipFs {
    path: PathBuf,
    names: BTreeSet<String>,
    archive: Mutex<zip::ZipArchive<fs::File>>,
}

impl SourceFs {
    pub fn open(path: &Path) -> Result<Self> {
        let meta = fs::metadata(path).with_context(|| format!("open {}", path.display()))?;
        if meta.is_dir() {
            return Ok(SourceFs::Dir(path.to_path_buf()));
        }
        let file = fs::File::open(path)?;
        let archive = zip::ZipArchive::new(file)
            .with_context(|| format!("{} is neither a directory nor a zip file", path.display()))?;
        let names = archive
            .file_names()
            .map(|n| n.trim_start_matches("./").to_string())
            .collect();
        Ok(SourceFs::Zip(Arc::new(ZipFs {
            path: path.to_path_buf(),
            names,
            archive: Mutex::new(archive),
        })))
    }

    pub fn is_zip(&self) -> bool {
        matches!(self, SourceFs::Zip(_))
    }

    pub fn location(&self) -> &Path {
        match self {
            SourceFs::Dir(p) => p,
            SourceFs::Zip(z) => &z.path,
        }
    }

    pub fn read(&self, rel: &str) -> io::Result<Vec<u8>> {
        check_rel(rel)?;
        match self {
            SourceFs::Dir(root) => fs::read(root.join(rel)),
            SourceFs::Zip(z) => {
                let mut archive = z
                    .archive
                    .lock()
                    .map_err(|_| io::Error::new(io::ErrorKind::Other, "zip reader poisoned"))?;
                let mut entry = archive.by_name(rel).map_err(|e| match e {
                    zip::result::ZipError::FileNotFound => {
                        io::Error::new(io::ErrorKind::NotFound, rel.to_string())
                    }
                    other => io::Error::new(io::ErrorKind::InvalidData, other),
                })?;
                let mut buf = Vec::with_capacity(entry.size() as usize);
                entry.read_to_end(&mut buf)?;
                Ok(buf)
            }
        }
    }

    pub fn exists(&self, rel: &str) -> bool {
        if check_rel(rel).is_err() {
            return false;
        }
        match self {
            SourceFs::Dir(root) => root.join(rel).exists(),
            SourceFs::Zip(z) => {
                z.names.contains(rel) || z.names.iter().any(|n| is_under(n, rel))
            }
        }
    }

    pub fn is_file(&self, rel: &str) -> bool {
        match self {
            SourceFs::Dir(root) => check_rel(rel).is_ok() && root.join(rel).is_file(),
            SourceFs::Zip(z) => z.names.contains(rel) && !rel.ends_with('/'),
        }
    }

    /// Size of a file, if present.
    pub fn size(&self, rel: &str) -> Option<u64> {
        match self {
            SourceFs::Dir(root) => fs::metadata(root.join(rel)).ok().map(|m| m.len()),
            SourceFs::Zip(z) => {
                let mut archive = z.archive.lock().ok()?;
                let entry = archive.by_name(rel).ok()?;
                Some(entry.size())
            }
        }
    }

    /// Immediate children of a directory (`""` for the root), sorted.
    /// Directory names carry a trailing `/`.
    pub fn list(&self, dir: &str) -> io::Result<Vec<String>> {
        let dir = dir.trim_end_matches('/');
        match self {
            SourceFs::Dir(root) => {
                let mut out = Vec::new();
                for entry in fs::read_dir(root.join(dir))? {
                    let entry = entry?;
                    let mut name = entry.file_name().to_string_lossy().to_string();
                    if entry.file_type()?.is_dir() {
                        name.push('/');
                    }
                    out.push(name);
                }
                out.sort();
                Ok(out)
            }
            SourceFs::Zip(z) => {
                let prefix = if dir.is_empty() {
                    String::new()
                } else {
                    format!("{}/", dir)
                };
                let mut out = BTreeSet::new();
                for name in z.names.iter().filter_map(|n| n.strip_prefix(&prefix)) {
                    match name.split_once('/') {
                        Some((d, _)) if !d.is_empty() => out.insert(format!("{}/", d)),
                        Some(_) => false,
                        None if !name.is_empty() => out.insert(name.to_string()),
                        None => false,
                    };
                }
                Ok(out.into_iter().collect())
            }
        }
    }
}

/// Read and decode a JSON file. A missing file is [`SourceError::NotFound`].
pub fn read_json<T: DeserializeOwned>(fs: &SourceFs, rel: &str) -> SourceResult<T> {
    let bytes = fs.read(rel).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => SourceError::NotFound(rel.to_string()),
        _ => SourceError::Io(e),
    })?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn is_under(name: &str, dir: &str) -> bool {
    let dir = dir.trim_end_matches('/');
    name.strip_prefix(dir).is_some_and(|rest| rest.starts_with('/'))
}

fn check_rel(rel: &str) -> io::Result<()> {
    let p = Path::new(rel);
    if p.is_absolute() || p.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path escapes source root: {}", rel),
        ));
    }
    Ok(())
}

/// Attachment and avatar resolution for one source.
#[derive(Clone)]
pub struct FileStorage {
    fs: SourceFs,
    layout: Option<FileLayout>,
    avatars: bool,
}

impl FileStorage {
    pub fn new(fs: SourceFs, layout: Option<FileLayout>, avatars: bool) -> Self {
        Self {
            fs,
            layout,
            avatars,
        }
    }

    /// A storage that resolves nothing.
    pub fn none(fs: SourceFs) -> Self {
        Self::new(fs, None, false)
    }

    pub fn layout(&self) -> Option<FileLayout> {
        self.layout
    }

    pub fn file_path(&self, channel: &Channel, file: &File) -> SourceResult<String> {
        let layout = self.layout.ok_or(SourceError::NotSupported("file storage"))?;
        let path = layout.file_path(channel, file);
        if self.fs.is_file(&path) {
            Ok(path)
        } else {
            Err(SourceError::NotFound(path))
        }
    }

    pub fn avatar_path(&self, user: &User) -> SourceResult<String> {
        if !self.avatars {
            return Err(SourceError::NotSupported("avatars"));
        }
        let path = paths::avatar_path(user)
            .ok_or_else(|| SourceError::NotFound(format!("avatar of {}", user.id)))?;
        if self.fs.is_file(&path) {
            Ok(path)
        } else {
            Err(SourceError::NotFound(path))
        }
    }

    pub fn fs(&self) -> &SourceFs {
        &self.fs
    }

    pub fn read(&self, path: &str) -> SourceResult<Vec<u8>> {
        self.fs.read(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => SourceError::NotFound(path.to_string()),
            _ => SourceError::Io(e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn make_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let f = fs::File::create(path).unwrap();
        let mut w = zip::ZipWriter::new(f);
        for (name, body) in entries {
            w.start_file(*name, zip::write::SimpleFileOptions::default())
                .unwrap();
            w.write_all(body).unwrap();
        }
        w.finish().unwrap();
    }

    #[test]
    fn zip_and_dir_agree() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("dir");
        fs::create_dir_all(root.join("general")).unwrap();
        fs::write(root.join("channels.json"), b"[]").unwrap();
        fs::write(root.join("general/2024-01-01.json"), b"[]").unwrap();
        let zip_path = tmp.path().join("a.zip");
        make_zip(
            &zip_path,
            &[("channels.json", b"[]"), ("general/2024-01-01.json", b"[]")],
        );

        for fs in [
            SourceFs::open(&root).unwrap(),
            SourceFs::open(&zip_path).unwrap(),
        ] {
            assert_eq!(fs.list("").unwrap(), vec!["channels.json", "general/"]);
            assert_eq!(fs.list("general").unwrap(), vec!["2024-01-01.json"]);
            assert!(fs.exists("general"));
            assert!(fs.is_file("channels.json"));
            assert!(!fs.is_file("general"));
            assert_eq!(fs.read("channels.json").unwrap(), b"[]");
            assert_eq!(
                fs.read("missing.json").unwrap_err().kind(),
                io::ErrorKind::NotFound
            );
            assert!(fs.read("../x").is_err());
        }
    }

    #[test]
    fn storage_degrades() {
        let tmp = TempDir::new().unwrap();
        let st = FileStorage::none(SourceFs::open(tmp.path()).unwrap());
        let ch = Channel {
            id: "C1".into(),
            ..Default::default()
        };
        let f = File {
            id: "F1".into(),
            name: "a.txt".into(),
            ..Default::default()
        };
        assert!(st.file_path(&ch, &f).unwrap_err().is_not_supported());
        assert!(st
            .avatar_path(&User::default())
            .unwrap_err()
            .is_not_supported());

        fs::create_dir_all(tmp.path().join("__uploads/F1")).unwrap();
        fs::write(tmp.path().join("__uploads/F1/a.txt"), b"x").unwrap();
        let st = FileStorage::new(
            SourceFs::open(tmp.path()).unwrap(),
            Some(FileLayout::Mattermost),
            false,
        );
        assert_eq!(st.file_path(&ch, &f).unwrap(), "__uploads/F1/a.txt");
        let missing = File {
            id: "F2".into(),
            name: "b.txt".into(),
            ..Default::default()
        };
        assert!(st.file_path(&ch, &missing).unwrap_err().is_not_found());
    }
}
