//! Source detection and loading.
//!
//! | Container | Marker | Kind |
//! |-----------|--------|------|
//! | dir / zip | any `[CDG]*.json` at the root | dump |
//! | dir | `workspace.json.gz` or any `*.json.gz` | chunk |
//! | dir / zip | `channels.json` | export |
//! | dir | `slackdump.sqlite` | database |
//! | file | `*.sqlite` / `*.db` | database |
//!
//! Chunk directories inside a ZIP are not supported.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chatvault_core::source::{SourceKind, Sourcer};
use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::debug;

use crate::directory::Directory;
use crate::source_chunk::ChunkSource;
use crate::source_db::DatabaseSource;
use crate::source_dump::DumpSource;
use crate::source_export::ExportSource;
use crate::storage::SourceFs;

/// Default database file name inside an archive directory.
pub const DATABASE_FILE: &str = "slackdump.sqlite";

/// What a path holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detected {
    pub kind: SourceKind,
    pub zip: bool,
    /// For databases, the database file itself.
    pub path: PathBuf,
}

fn globset(patterns: &[&str]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for p in patterns {
        builder.add(Glob::new(p)?);
    }
    Ok(builder.build()?)
}

/// Identify the kind of archive at `path`.
pub fn detect(path: &Path, db_file: &str) -> Result<Detected> {
    let meta = std::fs::metadata(path).with_context(|| format!("stat {}", path.display()))?;
    if meta.is_file() {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if ext == "sqlite" || ext == "db" {
            return Ok(Detected {
                kind: SourceKind::Database,
                zip: false,
                path: path.to_path_buf(),
            });
        }
        if ext != "zip" {
            bail!("unsupported source type: {}", path.display());
        }
    }

    let fs = SourceFs::open(path)?;
    let zip = fs.is_zip();
    let root = fs.list("")?;
    let dump = globset(&["[CDG]*.json"])?;
    let chunks = globset(&["*.json.gz"])?;

    let kind = if root.iter().any(|n| dump.is_match(n)) {
        SourceKind::Dump
    } else if root.iter().any(|n| chunks.is_match(n)) {
        if zip {
            bail!("chunk archives inside a zip file are not supported: {}", path.display());
        }
        SourceKind::Chunk
    } else if root.iter().any(|n| n == "channels.json") {
        SourceKind::Export
    } else if !zip && root.iter().any(|n| n == db_file) {
        return Ok(Detected {
            kind: SourceKind::Database,
            zip,
            path: path.join(db_file),
        });
    } else {
        bail!("unsupported source type: {}", path.display());
    };
    Ok(Detected {
        kind,
        zip,
        path: path.to_path_buf(),
    })
}

/// Options for [`load`].
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Restrict a database source to one session.
    pub session: Option<i64>,
    /// Database file name inside a directory; defaults to [`DATABASE_FILE`].
    pub db_file: Option<String>,
}

/// Detect and open the archive at `path`.
pub async fn load(path: &Path, opts: &LoadOptions) -> Result<Box<dyn Sourcer>> {
    let db_file = opts.db_file.as_deref().unwrap_or(DATABASE_FILE);
    let found = detect(path, db_file)?;
    debug!(source = %path.display(), kind = %found.kind, zip = found.zip, "loading source");
    let src: Box<dyn Sourcer> = match found.kind {
        SourceKind::Chunk => {
            let dir = Directory::open(&found.path)?;
            Box::new(ChunkSource::open(Arc::new(dir))?)
        }
        SourceKind::Database => {
            Box::new(DatabaseSource::open(&found.path, opts.session).await?)
        }
        SourceKind::Export => Box::new(ExportSource::open(SourceFs::open(&found.path)?)?),
        SourceKind::Dump => Box::new(DumpSource::open(SourceFs::open(&found.path)?)?),
    };
    Ok(src)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn detects_each_kind() {
        let tmp = TempDir::new().unwrap();
        let mk = |name: &str, files: &[&str]| {
            let d = tmp.path().join(name);
            fs::create_dir_all(&d).unwrap();
            for f in files {
                fs::write(d.join(f), b"[]").unwrap();
            }
            d
        };
        let chunk = mk("chunk", &["workspace.json.gz", "C1.json.gz"]);
        let export = mk("export", &["channels.json", "users.json"]);
        let dump = mk("dump", &["C1.json", "users.json"]);
        let db = mk("db", &["slackdump.sqlite"]);
        let empty = mk("empty", &[]);

        assert_eq!(detect(&chunk, DATABASE_FILE).unwrap().kind, SourceKind::Chunk);
        assert_eq!(detect(&export, DATABASE_FILE).unwrap().kind, SourceKind::Export);
        assert_eq!(detect(&dump, DATABASE_FILE).unwrap().kind, SourceKind::Dump);
        let d = detect(&db, DATABASE_FILE).unwrap();
        assert_eq!(d.kind, SourceKind::Database);
        assert_eq!(d.path, db.join("slackdump.sqlite"));
        assert_eq!(
            detect(&db.join("slackdump.sqlite"), DATABASE_FILE).unwrap().kind,
            SourceKind::Database
        );
        assert!(detect(&empty, DATABASE_FILE).is_err());
        assert!(detect(&tmp.path().join("missing"), DATABASE_FILE).is_err());
    }

    #[test]
    fn zipped_export_detected() {
        use std::io::Write;
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("export.zip");
        let mut w = zip::ZipWriter::new(fs::File::create(&path).unwrap());
        w.start_file("channels.json", zip::write::SimpleFileOptions::default())
            .unwrap();
        w.write_all(b"[]").unwrap();
        w.finish().unwrap();
        let d = detect(&path, DATABASE_FILE).unwrap();
        assert_eq!(d.kind, SourceKind::Export);
        assert!(d.zip);
    }
}
