//! Chunk directory: the on-disk root of an archive.
//!
//! ```text
//! archive/
//! ├── workspace.json.gz           sentinel, WorkspaceInfo record
//! ├── users.json.gz               Users records
//! ├── channels.json.gz            Channels records
//! ├── C0123.json.gz               channel timeline + folded threads + files
//! ├── C0123-1700000000.000100.json.gz   thread archived on its own
//! ├── search.json.gz              search result pages
//! ├── __uploads/<file id>/<name>  attachment bodies
//! └── __avatars/<user id>/<name>  avatar images
//! ```
//!
//! Writers on different units run concurrently; each unit file has a single
//! append handle behind its own lock.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use chatvault_core::record::{Record, RecordKind};
use chatvault_core::unit;
use walkdir::WalkDir;

use crate::chunkfile::{self, ChunkReader, ChunkWriter};

/// Presence and size of one record kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KindStat {
    /// Number of files holding at least one record of the kind.
    pub files: usize,
    pub records: usize,
    /// Sum of payload elements (messages, users, ...).
    pub elements: usize,
    /// Compressed size of the files the kind lives in.
    pub bytes: u64,
}

impl KindStat {
    pub fn is_present(&self) -> bool {
        self.records > 0
    }
}

pub struct Directory {
    root: PathBuf,
    writers: Mutex<HashMap<String, Arc<Mutex<ChunkWriter>>>>,
}

impl Directory {
    /// Create the root (and parents) if needed and open it for writing.
    pub fn create(path: &Path) -> Result<Self> {
        fs::create_dir_all(path)
            .with_context(|| format!("create archive directory {}", path.display()))?;
        Self::open(path)
    }

    /// Open an existing root.
    pub fn open(path: &Path) -> Result<Self> {
        let meta = fs::metadata(path)
            .with_context(|| format!("open archive directory {}", path.display()))?;
        if !meta.is_dir() {
            bail!("not a directory: {}", path.display());
        }
        Ok(Self {
            root: path.to_path_buf(),
            writers: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_of(&self, stem: &str) -> PathBuf {
        self.root.join(format!("{}{}", stem, chunkfile::EXT))
    }

    pub fn exists(&self, stem: &str) -> bool {
        self.path_of(stem).is_file()
    }

    /// The workspace sentinel marks a valid chunk directory.
    pub fn has_sentinel(&self) -> bool {
        self.exists(unit::WORKSPACE)
    }

    /// Append one record to the file of its logical unit.
    pub fn encode(&self, record: Record) -> Result<()> {
        let stem = record.file_stem();
        if stem.is_empty() {
            bail!("record of kind {} has no logical unit", record.kind().as_str());
        }
        let writer = self.writer(&stem)?;
        let mut w = writer
            .lock()
            .map_err(|_| anyhow::anyhow!("writer for {} poisoned", stem))?;
        w.write(record)
    }

    fn writer(&self, stem: &str) -> Result<Arc<Mutex<ChunkWriter>>> {
        let mut writers = self
            .writers
            .lock()
            .map_err(|_| anyhow::anyhow!("writer table poisoned"))?;
        if let Some(w) = writers.get(stem) {
            return Ok(Arc::clone(w));
        }
        let w = Arc::new(Mutex::new(ChunkWriter::append(&self.path_of(stem))?));
        writers.insert(stem.to_string(), Arc::clone(&w));
        Ok(w)
    }

    /// Replay every record of a unit in file order.
    pub fn for_each<F>(&self, stem: &str, mut f: F) -> Result<()>
    where
        F: FnMut(Record) -> Result<()>,
    {
        let path = self.path_of(stem);
        for frame in ChunkReader::open(&path)? {
            let frame = frame.with_context(|| format!("read {}", path.display()))?;
            f(frame.record)?;
        }
        Ok(())
    }

    /// All records of a unit; a missing file yields an empty list.
    pub fn records(&self, stem: &str) -> Result<Vec<Record>> {
        if !self.exists(stem) {
            return Ok(Vec::new());
        }
        chunkfile::read_all(&self.path_of(stem))
    }

    /// Stems of all chunk files, sorted. Hidden files and anything that is
    /// not a chunk file are skipped.
    pub fn stems(&self) -> Result<Vec<String>> {
        let mut stems = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(1).max_depth(1) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if name.starts_with('.') {
                continue;
            }
            if let Some(stem) = name.strip_suffix(chunkfile::EXT) {
                stems.push(stem.to_string());
            }
        }
        stems.sort();
        Ok(stems)
    }

    /// Visit every chunk file. A file that fails to decode is passed to `f`
    /// as an `Err`; the walk continues with the next file unless `f`
    /// itself returns an error.
    pub fn walk<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&str, Result<Vec<Record>>) -> Result<()>,
    {
        for stem in self.stems()? {
            let records = chunkfile::read_all(&self.path_of(&stem));
            f(&stem, records)?;
        }
        Ok(())
    }

    /// Presence and size of a record kind across the directory.
    pub fn stat(&self, kind: RecordKind) -> Result<KindStat> {
        let stems = match kind.well_known_stem() {
            Some(stem) if self.exists(stem) => vec![stem.to_string()],
            Some(_) => return Ok(KindStat::default()),
            None => self.stems()?,
        };
        let mut stat = KindStat::default();
        for stem in stems {
            let mut found = false;
            self.for_each(&stem, |rec| {
                if rec.kind() == kind {
                    found = true;
                    stat.records += 1;
                    stat.elements += rec.len();
                }
                Ok(())
            })?;
            if found {
                stat.files += 1;
                stat.bytes += fs::metadata(self.path_of(&stem))?.len();
            }
        }
        Ok(stat)
    }

    /// Completeness gate: the sentinel exists and at least one user is
    /// recorded.
    pub fn validate(&self) -> Result<()> {
        if !self.has_sentinel() {
            bail!(
                "{} is not a chunk directory: missing {}{}",
                self.root.display(),
                unit::WORKSPACE,
                chunkfile::EXT
            );
        }
        if self.stat(RecordKind::Users)?.elements == 0 {
            bail!("archive {} has no users recorded", self.root.display());
        }
        Ok(())
    }

    /// Flush and drop all open writers.
    pub fn close(&self) -> Result<()> {
        let mut writers = self
            .writers
            .lock()
            .map_err(|_| anyhow::anyhow!("writer table poisoned"))?;
        for (stem, w) in writers.drain() {
            let w = w
                .lock()
                .map_err(|_| anyhow::anyhow!("writer for {} poisoned", stem))?;
            w.sync()?;
        }
        Ok(())
    }
}
