//! Chunk file codec.
//!
//! A chunk file (`<unit>.json.gz`) is a concatenation of gzip members.
//! Each member holds exactly one JSON line: a [`Frame`] wrapping one
//! [`Record`]. Appending a record means writing one complete member with a
//! single `write_all`, so:
//!
//! - a record is either fully present or absent (a crash mid-write leaves a
//!   truncated trailing member that readers report as a decode error);
//! - a second run appends new members without touching earlier ones;
//! - a standard `zcat` shows the file as JSON lines.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chatvault_core::record::Record;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

/// File extension of chunk files.
pub const EXT: &str = ".json.gz";

/// One stored record plus the time it was recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Unix microseconds at recording time.
    #[serde(rename = "ts")]
    pub recorded_at: i64,
    #[serde(rename = "rec")]
    pub record: Record,
}

impl Frame {
    pub fn now(record: Record) -> Self {
        Self {
            recorded_at: chrono::Utc::now().timestamp_micros(),
            record,
        }
    }
}

/// Serialize a frame into one self-contained gzip member.
pub fn encode_member(frame: &Frame) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(frame)?;
    line.push(b'\n');
    let mut enc = GzEncoder::new(Vec::with_capacity(line.len() / 2), Compression::default());
    enc.write_all(&line)?;
    Ok(enc.finish()?)
}

/// Append-only writer for one chunk file. A unit has at most one writer
/// per run.
pub struct ChunkWriter {
    file: File,
    path: PathBuf,
    written: u64,
}

impl ChunkWriter {
    /// Open for append, creating the file when needed.
    pub fn append(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open chunk file {}", path.display()))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            written: 0,
        })
    }

    pub fn write(&mut self, record: Record) -> Result<()> {
        let member = encode_member(&Frame::now(record))?;
        self.file
            .write_all(&member)
            .with_context(|| format!("append to {}", self.path.display()))?;
        self.file.flush()?;
        self.written += 1;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records written through this writer.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// Streaming reader over the frames of a chunk file, in file order.
///
/// Yields `Err` once on the first undecodable frame and then stops.
pub struct ChunkReader {
    inner: Option<FrameStream>,
}

type FrameStream =
    serde_json::StreamDeserializer<'static, serde_json::de::IoRead<Box<dyn Read + Send>>, Frame>;

impl ChunkReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
        let len = file.metadata()?.len();
        Ok(Self::from_reader(file, len == 0))
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let empty = bytes.is_empty();
        Self::from_reader(std::io::Cursor::new(bytes), empty)
    }

    fn from_reader<R: Read + Send + 'static>(r: R, empty: bool) -> Self {
        if empty {
            return Self { inner: None };
        }
        let decoder: Box<dyn Read + Send> = Box::new(MultiGzDecoder::new(BufReader::new(r)));
        Self {
            inner: Some(serde_json::Deserializer::from_reader(decoder).into_iter::<Frame>()),
        }
    }
}

impl Iterator for ChunkReader {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        let stream = self.inner.as_mut()?;
        match stream.next() {
            Some(Ok(frame)) => Some(Ok(frame)),
            Some(Err(e)) => {
                self.inner = None;
                Some(Err(anyhow::Error::new(e).context("decode chunk frame")))
            }
            None => {
                self.inner = None;
                None
            }
        }
    }
}

/// Read every record of a file; fails on the first corrupt frame.
pub fn read_all(path: &Path) -> Result<Vec<Record>> {
    ChunkReader::open(path)?
        .map(|f| f.map(|f| f.record))
        .collect::<Result<Vec<_>>>()
        .with_context(|| format!("read {}", path.display()))
}
