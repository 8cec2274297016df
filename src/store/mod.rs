//! Append-only transaction log holding every record before upload.
//!
//! A log file starts with a seven byte header (identifier, magic, version)
//! followed by the chunk stream described in [`codec`]. A store is opened
//! either for writing or for reading, never both.

pub mod codec;

use crate::domain::Record;
use codec::{ChunkReader, ChunkWriter, CodecError};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

pub const HEADER_IDENT: [u8; 4] = *b":W&B";
pub const HEADER_MAGIC: u16 = 0xBEE1;
pub const HEADER_VERSION: u8 = 0;
pub const FILE_HEADER_SIZE: usize = 7;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to open transaction log {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid transaction log header: {0}")]
    InvalidHeader(String),
    #[error("store is closed")]
    Closed,
    #[error("store is not open for {0}")]
    WrongMode(&'static str),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt transaction log: {0}")]
    Corrupt(#[source] CodecError),
    #[error("transaction log ends in the middle of a record")]
    Truncated,
    #[error("failed to encode record: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("failed to decode record: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

impl StoreError {
    /// Errors after which the next `read` resumes with later records.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StoreError::Corrupt(_) | StoreError::Truncated | StoreError::Decode(_)
        )
    }
}

impl From<CodecError> for StoreError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(e) => StoreError::Io(e),
            CodecError::Truncated => StoreError::Truncated,
            corrupt => StoreError::Corrupt(corrupt),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Write,
    Read,
}

enum StoreState {
    Writing(ChunkWriter<BufWriter<File>>),
    Reading(ChunkReader<File>),
    Closed,
}

pub struct Store {
    path: PathBuf,
    state: StoreState,
}

impl Store {
    /// Write mode creates a new file and writes the header; an existing file
    /// is never overwritten. Read mode validates the header.
    pub fn open(path: impl AsRef<Path>, mode: OpenMode) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let open_err = |source| StoreError::Open {
            path: path.clone(),
            source,
        };

        let state = match mode {
            OpenMode::Write => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent).map_err(open_err)?;
                }
                let file = OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&path)
                    .map_err(open_err)?;
                let mut out = BufWriter::new(file);
                out.write_all(&encode_header())?;
                out.flush()?;
                StoreState::Writing(ChunkWriter::new(out, FILE_HEADER_SIZE))
            }
            OpenMode::Read => {
                let mut file = File::open(&path).map_err(open_err)?;
                let mut header = [0u8; FILE_HEADER_SIZE];
                file.read_exact(&mut header).map_err(|e| {
                    if e.kind() == io::ErrorKind::UnexpectedEof {
                        StoreError::InvalidHeader("file shorter than header".into())
                    } else {
                        StoreError::Io(e)
                    }
                })?;
                verify_header(&header)?;
                StoreState::Reading(ChunkReader::new(file, FILE_HEADER_SIZE))
            }
        };

        debug!(path = %path.display(), ?mode, "Opened transaction log");
        Ok(Self { path, state })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, StoreState::Closed)
    }

    /// Appends one record and hands it to the OS before returning.
    pub fn write(&mut self, record: &Record) -> Result<(), StoreError> {
        let writer = match &mut self.state {
            StoreState::Writing(writer) => writer,
            StoreState::Reading(_) => return Err(StoreError::WrongMode("writing")),
            StoreState::Closed => return Err(StoreError::Closed),
        };

        let bytes = bincode::serde::encode_to_vec(record, bincode::config::standard())?;
        writer.write_record(&bytes)?;
        writer.flush()?;
        Ok(())
    }

    /// Returns the next record, or `Ok(None)` at end of log.
    ///
    /// A corruption error leaves the store usable: the next call skips the
    /// damaged block and continues with the records after it.
    pub fn read(&mut self) -> Result<Option<Record>, StoreError> {
        let reader = match &mut self.state {
            StoreState::Reading(reader) => reader,
            StoreState::Writing(_) => return Err(StoreError::WrongMode("reading")),
            StoreState::Closed => return Err(StoreError::Closed),
        };

        let Some(bytes) = reader.read_record()? else {
            return Ok(None);
        };
        let (record, _): (Record, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())?;
        Ok(Some(record))
    }

    /// Iterates the remaining records, yielding recoverable errors in place
    /// and stopping at end of log or at the first unrecoverable error.
    pub fn records(&mut self) -> impl Iterator<Item = Result<Record, StoreError>> + '_ {
        let mut done = false;
        std::iter::from_fn(move || next_item(&mut *self, &mut done))
    }

    /// Flushes pending writes and releases the file. Repeated calls are no-ops.
    pub fn close(&mut self) -> Result<(), StoreError> {
        match std::mem::replace(&mut self.state, StoreState::Closed) {
            StoreState::Writing(writer) => {
                let mut out = writer.into_inner();
                out.flush()?;
                out.get_ref().sync_all()?;
                debug!(path = %self.path.display(), "Closed transaction log");
                Ok(())
            }
            StoreState::Reading(_) | StoreState::Closed => Ok(()),
        }
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(path = %self.path.display(), "Failed to close transaction log: {e}");
        }
    }
}

/// Opens `path` for reading and yields every record, with recoverable
/// corruption reported in place.
pub fn peek(path: impl AsRef<Path>) -> Result<Peek, StoreError> {
    Ok(Peek {
        store: Store::open(path, OpenMode::Read)?,
        done: false,
    })
}

/// Owning iterator returned by [`peek`].
pub struct Peek {
    store: Store,
    done: bool,
}

impl Iterator for Peek {
    type Item = Result<Record, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        next_item(&mut self.store, &mut self.done)
    }
}

fn next_item(store: &mut Store, done: &mut bool) -> Option<Result<Record, StoreError>> {
    if *done {
        return None;
    }
    match store.read() {
        Ok(Some(record)) => Some(Ok(record)),
        Ok(None) => {
            *done = true;
            None
        }
        Err(err) => {
            *done = !err.is_recoverable();
            Some(Err(err))
        }
    }
}

fn encode_header() -> [u8; FILE_HEADER_SIZE] {
    let mut header = [0u8; FILE_HEADER_SIZE];
    header[..4].copy_from_slice(&HEADER_IDENT);
    header[4..6].copy_from_slice(&HEADER_MAGIC.to_le_bytes());
    header[6] = HEADER_VERSION;
    header
}

fn verify_header(header: &[u8; FILE_HEADER_SIZE]) -> Result<(), StoreError> {
    if header[..4] != HEADER_IDENT {
        return Err(StoreError::InvalidHeader(format!(
            "unknown identifier {:?}",
            String::from_utf8_lossy(&header[..4])
        )));
    }
    let magic = u16::from_le_bytes([header[4], header[5]]);
    if magic != HEADER_MAGIC {
        return Err(StoreError::InvalidHeader(format!(
            "magic {magic:#06x}, expected {HEADER_MAGIC:#06x}"
        )));
    }
    if header[6] != HEADER_VERSION {
        return Err(StoreError::InvalidHeader(format!(
            "version {}, expected {HEADER_VERSION}",
            header[6]
        )));
    }
    Ok(())
}
