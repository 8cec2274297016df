//! Block-framed, checksummed chunk codec for the transaction log.
//!
//! The file is a sequence of 32 KiB blocks. Each logical record is split into
//! one or more chunks, and a chunk never crosses a block boundary:
//!
//! ```text
//! +----------+-----------+--------+-----------------+
//! | crc (4)  | length(2) | type(1)| payload (length)|
//! +----------+-----------+--------+-----------------+
//! ```
//!
//! The CRC32 (IEEE) covers the type byte followed by the payload. When fewer
//! than seven bytes remain in a block they are zero-filled and the next chunk
//! starts at the following block.
//!
//! After any read error the reader drops the rest of the current block and
//! resumes at the next FULL or FIRST chunk that validates, so one damaged
//! chunk never hides the records around it.

use std::io::{self, Read, Write};
use std::ops::Range;
use thiserror::Error;

pub const BLOCK_SIZE: usize = 32 * 1024;
pub const CHUNK_HEADER_SIZE: usize = 7;

const ZERO_PADDING: [u8; CHUNK_HEADER_SIZE] = [0; CHUNK_HEADER_SIZE];

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    Checksum { stored: u32, computed: u32 },
    #[error("malformed chunk: {0}")]
    Malformed(String),
    #[error("log ends in the middle of a record")]
    Truncated,
}

impl CodecError {
    /// Damage that the reader skips past on the next read.
    pub fn is_corruption(&self) -> bool {
        matches!(self, CodecError::Checksum { .. } | CodecError::Malformed(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChunkType {
    Full = 1,
    First = 2,
    Middle = 3,
    Last = 4,
}

impl ChunkType {
    fn for_span(first: bool, last: bool) -> Self {
        match (first, last) {
            (true, true) => ChunkType::Full,
            (true, false) => ChunkType::First,
            (false, false) => ChunkType::Middle,
            (false, true) => ChunkType::Last,
        }
    }

    fn starts_record(self) -> bool {
        matches!(self, ChunkType::Full | ChunkType::First)
    }
}

impl TryFrom<u8> for ChunkType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ChunkType::Full),
            2 => Ok(ChunkType::First),
            3 => Ok(ChunkType::Middle),
            4 => Ok(ChunkType::Last),
            other => Err(CodecError::Malformed(format!("unknown chunk type {other}"))),
        }
    }
}

fn chunk_checksum(chunk_type: u8, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[chunk_type]);
    hasher.update(payload);
    hasher.finalize()
}

/// Appends records as chunks to an underlying writer.
pub struct ChunkWriter<W: Write> {
    inner: W,
    block_offset: usize,
}

impl<W: Write> ChunkWriter<W> {
    /// `block_offset` is the number of bytes already present in the current
    /// block, e.g. the file header.
    pub fn new(inner: W, block_offset: usize) -> Self {
        Self {
            inner,
            block_offset: block_offset % BLOCK_SIZE,
        }
    }

    pub fn write_record(&mut self, payload: &[u8]) -> io::Result<()> {
        let mut rest = payload;
        let mut first = true;

        loop {
            let left = BLOCK_SIZE - self.block_offset;
            if left < CHUNK_HEADER_SIZE {
                self.inner.write_all(&ZERO_PADDING[..left])?;
                self.block_offset = 0;
            }

            let available = BLOCK_SIZE - self.block_offset - CHUNK_HEADER_SIZE;
            let take = available.min(rest.len());
            let last = take == rest.len();

            self.write_chunk(ChunkType::for_span(first, last), &rest[..take])?;
            rest = &rest[take..];
            first = false;

            if last {
                return Ok(());
            }
        }
    }

    fn write_chunk(&mut self, chunk_type: ChunkType, data: &[u8]) -> io::Result<()> {
        let kind = chunk_type as u8;
        let mut header = [0u8; CHUNK_HEADER_SIZE];
        header[..4].copy_from_slice(&chunk_checksum(kind, data).to_le_bytes());
        // Bounded by BLOCK_SIZE, which fits in u16.
        header[4..6].copy_from_slice(&(data.len() as u16).to_le_bytes());
        header[6] = kind;

        self.inner.write_all(&header)?;
        self.inner.write_all(data)?;
        self.block_offset += CHUNK_HEADER_SIZE + data.len();
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderState {
    Reading,
    /// The last read failed; the next read drops the rest of the block first.
    NeedsRecovery,
    /// Skipping damage until a record start validates.
    Recovering,
}

/// Reassembles records from chunks, recovering from damaged blocks.
pub struct ChunkReader<R: Read> {
    inner: R,
    block: Box<[u8]>,
    /// Valid bytes in `block`.
    len: usize,
    /// Start of the next chunk within `block`.
    pos: usize,
    /// Bytes at the front of the first block consumed before the reader took over.
    first_block_skip: usize,
    started: bool,
    state: ReaderState,
}

impl<R: Read> ChunkReader<R> {
    /// `skip` is the number of bytes of the first block already consumed from
    /// `inner`, e.g. the file header.
    pub fn new(inner: R, skip: usize) -> Self {
        Self {
            inner,
            block: vec![0u8; BLOCK_SIZE].into_boxed_slice(),
            len: 0,
            pos: skip,
            first_block_skip: skip,
            started: false,
            state: ReaderState::Reading,
        }
    }

    /// Returns the next record, or `None` at end of log.
    ///
    /// After an error the reader stays usable: the following call skips to
    /// the next block and continues from there.
    pub fn read_record(&mut self) -> Result<Option<Vec<u8>>, CodecError> {
        if self.state == ReaderState::NeedsRecovery {
            self.pos = self.len;
            self.state = ReaderState::Recovering;
        }

        let result = self.assemble_record();
        if result.is_err() {
            self.state = ReaderState::NeedsRecovery;
        }
        result
    }

    fn assemble_record(&mut self) -> Result<Option<Vec<u8>>, CodecError> {
        let Some((chunk_type, range)) = self.next_chunk(true)? else {
            return Ok(None);
        };

        let mut record = self.block[range].to_vec();
        if chunk_type == ChunkType::Full {
            return Ok(Some(record));
        }

        loop {
            match self.next_chunk(false)? {
                None => return Err(CodecError::Truncated),
                Some((ChunkType::Middle, range)) => record.extend_from_slice(&self.block[range]),
                Some((ChunkType::Last, range)) => {
                    record.extend_from_slice(&self.block[range]);
                    return Ok(Some(record));
                }
                Some((other, _)) => {
                    return Err(CodecError::Malformed(format!(
                        "{other:?} chunk inside an unfinished record"
                    )));
                }
            }
        }
    }

    fn next_chunk(
        &mut self,
        want_first: bool,
    ) -> Result<Option<(ChunkType, Range<usize>)>, CodecError> {
        loop {
            if self.pos + CHUNK_HEADER_SIZE <= self.len {
                match self.decode_chunk(want_first)? {
                    Some(chunk) => return Ok(Some(chunk)),
                    None => continue,
                }
            }

            if self.started && self.len < BLOCK_SIZE {
                // Short block: the log ends here.
                if self.pos < self.len {
                    return Err(CodecError::Truncated);
                }
                return Ok(None);
            }

            self.fill_block()?;
        }
    }

    /// Decodes the chunk at `pos`. `Ok(None)` means the chunk was skipped.
    fn decode_chunk(
        &mut self,
        want_first: bool,
    ) -> Result<Option<(ChunkType, Range<usize>)>, CodecError> {
        let recovering = self.state == ReaderState::Recovering;
        let header = &self.block[self.pos..self.pos + CHUNK_HEADER_SIZE];
        let stored = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let length = u16::from_le_bytes([header[4], header[5]]) as usize;
        let kind = header[6];

        if stored == 0 && length == 0 && kind == 0 {
            // Zero fill from a writer that never finished this block.
            if want_first || recovering {
                self.pos = self.len;
                return Ok(None);
            }
            return Err(CodecError::Malformed("zeroed chunk inside a record".into()));
        }

        let start = self.pos + CHUNK_HEADER_SIZE;
        let end = start + length;
        if end > self.len {
            if recovering {
                self.pos = self.len;
                return Ok(None);
            }
            return Err(CodecError::Malformed(format!(
                "chunk length {length} overflows block"
            )));
        }

        let computed = chunk_checksum(kind, &self.block[start..end]);
        if computed != stored {
            if recovering {
                self.pos = self.len;
                return Ok(None);
            }
            // Leave `pos` on the bad chunk; recovery drops the whole block.
            return Err(CodecError::Checksum { stored, computed });
        }

        let chunk_type = match ChunkType::try_from(kind) {
            Ok(chunk_type) => chunk_type,
            Err(_) if recovering => {
                self.pos = self.len;
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        self.pos = if end + CHUNK_HEADER_SIZE <= BLOCK_SIZE {
            end
        } else {
            BLOCK_SIZE
        };

        if want_first && !chunk_type.starts_record() {
            // Tail of a record whose start was lost.
            return Ok(None);
        }

        self.state = ReaderState::Reading;
        Ok(Some((chunk_type, start..end)))
    }

    fn fill_block(&mut self) -> io::Result<()> {
        let offset = if self.started {
            self.pos = self.pos.saturating_sub(self.len);
            0
        } else {
            self.first_block_skip
        };

        let read = read_full(&mut self.inner, &mut self.block[offset..])?;
        self.len = offset + read;
        self.started = true;
        Ok(())
    }
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn encode(records: &[Vec<u8>], skip: usize) -> Vec<u8> {
        let mut writer = ChunkWriter::new(vec![0xAB; skip], skip);
        for record in records {
            writer.write_record(record).unwrap();
        }
        writer.into_inner()
    }

    fn reader(bytes: Vec<u8>, skip: usize) -> ChunkReader<Cursor<Vec<u8>>> {
        let mut cursor = Cursor::new(bytes);
        cursor.set_position(skip as u64);
        ChunkReader::new(cursor, skip)
    }

    fn drain(reader: &mut ChunkReader<Cursor<Vec<u8>>>) -> Vec<Result<Vec<u8>, String>> {
        let mut out = Vec::new();
        for _ in 0..64 {
            match reader.read_record() {
                Ok(Some(record)) => out.push(Ok(record)),
                Ok(None) => return out,
                Err(e) => out.push(Err(e.to_string())),
            }
        }
        panic!("reader did not reach end of log");
    }

    #[test]
    fn small_records_use_full_chunks() {
        let bytes = encode(&[b"abc".to_vec()], 0);
        assert_eq!(bytes.len(), CHUNK_HEADER_SIZE + 3);
        assert_eq!(bytes[6], ChunkType::Full as u8);
        assert_eq!(u16::from_le_bytes([bytes[4], bytes[5]]), 3);
        let crc = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(crc, chunk_checksum(1, b"abc"));
    }

    #[test]
    fn empty_record_round_trips() {
        let bytes = encode(&[Vec::new(), b"x".to_vec()], 7);
        let mut reader = reader(bytes, 7);
        assert_eq!(reader.read_record().unwrap(), Some(Vec::new()));
        assert_eq!(reader.read_record().unwrap(), Some(b"x".to_vec()));
        assert_eq!(reader.read_record().unwrap(), None);
    }

    #[test]
    fn large_record_spans_blocks() {
        let big: Vec<u8> = (0..BLOCK_SIZE * 3).map(|i| (i % 251) as u8).collect();
        let bytes = encode(&[big.clone(), b"after".to_vec()], 7);
        // First, two middles, last.
        assert!(bytes.len() > BLOCK_SIZE * 3);
        assert_eq!(bytes[7 + 6], ChunkType::First as u8);
        assert_eq!(bytes[BLOCK_SIZE + 6], ChunkType::Middle as u8);

        let mut reader = reader(bytes, 7);
        assert_eq!(reader.read_record().unwrap(), Some(big));
        assert_eq!(reader.read_record().unwrap(), Some(b"after".to_vec()));
        assert_eq!(reader.read_record().unwrap(), None);
    }

    #[test]
    fn block_tail_shorter_than_header_is_zero_padded() {
        // Leaves exactly 3 bytes at the end of block 0.
        let first_len = BLOCK_SIZE - 7 - CHUNK_HEADER_SIZE - 3;
        let bytes = encode(&[vec![1u8; first_len], b"next".to_vec()], 7);
        assert_eq!(&bytes[BLOCK_SIZE - 3..BLOCK_SIZE], &[0, 0, 0]);
        assert_eq!(bytes[BLOCK_SIZE + 6], ChunkType::Full as u8);

        let mut reader = reader(bytes, 7);
        assert_eq!(reader.read_record().unwrap().map(|r| r.len()), Some(first_len));
        assert_eq!(reader.read_record().unwrap(), Some(b"next".to_vec()));
        assert_eq!(reader.read_record().unwrap(), None);
    }

    #[test]
    fn checksum_failure_then_recovery_at_next_block() {
        let a = b"record-a".to_vec();
        let filler = vec![7u8; BLOCK_SIZE];
        let b = b"record-b".to_vec();
        let mut bytes = encode(&[a.clone(), filler, b.clone()], 7);

        // Damage the filler's first chunk, which sits right after A in block 0.
        let filler_payload = 7 + CHUNK_HEADER_SIZE + a.len() + CHUNK_HEADER_SIZE;
        bytes[filler_payload + 10] ^= 0xFF;

        let mut reader = reader(bytes, 7);
        assert_eq!(reader.read_record().unwrap(), Some(a));
        let err = reader.read_record().unwrap_err();
        assert!(matches!(err, CodecError::Checksum { .. }), "{err}");
        assert!(err.is_corruption());
        // The filler's last chunk opens block 1 and is skipped as an orphan.
        assert_eq!(reader.read_record().unwrap(), Some(b));
        assert_eq!(reader.read_record().unwrap(), None);
    }

    #[test]
    fn zeroed_tail_is_treated_as_end_of_block() {
        let mut bytes = encode(&[b"only".to_vec()], 0);
        bytes.extend_from_slice(&[0u8; 64]);
        let mut reader = reader(bytes, 0);
        assert_eq!(reader.read_record().unwrap(), Some(b"only".to_vec()));
        assert_eq!(reader.read_record().unwrap(), None);
    }

    #[test]
    fn partial_trailing_chunk_is_reported_then_ends() {
        let mut bytes = encode(&[b"whole".to_vec(), b"cut short".to_vec()], 0);
        bytes.truncate(bytes.len() - 4);
        let mut reader = reader(bytes, 0);
        assert_eq!(reader.read_record().unwrap(), Some(b"whole".to_vec()));
        assert!(reader.read_record().is_err());
        assert_eq!(reader.read_record().unwrap(), None);
    }

    #[test]
    fn record_missing_its_last_chunk_is_truncated() {
        let big = vec![3u8; BLOCK_SIZE + 100];
        let mut bytes = encode(&[big], 0);
        bytes.truncate(BLOCK_SIZE);
        let mut reader = reader(bytes, 0);
        assert!(matches!(reader.read_record(), Err(CodecError::Truncated)));
        assert_eq!(reader.read_record().unwrap(), None);
    }

    #[test]
    fn unknown_chunk_type_is_malformed() {
        let mut bytes = encode(&[b"abc".to_vec()], 0);
        bytes[6] = 9;
        let crc = chunk_checksum(9, b"abc");
        bytes[..4].copy_from_slice(&crc.to_le_bytes());
        let results = drain(&mut reader(bytes, 0));
        assert_eq!(results.len(), 1);
        assert!(results[0].as_ref().unwrap_err().contains("unknown chunk type"));
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn records_round_trip_in_order(
                records in proptest::collection::vec(
                    proptest::collection::vec(any::<u8>(), 0..(BLOCK_SIZE * 2)),
                    0..12,
                )
            ) {
                let bytes = encode(&records, 7);
                let mut reader = reader(bytes, 7);
                for expected in &records {
                    let got = reader.read_record().unwrap();
                    prop_assert_eq!(got.as_ref(), Some(expected));
                }
                prop_assert_eq!(reader.read_record().unwrap(), None);
            }

            #[test]
            fn single_byte_damage_never_panics_or_invents_records(
                sizes in proptest::collection::vec(0usize..5_000, 1..20),
                position in any::<proptest::sample::Index>(),
                flip in 1u8..=255,
            ) {
                let records: Vec<Vec<u8>> = sizes
                    .iter()
                    .enumerate()
                    .map(|(i, len)| vec![i as u8; *len])
                    .collect();
                let mut bytes = encode(&records, 7);
                let at = 7 + position.index(bytes.len() - 7);
                bytes[at] ^= flip;

                let mut reader = reader(bytes, 7);
                let mut recovered = Vec::new();
                let mut finished = false;
                for _ in 0..(records.len() * 4 + 8) {
                    match reader.read_record() {
                        Ok(Some(record)) => recovered.push(record),
                        Ok(None) => {
                            finished = true;
                            break;
                        }
                        Err(_) => {}
                    }
                }
                prop_assert!(finished);
                prop_assert!(recovered.len() <= records.len());
                // Every record that survives is one that was written.
                for record in &recovered {
                    prop_assert!(records.contains(record));
                }
            }
        }
    }
}
