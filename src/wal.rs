//! Saga Write-Ahead Log
//!
//! Append-only binary log holding every saga event. Each frame is a fixed
//! header followed by a bincode payload; the header carries a CRC32 of the
//! payload so torn or corrupted frames are detected on replay.
//!
//! # Header Layout (24 bytes, little endian)
//!
//! ```text
//! ┌────────────┬───────────┬────────────────────────────────────┐
//! │ payload_len│ 4 bytes   │ Payload size                       │
//! │ entry_type │ 1 byte    │ WalEntryType                       │
//! │ version    │ 1 byte    │ Payload format version             │
//! │ reserved   │ 2 bytes   │ Zero                               │
//! │ seq_id     │ 8 bytes   │ Monotonic sequence within the file │
//! │ checksum   │ 4 bytes   │ CRC32 of payload                   │
//! │ reserved   │ 4 bytes   │ Zero                               │
//! └────────────┴───────────┴────────────────────────────────────┘
//! ```
//!
//! On open, everything after the last intact frame is truncated. A crash
//! mid-append therefore loses at most the frame being written, which the
//! writer never acknowledged.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crc32fast::Hasher;
use tracing::warn;

/// WAL Header size in bytes
pub const WAL_HEADER_SIZE: usize = 24;

/// Upper bound for one payload; larger lengths are treated as corruption
pub const MAX_PAYLOAD_LEN: u32 = 16 * 1024 * 1024;

/// Current payload format version
pub const WAL_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalHeader {
    pub payload_len: u32,
    pub entry_type: u8,
    pub version: u8,
    pub seq_id: u64,
    pub checksum: u32,
}

impl WalHeader {
    /// Create a new header with CRC32 checksum calculated from payload
    pub fn new(entry_type: WalEntryType, seq_id: u64, payload: &[u8]) -> Self {
        Self {
            payload_len: payload.len() as u32,
            entry_type: entry_type as u8,
            version: WAL_VERSION,
            seq_id,
            checksum: crc32_checksum(payload),
        }
    }

    pub fn to_bytes(&self) -> [u8; WAL_HEADER_SIZE] {
        let mut buf = [0u8; WAL_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.payload_len.to_le_bytes());
        buf[4] = self.entry_type;
        buf[5] = self.version;
        // 6..8 reserved
        buf[8..16].copy_from_slice(&self.seq_id.to_le_bytes());
        buf[16..20].copy_from_slice(&self.checksum.to_le_bytes());
        // 20..24 reserved
        buf
    }

    pub fn from_bytes(buf: &[u8; WAL_HEADER_SIZE]) -> Self {
        Self {
            payload_len: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            entry_type: buf[4],
            version: buf[5],
            seq_id: u64::from_le_bytes([
                buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15],
            ]),
            checksum: u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]),
        }
    }

    pub fn verify_checksum(&self, payload: &[u8]) -> bool {
        self.checksum == crc32_checksum(payload)
    }
}

/// WAL entry types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalEntryType {
    SagaEvent = 1,
    /// Full compensation audit record snapshot (JSON payload)
    CompensationAudit = 2,
}

impl TryFrom<u8> for WalEntryType {
    type Error = io::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::SagaEvent),
            2 => Ok(Self::CompensationAudit),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Unknown WalEntryType: {}", value),
            )),
        }
    }
}

#[inline]
pub fn crc32_checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Frame writer
pub struct WalWriter<W: Write> {
    writer: W,
    next_seq: u64,
}

impl<W: Write> WalWriter<W> {
    pub fn new(writer: W, start_seq: u64) -> Self {
        Self {
            writer,
            next_seq: start_seq,
        }
    }

    /// Write one frame. Header and payload go out in a single write call.
    pub fn write_entry(&mut self, entry_type: WalEntryType, payload: &[u8]) -> io::Result<u64> {
        if payload.len() as u64 > MAX_PAYLOAD_LEN as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("WAL payload too large: {} bytes", payload.len()),
            ));
        }
        let seq_id = self.next_seq;
        let header = WalHeader::new(entry_type, seq_id, payload);

        let mut frame = Vec::with_capacity(WAL_HEADER_SIZE + payload.len());
        frame.extend_from_slice(&header.to_bytes());
        frame.extend_from_slice(payload);
        self.writer.write_all(&frame)?;

        self.next_seq += 1;
        Ok(seq_id)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn get_ref(&self) -> &W {
        &self.writer
    }
}

/// A single WAL entry (header + payload)
#[derive(Debug)]
pub struct WalEntry {
    pub header: WalHeader,
    pub payload: Vec<u8>,
}

/// Frame reader
///
/// Tracks the byte length of the intact prefix so a caller can truncate a
/// torn tail.
pub struct WalReader<R: Read> {
    reader: R,
    valid_len: u64,
}

impl<R: Read> WalReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            valid_len: 0,
        }
    }

    /// Read the next entry, returns None at EOF (including a partial header)
    pub fn read_entry(&mut self) -> io::Result<Option<WalEntry>> {
        let mut header_buf = [0u8; WAL_HEADER_SIZE];
        match self.reader.read_exact(&mut header_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }

        let header = WalHeader::from_bytes(&header_buf);
        if header.payload_len > MAX_PAYLOAD_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Implausible payload length {} at seq_id={}",
                    header.payload_len, header.seq_id
                ),
            ));
        }

        let mut payload = vec![0u8; header.payload_len as usize];
        self.reader.read_exact(&mut payload)?;

        if !header.verify_checksum(&payload) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "CRC32 checksum mismatch at seq_id={}, expected={}, got={}",
                    header.seq_id,
                    header.checksum,
                    crc32_checksum(&payload)
                ),
            ));
        }

        self.valid_len += (WAL_HEADER_SIZE + payload.len()) as u64;
        Ok(Some(WalEntry { header, payload }))
    }

    /// Bytes covered by entries returned so far
    pub fn valid_len(&self) -> u64 {
        self.valid_len
    }

    pub fn iter(&mut self) -> WalEntryIterator<'_, R> {
        WalEntryIterator { reader: self }
    }
}

pub struct WalEntryIterator<'a, R: Read> {
    reader: &'a mut WalReader<R>,
}

impl<R: Read> Iterator for WalEntryIterator<'_, R> {
    type Item = io::Result<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.reader.read_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

/// Open (or create) a log file for appending
///
/// Returns the intact entries in order and a writer positioned after them.
/// Anything past the last intact frame is truncated.
pub fn open_log(path: &Path) -> io::Result<(Vec<WalEntry>, WalWriter<File>)> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let mut entries = Vec::new();
    let mut valid_len = 0u64;
    if path.exists() {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = WalReader::new(BufReader::new(file));
        loop {
            match reader.read_entry() {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => break,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        offset = reader.valid_len(),
                        error = %e,
                        "Corrupted WAL frame, truncating tail"
                    );
                    break;
                }
            }
        }
        valid_len = reader.valid_len();
        if valid_len < file_len {
            warn!(
                path = %path.display(),
                dropped_bytes = file_len - valid_len,
                "Truncating torn WAL tail"
            );
        }
    }

    let mut file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)?;
    file.set_len(valid_len)?;
    file.seek(SeekFrom::Start(valid_len))?;

    let next_seq = entries.last().map(|e| e.header.seq_id + 1).unwrap_or(1);
    Ok((entries, WalWriter::new(file, next_seq)))
}
