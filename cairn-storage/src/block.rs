//! Persistent block format.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Block Layout                            │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Begin Marker      (8 bytes)                                 │
//! │  Block Length      (4 bytes)  whole block, markers included  │
//! │  Status            (1 byte)   Active / Deleted / Dirty       │
//! │  Last Txn Id       (8 bytes)                                 │
//! │  Key Length        (4 bytes)                                 │
//! │  Primary Key       (variable, UTF-8)                         │
//! │  Payload Length    (4 bytes)                                 │
//! │  Payload           (variable)                                │
//! │  CRC32             (4 bytes)  txn id + key + payload         │
//! │  End Marker        (8 bytes)                                 │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The status byte is outside the CRC so it can be flipped in place.

use std::io::{self, Read, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;

use cairn_core::checksum::crc32_parts;

pub const BEGIN_MARKER: u64 = 0xB10C_CA12_0000_0B16;
pub const END_MARKER: u64 = 0xB10C_CA12_0000_0E7D;

/// Offset of the status byte from the block start.
pub const STATUS_OFFSET: u64 = 12;
/// Bytes before the primary key.
pub const FIXED_HEADER_SIZE: usize = 8 + 4 + 1 + 8 + 4;
/// Bytes after the payload.
pub const TRAILER_SIZE: usize = 4 + 8;
/// Smallest possible block (empty key, empty payload).
pub const MIN_BLOCK_SIZE: usize = FIXED_HEADER_SIZE + 4 + TRAILER_SIZE;
/// Upper bound used to reject absurd lengths read from damaged files.
pub const MAX_BLOCK_SIZE: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BlockStatus {
    Active = 1,
    Deleted = 2,
    /// Superseded by a newer block for the same key.
    Dirty = 3,
}

impl BlockStatus {
    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            1 => Some(BlockStatus::Active),
            2 => Some(BlockStatus::Deleted),
            3 => Some(BlockStatus::Dirty),
            _ => None,
        }
    }
}

/// One record of the storage file.
#[derive(Debug, Clone)]
pub struct PersistentBlock {
    /// File offset of the begin marker.
    pub index: u64,
    pub status: BlockStatus,
    pub primary_key: String,
    pub last_transaction_id: u64,
    /// `None` after a header-only read.
    pub payload: Option<Bytes>,
    /// Declared total length.
    pub length: u32,
    valid: bool,
}

impl PersistentBlock {
    pub fn new(primary_key: impl Into<String>, payload: Bytes, last_transaction_id: u64) -> Self {
        let primary_key = primary_key.into();
        let length = encoded_len(primary_key.len(), payload.len()) as u32;
        Self {
            index: 0,
            status: BlockStatus::Active,
            primary_key,
            last_transaction_id,
            payload: Some(payload),
            length,
            valid: true,
        }
    }

    fn invalid(index: u64) -> Self {
        Self {
            index,
            status: BlockStatus::Dirty,
            primary_key: String::new(),
            last_transaction_id: 0,
            payload: None,
            length: 0,
            valid: false,
        }
    }

    /// Whether the markers, lengths and (for full reads) checksum agree.
    pub fn is_valid_block(&self) -> bool {
        self.valid
    }

    pub fn is_active(&self) -> bool {
        self.valid && self.status == BlockStatus::Active
    }

    /// Serialize into a fresh buffer.
    pub fn encode(&self) -> Vec<u8> {
        let payload: &[u8] = self.payload.as_deref().unwrap_or_default();
        let key = self.primary_key.as_bytes();
        let total = encoded_len(key.len(), payload.len());
        let txn = self.last_transaction_id.to_le_bytes();

        let mut buf = Vec::with_capacity(total);
        buf.extend_from_slice(&BEGIN_MARKER.to_le_bytes());
        buf.extend_from_slice(&(total as u32).to_le_bytes());
        buf.push(self.status as u8);
        buf.extend_from_slice(&txn);
        buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
        buf.extend_from_slice(key);
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(payload);
        buf.extend_from_slice(&crc32_parts(&[&txn, key, payload]).to_le_bytes());
        buf.extend_from_slice(&END_MARKER.to_le_bytes());
        buf
    }

    /// Write the block and return the number of bytes written.
    pub fn write(&self, writer: &mut impl Write) -> io::Result<u32> {
        let buf = self.encode();
        writer.write_all(&buf)?;
        Ok(buf.len() as u32)
    }

    /// Read one block starting at the reader's current position.
    ///
    /// Returns `Ok(None)` when the reader is exactly at end of stream. A
    /// damaged or torn block comes back with `is_valid_block() == false`;
    /// only genuine I/O failures are errors. With `header_only` the payload
    /// is skipped (and its checksum not verified) but the payload length and
    /// end marker are still checked.
    pub fn read<R: Read + Seek>(reader: &mut R, header_only: bool) -> io::Result<Option<Self>> {
        let index = reader.stream_position()?;

        let mut marker = [0u8; 8];
        let got = read_up_to(reader, &mut marker)?;
        if got == 0 {
            return Ok(None);
        }
        if got < marker.len() || u64::from_le_bytes(marker) != BEGIN_MARKER {
            return Ok(Some(Self::invalid(index)));
        }

        match Self::read_body(reader, index, header_only) {
            Ok(block) => Ok(Some(block)),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(Some(Self::invalid(index))),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => Ok(Some(Self::invalid(index))),
            Err(e) => Err(e),
        }
    }

    fn read_body<R: Read + Seek>(reader: &mut R, index: u64, header_only: bool) -> io::Result<Self> {
        let length = reader.read_u32::<LittleEndian>()?;
        if (length as usize) < MIN_BLOCK_SIZE || length as usize > MAX_BLOCK_SIZE {
            return Err(invalid_data("block length out of range"));
        }

        let status = BlockStatus::from_byte(reader.read_u8()?);
        let last_transaction_id = reader.read_u64::<LittleEndian>()?;
        let key_len = reader.read_u32::<LittleEndian>()? as usize;
        if FIXED_HEADER_SIZE + key_len + 4 + TRAILER_SIZE > length as usize {
            return Err(invalid_data("key length exceeds block"));
        }

        let mut key = vec![0u8; key_len];
        reader.read_exact(&mut key)?;
        let payload_len = reader.read_u32::<LittleEndian>()? as usize;
        if encoded_len(key_len, payload_len) != length as usize {
            return Err(invalid_data("declared length does not match contents"));
        }

        let payload = if header_only {
            reader.seek(SeekFrom::Start(
                index + (FIXED_HEADER_SIZE + key_len + 4 + payload_len) as u64,
            ))?;
            None
        } else {
            let mut payload = vec![0u8; payload_len];
            reader.read_exact(&mut payload)?;
            Some(payload)
        };

        let crc = reader.read_u32::<LittleEndian>()?;
        let end = reader.read_u64::<LittleEndian>()?;

        let mut valid = end == END_MARKER && status.is_some();
        if let Some(payload) = payload.as_deref() {
            valid &= crc == crc32_parts(&[&last_transaction_id.to_le_bytes(), &key, payload]);
        }
        let primary_key = match String::from_utf8(key) {
            Ok(key) => key,
            Err(_) => return Err(invalid_data("primary key is not UTF-8")),
        };

        Ok(Self {
            index,
            status: status.unwrap_or(BlockStatus::Dirty),
            primary_key,
            last_transaction_id,
            payload: payload.map(Bytes::from),
            length,
            valid,
        })
    }
}

/// Total encoded size for a key and payload of the given lengths.
pub fn encoded_len(key_len: usize, payload_len: usize) -> usize {
    FIXED_HEADER_SIZE + key_len + 4 + payload_len + TRAILER_SIZE
}

fn invalid_data(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.to_string())
}

/// Like `read_exact` but reports how many bytes were available before EOF.
fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
