use std::io::{self, Cursor, Read, Seek};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;

use cairn_core::{
    checksum::crc32_checksum,
    error::{Error, Result},
    Mutation, TransactionId,
};

use super::types::*;

pub(crate) fn encode_record(
    transaction_id: TransactionId,
    timestamp_ms: u64,
    status: LogStatus,
    mutations: &[Mutation],
) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    body.write_u64::<LittleEndian>(transaction_id.0)?;
    body.write_u64::<LittleEndian>(timestamp_ms)?;
    body.write_u32::<LittleEndian>(mutations.len() as u32)?;
    for mutation in mutations {
        match mutation {
            Mutation::Put { key, payload } => {
                body.write_u8(MUTATION_PUT)?;
                write_bytes(&mut body, key.as_bytes())?;
                write_bytes(&mut body, payload)?;
            }
            Mutation::Delete { key } => {
                body.write_u8(MUTATION_DELETE)?;
                write_bytes(&mut body, key.as_bytes())?;
                write_bytes(&mut body, &[])?;
            }
        }
    }

    let total = 8 + 4 + 1 + body.len() + RECORD_TRAILER_SIZE;
    if total > MAX_RECORD_SIZE {
        return Err(Error::TransactionLog {
            message: format!("record of {} bytes exceeds the maximum", total),
        });
    }

    let mut buf = Vec::with_capacity(total);
    buf.write_u64::<LittleEndian>(LOG_BEGIN_MARKER)?;
    buf.write_u32::<LittleEndian>(total as u32)?;
    buf.write_u8(status as u8)?;
    buf.extend_from_slice(&body);
    buf.write_u32::<LittleEndian>(crc32_checksum(&body))?;
    buf.write_u64::<LittleEndian>(LOG_END_MARKER)?;
    Ok(buf)
}

fn write_bytes(buf: &mut Vec<u8>, data: &[u8]) -> io::Result<()> {
    buf.write_u32::<LittleEndian>(data.len() as u32)?;
    buf.extend_from_slice(data);
    Ok(())
}

/// Decode one record at the reader's position.
///
/// `Ok(None)` means the reader sits exactly at the end of data. A record cut
/// short by end of file is `TruncatedRecord`; any other damage is
/// `Corruption`.
pub fn read_transaction<R: Read + Seek>(reader: &mut R) -> Result<Option<LogRecord>> {
    let offset = reader.stream_position()?;
    let truncated = |e: io::Error| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Error::TruncatedRecord { offset }
        } else {
            Error::from(e)
        }
    };
    let corrupt = |details: &str| Error::Corruption {
        offset,
        details: details.to_string(),
    };

    let mut marker = [0u8; 8];
    let mut got = 0;
    while got < marker.len() {
        match reader.read(&mut marker[got..]) {
            Ok(0) => break,
            Ok(n) => got += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    if got == 0 {
        return Ok(None);
    }
    if got < marker.len() {
        return Err(Error::TruncatedRecord { offset });
    }
    if u64::from_le_bytes(marker) != LOG_BEGIN_MARKER {
        return Err(corrupt("missing begin marker"));
    }

    let length = reader.read_u32::<LittleEndian>().map_err(truncated)? as usize;
    if length < RECORD_HEADER_SIZE + RECORD_TRAILER_SIZE || length > MAX_RECORD_SIZE {
        return Err(corrupt("record length out of range"));
    }

    let mut rest = vec![0u8; length - 12];
    reader.read_exact(&mut rest).map_err(truncated)?;

    let body_end = rest.len() - RECORD_TRAILER_SIZE;
    let body = &rest[1..body_end];
    let mut trailer = &rest[body_end..];
    let crc = trailer.read_u32::<LittleEndian>()?;
    let end = trailer.read_u64::<LittleEndian>()?;
    if end != LOG_END_MARKER {
        return Err(corrupt("missing end marker"));
    }
    if crc != crc32_checksum(body) {
        return Err(corrupt("checksum mismatch"));
    }
    let status = LogStatus::try_from(rest[0]).map_err(|_| corrupt("unknown status byte"))?;

    let (transaction_id, timestamp_ms, mutations) =
        decode_body(body).map_err(|_| corrupt("malformed mutation list"))?;

    Ok(Some(LogRecord {
        offset,
        transaction_id,
        status,
        timestamp_ms,
        mutations,
        length: length as u32,
    }))
}

fn decode_body(body: &[u8]) -> io::Result<(TransactionId, u64, Vec<Mutation>)> {
    let mut cursor = Cursor::new(body);
    let transaction_id = TransactionId(cursor.read_u64::<LittleEndian>()?);
    let timestamp_ms = cursor.read_u64::<LittleEndian>()?;
    let count = cursor.read_u32::<LittleEndian>()? as usize;

    let mut mutations = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let kind = cursor.read_u8()?;
        let key = String::from_utf8(read_bytes(&mut cursor)?)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let payload = read_bytes(&mut cursor)?;
        mutations.push(match kind {
            MUTATION_PUT => Mutation::Put {
                key,
                payload: Bytes::from(payload),
            },
            MUTATION_DELETE => Mutation::Delete { key },
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "unknown mutation kind",
                ))
            }
        });
    }
    if cursor.position() as usize != body.len() {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "trailing bytes"));
    }
    Ok((transaction_id, timestamp_ms, mutations))
}

fn read_bytes(cursor: &mut Cursor<&[u8]>) -> io::Result<Vec<u8>> {
    let len = cursor.read_u32::<LittleEndian>()? as usize;
    let remaining = cursor.get_ref().len() - cursor.position() as usize;
    if len > remaining {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "field runs past record"));
    }
    let mut buf = vec![0u8; len];
    cursor.read_exact(&mut buf)?;
    Ok(buf)
}
