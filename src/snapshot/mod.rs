//! Snapshot payload sent by a master during a full resynchronization.
//!
//! The payload uses the RDB layout: a `REDIS` magic string and a four digit
//! version, followed by opcodes and string entries, terminated by `0xFF` and an
//! 8 byte checksum. Only string values are understood.

mod encoding;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::{Error, LResult};
use encoding::{put_length, put_string, Reader};

const MAGIC: &[u8] = b"REDIS";
const VERSION: &[u8] = b"0011";

const OPCODE_AUX: u8 = 0xFA;
const OPCODE_RESIZE_DB: u8 = 0xFB;
const OPCODE_EXPIRE_MS: u8 = 0xFC;
const OPCODE_EXPIRE_SECS: u8 = 0xFD;
const OPCODE_SELECT_DB: u8 = 0xFE;
const OPCODE_EOF: u8 = 0xFF;
const TYPE_STRING: u8 = 0x00;

/// A single key carried by a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: String,
    pub value: Bytes,
    /// Absolute expiration as unix time in milliseconds.
    pub expires_at_ms: Option<u64>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub version: u32,
    /// Auxiliary fields such as `redis-ver`, in payload order.
    pub aux: Vec<(String, String)>,
    pub entries: Vec<Entry>,
    /// Stored but never verified.
    pub checksum: Option<[u8; 8]>,
}

/// Decode a snapshot payload. An empty payload is an empty key space.
pub fn parse(payload: &[u8]) -> LResult<Snapshot> {
    let mut snapshot = Snapshot::default();
    if payload.is_empty() {
        return Ok(snapshot);
    }

    let mut reader = Reader::new(payload);
    if reader.take(MAGIC.len())? != MAGIC {
        return Err(Error::Snapshot("missing REDIS magic string".into()));
    }
    snapshot.version = atoi::atoi::<u32>(reader.take(4)?)
        .ok_or_else(|| Error::Snapshot("invalid version".into()))?;

    let mut expires_at_ms = None;
    loop {
        if reader.remaining() == 0 {
            return Err(Error::Snapshot("missing end of file marker".into()));
        }
        match reader.u8()? {
            OPCODE_AUX => {
                let key = reader.string()?;
                let value = reader.string()?;
                snapshot.aux.push((
                    String::from_utf8_lossy(&key).into_owned(),
                    String::from_utf8_lossy(&value).into_owned(),
                ));
            }
            OPCODE_SELECT_DB => {
                let db = reader.length_value()?;
                debug!(db, "snapshot selects database");
            }
            OPCODE_RESIZE_DB => {
                let keys = reader.length_value()?;
                let expires = reader.length_value()?;
                debug!(keys, expires, "snapshot resize hint");
            }
            OPCODE_EXPIRE_SECS => {
                expires_at_ms = Some(u64::from(reader.u32_le()?) * 1000);
            }
            OPCODE_EXPIRE_MS => {
                expires_at_ms = Some(reader.u64_le()?);
            }
            TYPE_STRING => {
                let key = String::from_utf8(reader.string()?.to_vec())
                    .map_err(|e| Error::Snapshot(format!("key is not utf-8: {e}")))?;
                let value = reader.string()?;
                snapshot.entries.push(Entry {
                    key,
                    value,
                    expires_at_ms: expires_at_ms.take(),
                });
            }
            OPCODE_EOF => {
                if reader.remaining() >= 8 {
                    let mut checksum = [0u8; 8];
                    checksum.copy_from_slice(reader.take(8)?);
                    snapshot.checksum = Some(checksum);
                }
                break;
            }
            other => {
                return Err(Error::Snapshot(format!(
                    "unsupported opcode or value type 0x{other:02X}"
                )))
            }
        }
    }

    Ok(snapshot)
}

/// Encode `entries` as a snapshot payload with a zeroed (disabled) checksum.
pub fn dump(entries: &[Entry]) -> Bytes {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_slice(MAGIC);
    buf.put_slice(VERSION);

    buf.put_u8(OPCODE_AUX);
    put_string(&mut buf, b"redis-ver");
    put_string(&mut buf, b"7.2.0");
    buf.put_u8(OPCODE_AUX);
    put_string(&mut buf, b"redis-bits");
    put_string(&mut buf, b"64");

    if !entries.is_empty() {
        let expiring = entries.iter().filter(|e| e.expires_at_ms.is_some()).count();
        buf.put_u8(OPCODE_SELECT_DB);
        put_length(&mut buf, 0);
        buf.put_u8(OPCODE_RESIZE_DB);
        put_length(&mut buf, entries.len() as u64);
        put_length(&mut buf, expiring as u64);

        for entry in entries {
            if let Some(at) = entry.expires_at_ms {
                buf.put_u8(OPCODE_EXPIRE_MS);
                buf.put_u64_le(at);
            }
            buf.put_u8(TYPE_STRING);
            put_string(&mut buf, entry.key.as_bytes());
            put_string(&mut buf, &entry.value);
        }
    }

    buf.put_u8(OPCODE_EOF);
    buf.put_u64(0);
    buf.freeze()
}
