use bytes::{BufMut, Bytes, BytesMut};

use crate::{Error, LResult};

/// Decoded form of a length prefix.
///
/// The two most significant bits of the first byte select the encoding:
/// `00` 6 bit length, `01` 14 bit length, `10` 32 or 64 bit big endian
/// length, `11` a string stored in a special format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Length {
    Len(u64),
    Int8,
    Int16,
    Int32,
    Lzf,
}

/// Cursor over a snapshot payload.
#[derive(Debug)]
pub(super) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(super) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(super) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub(super) fn take(&mut self, n: usize) -> LResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::Snapshot(format!(
                "truncated payload at byte {}, wanted {n} more",
                self.pos
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub(super) fn u8(&mut self) -> LResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub(super) fn u32_le(&mut self) -> LResult<u32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(raw))
    }

    pub(super) fn u64_le(&mut self) -> LResult<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(raw))
    }

    pub(super) fn length(&mut self) -> LResult<Length> {
        let first = self.u8()?;
        match first >> 6 {
            0b00 => Ok(Length::Len(u64::from(first & 0x3F))),
            0b01 => {
                let low = self.u8()?;
                Ok(Length::Len((u64::from(first & 0x3F) << 8) | u64::from(low)))
            }
            0b10 => match first {
                0x80 => {
                    let mut raw = [0u8; 4];
                    raw.copy_from_slice(self.take(4)?);
                    Ok(Length::Len(u64::from(u32::from_be_bytes(raw))))
                }
                0x81 => {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(self.take(8)?);
                    Ok(Length::Len(u64::from_be_bytes(raw)))
                }
                other => Err(Error::Snapshot(format!(
                    "invalid length prefix 0x{other:02X}"
                ))),
            },
            _ => match first & 0x3F {
                0 => Ok(Length::Int8),
                1 => Ok(Length::Int16),
                2 => Ok(Length::Int32),
                3 => Ok(Length::Lzf),
                other => Err(Error::Snapshot(format!(
                    "invalid special string format {other}"
                ))),
            },
        }
    }

    /// A plain length, as used by database selectors and resize hints.
    pub(super) fn length_value(&mut self) -> LResult<u64> {
        match self.length()? {
            Length::Len(len) => Ok(len),
            other => Err(Error::Snapshot(format!("expected a length, got {other:?}"))),
        }
    }

    /// A string, with integer encoded strings rendered in decimal.
    pub(super) fn string(&mut self) -> LResult<Bytes> {
        match self.length()? {
            Length::Len(len) => {
                let len = usize::try_from(len)?;
                Ok(Bytes::copy_from_slice(self.take(len)?))
            }
            Length::Int8 => Ok(Bytes::from((self.u8()? as i8).to_string())),
            Length::Int16 => {
                let mut raw = [0u8; 2];
                raw.copy_from_slice(self.take(2)?);
                Ok(Bytes::from(i16::from_le_bytes(raw).to_string()))
            }
            Length::Int32 => Ok(Bytes::from((self.u32_le()? as i32).to_string())),
            Length::Lzf => Err(Error::Snapshot(
                "LZF compressed strings are not supported".into(),
            )),
        }
    }
}

pub(super) fn put_length(dst: &mut BytesMut, len: u64) {
    if len < 1 << 6 {
        dst.put_u8(len as u8);
    } else if len < 1 << 14 {
        dst.put_u8(0x40 | (len >> 8) as u8);
        dst.put_u8(len as u8);
    } else if let Ok(len) = u32::try_from(len) {
        dst.put_u8(0x80);
        dst.put_u32(len);
    } else {
        dst.put_u8(0x81);
        dst.put_u64(len);
    }
}

pub(super) fn put_string(dst: &mut BytesMut, value: &[u8]) {
    put_length(dst, value.len() as u64);
    dst.put_slice(value);
}
