use crate::{Error, Frame, LResult};
use bytes::Bytes;

/// Cursor over the arguments of a command frame.
#[derive(Debug)]
pub struct Parse {
    parts: std::vec::IntoIter<Frame>,
}

impl Parse {
    pub fn new(frame: Frame) -> LResult<Parse> {
        let array = match frame {
            Frame::Array(array) => array,
            frame => return Err(Error::Protocol(format!("expected array, got {frame:?}"))),
        };

        Ok(Parse {
            parts: array.into_iter(),
        })
    }

    /// Arguments of a command frame, positioned after the command name.
    pub fn arguments(frame: Frame) -> LResult<Parse> {
        let mut parse = Parse::new(frame)?;
        parse.next()?;
        Ok(parse)
    }

    fn next(&mut self) -> LResult<Frame> {
        self.parts.next().ok_or(Error::EndOfStream)
    }

    /// Next argument as a string. Integers are accepted and rendered in decimal.
    #[tracing::instrument(skip_all, level = "debug")]
    pub fn next_string(&mut self) -> LResult<String> {
        match self.next()? {
            frame @ (Frame::SimpleString(_) | Frame::BulkString(_) | Frame::Integer(_)) => {
                frame.into_string().map_err(|e| Error::Protocol(e.to_string()))
            }
            frame => Err(Error::Protocol(format!(
                "expected simple frame or bulk frame, got {frame:?}"
            ))),
        }
    }

    pub fn next_bytes(&mut self) -> LResult<Bytes> {
        match self.next()? {
            Frame::SimpleString(s) => Ok(Bytes::from(s.into_bytes())),
            Frame::BulkString(data) => Ok(data),
            frame => Err(Error::Protocol(format!(
                "expected simple frame or bulk frame, got {frame:?}"
            ))),
        }
    }

    pub fn next_int(&mut self) -> LResult<i64> {
        use atoi::atoi;
        let invalid_number_err: Error = Error::Protocol("invalid number".to_string());

        match self.next()? {
            Frame::Integer(v) => Ok(v),
            Frame::SimpleString(data) => atoi::<i64>(data.as_bytes()).ok_or(invalid_number_err),
            Frame::BulkString(data) => atoi::<i64>(&data).ok_or(invalid_number_err),
            frame => Err(Error::Protocol(format!(
                "expected int frame, got {frame:?}"
            ))),
        }
    }

    pub fn remaining(&self) -> usize {
        self.parts.len()
    }

    pub fn finish(&mut self) -> LResult<()> {
        if self.parts.next().is_none() {
            Ok(())
        } else {
            Err(Error::Protocol("expected end of frame".to_string()))
        }
    }
}
