use std::io::Cursor;
use std::time::Duration;

use crate::frame::Frame;
use crate::{Error, LResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

/// Any byte stream a [`Connection`] can be built on.
///
/// Implemented for `TcpStream` as well as the in-memory streams used in tests.
pub trait ConnectionStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> ConnectionStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Progress of skipping a corrupted frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resync {
    Idle,
    /// Drop bytes through the next CRLF.
    SkipLine,
    /// Drop whole lines until one starts with `*`.
    SeekArray,
}

/// Send and receive `Frame` values from a remote peer.
///
/// To read frames, the `Connection` uses an internal buffer, which is filled
/// up until there are enough bytes to create a full frame. Once this happens,
/// the `Connection` creates the frame and returns it to the caller.
///
/// When sending frames, the frame is first encoded into a single buffer which
/// is then written to the stream with one `write_all`.
#[derive(Debug)]
pub struct Connection<S> {
    stream: S,
    /// Buffer used for reading frames.
    buffer: BytesMut,
    /// Upper bound for a single read from the stream.
    read_timeout: Option<Duration>,
    /// Upper bound for writing and flushing a single frame.
    write_timeout: Option<Duration>,
    resync: Resync,
}

impl<S> Connection<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(4 * 1024),
            read_timeout: None,
            write_timeout: None,
            resync: Resync::Idle,
        }
    }

    pub fn with_timeouts(mut self, read: Option<Duration>, write: Option<Duration>) -> Self {
        self.read_timeout = read;
        self.write_timeout = write;
        self
    }

    pub fn set_read_timeout(&mut self, read: Option<Duration>) {
        self.read_timeout = read;
    }

    /// Discard the frame that just failed to decode.
    ///
    /// Buffered bytes are dropped through the end of the current line and then
    /// line by line until one starts with `*`, which is assumed to open the
    /// next command.
    pub fn resync(&mut self) {
        self.resync = Resync::SkipLine;
    }

    /// Returns `true` once the buffer is aligned on a frame boundary.
    fn skip_corrupt(&mut self) -> bool {
        loop {
            match self.resync {
                Resync::Idle => return true,
                Resync::SkipLine => match find_crlf(&self.buffer) {
                    Some(end) => {
                        self.buffer.advance(end + 2);
                        self.resync = Resync::SeekArray;
                    }
                    None => {
                        // a trailing '\r' may be half of the terminator
                        let keep = usize::from(self.buffer.last() == Some(&b'\r'));
                        let len = self.buffer.len() - keep;
                        self.buffer.advance(len);
                        return false;
                    }
                },
                Resync::SeekArray => match self.buffer.first() {
                    None => return false,
                    Some(b'*') => self.resync = Resync::Idle,
                    Some(_) => self.resync = Resync::SkipLine,
                },
            }
        }
    }

    fn parse_frame(&mut self) -> LResult<Option<(Frame, usize)>> {
        let mut buf = Cursor::new(&self.buffer[..]);

        match Frame::check(&mut buf) {
            Ok(_) => {
                // get the byte length of the frame
                let len = buf.position() as usize;
                // reset the cursor in order to call `parse`
                buf.set_position(0);
                let frame = Frame::parse(&mut buf)?;
                // discard the frame from the buffer
                self.buffer.advance(len);

                Ok(Some((frame, len)))
            }
            // not enough data has been buffered
            Err(Error::IncompleteFrame) => Ok(None),
            // an actual error has occurred
            Err(e) => Err(e),
        }
    }

    fn parse_snapshot(&mut self) -> LResult<Option<Bytes>> {
        let Some(end) = find_crlf(&self.buffer) else {
            return Ok(None);
        };
        let header = &self.buffer[..end];
        if header.first() != Some(&b'$') {
            return Err(Error::Protocol(format!(
                "expected snapshot length prefix, got `{:?}`",
                String::from_utf8_lossy(header)
            )));
        }
        let len = atoi::atoi::<usize>(&header[1..])
            .ok_or_else(|| Error::Protocol("invalid snapshot length".into()))?;
        if len > MAX_SNAPSHOT_LEN {
            return Err(Error::Protocol(format!(
                "snapshot length {len} exceeds the {MAX_SNAPSHOT_LEN} byte limit"
            )));
        }

        let total = end + 2 + len;
        if self.buffer.len() < total {
            // the rest of the payload arrives through `read_buf`
            let missing = total - self.buffer.len();
            self.buffer.reserve(missing.min(SNAPSHOT_RESERVE));
            return Ok(None);
        }
        self.buffer.advance(end + 2);
        Ok(Some(self.buffer.split_to(len).freeze()))
    }
}

impl<S: AsyncRead + Unpin> Connection<S> {
    /// Read a single `Frame` from the connection.
    ///
    /// The function waits until it has retrieved enough data to parse a frame.
    /// Any data remaining in the read buffer after the frame has been parsed is
    /// kept there for the next call to `read_frame`.
    ///
    /// # Returns
    ///
    /// On success, the received frame is returned. If the stream is closed in
    /// a way that doesn't break a frame in half, it returns `None`. A stream
    /// closed mid frame yields [`Error::UnexpectedEof`].
    pub async fn read_frame(&mut self) -> LResult<Option<Frame>> {
        Ok(self.read_frame_with_len().await?.map(|(frame, _)| frame))
    }

    /// Like [`Connection::read_frame`], also returning the exact number of
    /// bytes the frame occupied on the wire.
    pub async fn read_frame_with_len(&mut self) -> LResult<Option<(Frame, usize)>> {
        loop {
            // Attempt to parse a frame from the buffered data. If enough data
            // has been buffered, the frame is returned.
            if self.skip_corrupt() {
                if let Some(parsed) = self.parse_frame()? {
                    return Ok(Some(parsed));
                }
            }

            // There is not enough buffered data to read a frame. Attempt to
            // read more data from the stream.
            //
            // On success, the number of bytes is returned. `0` indicates "end
            // of stream".
            if 0 == self.fill_buffer().await? {
                // The remote closed the connection. For this to be a clean
                // shutdown, there should be no data in the read buffer. If
                // there is, this means that the peer closed the socket while
                // sending a frame.
                if self.buffer.is_empty() || self.resync != Resync::Idle {
                    return Ok(None);
                }
                return Err(Error::UnexpectedEof);
            }
        }
    }

    /// Read a snapshot transfer: `$<len>\r\n` followed by exactly `len` bytes,
    /// without a trailing CRLF.
    ///
    /// Bytes buffered past the payload stay in the buffer for `read_frame`.
    pub async fn read_snapshot(&mut self) -> LResult<Bytes> {
        loop {
            if let Some(payload) = self.parse_snapshot()? {
                return Ok(payload);
            }
            if 0 == self.fill_buffer().await? {
                return Err(Error::UnexpectedEof);
            }
        }
    }

    async fn fill_buffer(&mut self) -> LResult<usize> {
        let limit = self.read_timeout;
        let read = self.stream.read_buf(&mut self.buffer);
        match limit {
            Some(limit) => tokio::time::timeout(limit, read)
                .await
                .map_err(|_| Error::Timeout("read"))?
                .map_err(Error::from),
            None => Ok(read.await?),
        }
    }
}

impl<S: AsyncWrite + Unpin> Connection<S> {
    /// Write a frame to the connection's underlying stream.
    ///
    /// Returns the number of bytes written.
    pub async fn write_frame(&mut self, frame: &Frame) -> LResult<usize> {
        let mut buf = BytesMut::with_capacity(frame.encoded_len());
        frame.encode(&mut buf);
        self.write_all(&buf).await?;
        Ok(buf.len())
    }

    /// Write a snapshot transfer, the inverse of [`Connection::read_snapshot`].
    pub async fn write_snapshot(&mut self, payload: &[u8]) -> LResult<()> {
        let mut buf = BytesMut::with_capacity(payload.len() + 16);
        buf.put_u8(b'$');
        buf.put_slice(payload.len().to_string().as_bytes());
        buf.put_slice(b"\r\n");
        buf.put_slice(payload);
        self.write_all(&buf).await
    }

    /// Write already encoded frames.
    pub async fn write_raw(&mut self, bytes: &[u8]) -> LResult<()> {
        self.write_all(bytes).await
    }

    async fn write_all(&mut self, bytes: &[u8]) -> LResult<()> {
        let limit = self.write_timeout;
        let stream = &mut self.stream;
        let write = async move {
            stream.write_all(bytes).await?;
            stream.flush().await
        };
        match limit {
            Some(limit) => tokio::time::timeout(limit, write)
                .await
                .map_err(|_| Error::Timeout("write"))??,
            None => write.await?,
        }
        Ok(())
    }
}

impl<S: AsyncRead + AsyncWrite> Connection<S> {
    /// Split into a reading and a writing connection.
    ///
    /// Bytes already buffered move to the read half, so nothing received
    /// before the split is lost.
    pub fn into_split(self) -> (Connection<ReadHalf<S>>, Connection<WriteHalf<S>>) {
        let (reader, writer) = tokio::io::split(self.stream);
        let read = Connection {
            stream: reader,
            buffer: self.buffer,
            read_timeout: self.read_timeout,
            write_timeout: None,
            resync: self.resync,
        };
        let write = Connection {
            stream: writer,
            buffer: BytesMut::new(),
            read_timeout: None,
            write_timeout: self.write_timeout,
            resync: Resync::Idle,
        };
        (read, write)
    }
}

/// Largest snapshot transfer accepted, matching Redis' default
/// `proto-max-bulk-len`.
pub const MAX_SNAPSHOT_LEN: usize = 512 * 1024 * 1024;

/// Upper bound for growing the read buffer ahead of a snapshot payload.
const SNAPSHOT_RESERVE: usize = 64 * 1024;

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}
