use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("incomplete frame")]
    IncompleteFrame,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Conversion(#[from] std::num::TryFromIntError),
    #[error(transparent)]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("end of stream error")]
    /// Attempting to extract a value failed due to the frame being fully consumed
    EndOfStream,
    /// The peer closed the stream in the middle of a frame.
    #[error("connection closed mid frame")]
    UnexpectedEof,
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("unknown command `{0}`")]
    UnknownCommand(String),
    #[error("wrong frame type: {0}")]
    WrongFrameType(String),
    #[error("{0}")]
    Response(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("invalid snapshot: {0}")]
    Snapshot(String),
}

impl Error {
    /// `true` when the remote side closed the stream, cleanly or not.
    pub fn is_eof(&self) -> bool {
        match self {
            Error::UnexpectedEof => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::UnexpectedEof,
            _ => false,
        }
    }

    /// `true` for wire-level framing violations.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_) | Error::Conversion(_) | Error::Utf8(_)
        )
    }
}
