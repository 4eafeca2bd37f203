use bytes::Bytes;
use tracing::debug;

use super::{Command, Context, Reply};
use crate::{parse::Parse, Error, Frame, LResult};

#[derive(Debug, Default)]
pub struct PingCmd {
    msg: Option<Bytes>,
}

impl PingCmd {
    pub fn new(msg: Option<Bytes>) -> PingCmd {
        PingCmd { msg }
    }
}

impl Command for PingCmd {
    const NAME: &'static str = "ping";

    fn parse_frames(parse: &mut Parse) -> LResult<Self> {
        match parse.next_bytes() {
            Ok(msg) => Ok(Self::new(Some(msg))),
            Err(Error::EndOfStream) => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }

    #[tracing::instrument(skip(self, _ctx))]
    async fn apply(self, _ctx: &Context) -> LResult<Reply> {
        let response = match self.msg {
            None => Frame::SimpleString("PONG".to_string()),
            Some(msg) => Frame::BulkString(msg),
        };

        debug!(?response);

        Ok(response.into())
    }

    fn into_frame(self) -> LResult<Frame> {
        let mut frame = Frame::array();
        frame.push_bulk(Bytes::from("PING"))?;
        if let Some(msg) = self.msg {
            frame.push_bulk(msg)?;
        }
        Ok(frame)
    }
}
