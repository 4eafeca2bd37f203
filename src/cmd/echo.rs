use bytes::Bytes;
use tracing::debug;

use super::{Command, Context, Reply};
use crate::{parse::Parse, Frame, LResult};

#[derive(Debug)]
pub struct EchoCmd {
    msg: Bytes,
}

impl EchoCmd {
    pub fn new(msg: Bytes) -> Self {
        Self { msg }
    }
}

impl Command for EchoCmd {
    const NAME: &'static str = "echo";

    fn parse_frames(parse: &mut Parse) -> LResult<Self> {
        let msg = parse.next_bytes()?;
        Ok(Self { msg })
    }

    #[tracing::instrument(skip_all)]
    async fn apply(self, _ctx: &Context) -> LResult<Reply> {
        let response = Frame::BulkString(self.msg);
        debug!(?response);
        Ok(response.into())
    }

    fn into_frame(self) -> LResult<Frame> {
        let mut frame = Frame::array();
        frame.push_bulk(Bytes::from("ECHO"))?;
        frame.push_bulk(self.msg)?;
        Ok(frame)
    }
}
