use super::{Command, Context, Reply};
use crate::{parse::Parse, Frame, LResult};
use bytes::Bytes;
use tracing::debug;

#[derive(Debug)]
pub struct GetCmd {
    key: String,
}

impl GetCmd {
    pub fn new(key: impl ToString) -> Self {
        Self {
            key: key.to_string(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Command for GetCmd {
    const NAME: &'static str = "get";

    fn parse_frames(parse: &mut Parse) -> LResult<Self> {
        let key = parse.next_string()?;
        Ok(Self { key })
    }

    #[tracing::instrument(skip_all, fields(key = %self.key))]
    async fn apply(self, ctx: &Context) -> LResult<Reply> {
        let response = if let Some(value) = ctx.db.get(&self.key) {
            Frame::BulkString(value)
        } else {
            Frame::NullBulkString
        };

        debug!(?response);

        Ok(response.into())
    }

    fn into_frame(self) -> LResult<Frame> {
        let mut frame = Frame::array();
        frame.push_bulk(Bytes::from("GET"))?;
        frame.push_bulk(Bytes::from(self.key))?;
        Ok(frame)
    }
}
