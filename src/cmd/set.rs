use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

use super::{Command, Context, Reply};
use crate::{parse::Parse, Error, Frame, LResult};

#[derive(Debug)]
pub struct SetCmd {
    key: String,
    value: Bytes,
    expire: Option<Duration>,
}

impl SetCmd {
    pub fn new(key: impl ToString, value: Bytes, expire: Option<Duration>) -> SetCmd {
        SetCmd {
            key: key.to_string(),
            value,
            expire,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &Bytes {
        &self.value
    }

    pub fn expire(&self) -> Option<Duration> {
        self.expire
    }
}

impl Command for SetCmd {
    const NAME: &'static str = "set";
    const IS_WRITE: bool = true;

    /// `SET key value [EX seconds|PX milliseconds]`
    fn parse_frames(parse: &mut Parse) -> LResult<Self> {
        let key = parse.next_string()?;
        let value = parse.next_bytes()?;

        let expire = match parse.next_string() {
            Ok(option) => {
                let amount = parse.next_int()?;
                let amount = u64::try_from(amount)
                    .ok()
                    .filter(|amount| *amount > 0)
                    .ok_or_else(|| {
                        Error::Protocol("invalid expire time in 'set' command".into())
                    })?;
                match &option.to_uppercase()[..] {
                    "EX" => Some(Duration::from_secs(amount)),
                    "PX" => Some(Duration::from_millis(amount)),
                    _ => {
                        return Err(Error::Protocol(format!(
                            "unsupported SET option `{option}`"
                        )))
                    }
                }
            }
            Err(Error::EndOfStream) => None,
            Err(e) => return Err(e),
        };

        Ok(Self { key, value, expire })
    }

    #[tracing::instrument(skip_all, fields(key = %self.key))]
    async fn apply(self, ctx: &Context) -> LResult<Reply> {
        ctx.db.set(self.key, self.value, self.expire);
        let response = Frame::SimpleString("OK".to_string());
        debug!(?response);
        Ok(response.into())
    }

    fn into_frame(self) -> LResult<Frame> {
        let mut frame = Frame::array();
        frame.push_bulk(Bytes::from("SET"))?;
        frame.push_bulk(Bytes::from(self.key))?;
        frame.push_bulk(self.value)?;
        if let Some(expire) = self.expire {
            frame.push_bulk(Bytes::from("PX"))?;
            frame.push_int(i64::try_from(expire.as_millis())?)?;
        }
        Ok(frame)
    }
}
