use bytes::Bytes;
use tracing::debug;

use super::{Command, Context, Reply};
use crate::{parse::Parse, Error, Frame, LResult};

/// `INFO [section]`. Only the replication section exists; other sections
/// are answered with an empty bulk string.
#[derive(Debug, Default)]
pub struct InfoCmd {
    section: Option<String>,
}

impl InfoCmd {
    pub fn new(section: Option<String>) -> Self {
        Self { section }
    }
}

impl Command for InfoCmd {
    const NAME: &'static str = "info";

    fn parse_frames(parse: &mut Parse) -> LResult<Self> {
        match parse.next_string() {
            Ok(section) => Ok(Self::new(Some(section.to_lowercase()))),
            Err(Error::EndOfStream) => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }

    #[tracing::instrument(skip_all, fields(section = ?self.section))]
    async fn apply(self, ctx: &Context) -> LResult<Reply> {
        let body = match self.section.as_deref() {
            None | Some("replication" | "all" | "everything" | "default") => {
                ctx.replication.info().render()
            }
            Some(other) => {
                debug!(section = other, "unknown INFO section");
                String::new()
            }
        };
        Ok(Frame::BulkString(Bytes::from(body)).into())
    }

    fn into_frame(self) -> LResult<Frame> {
        let mut frame = Frame::array();
        frame.push_bulk(Bytes::from("INFO"))?;
        if let Some(section) = self.section {
            frame.push_bulk(Bytes::from(section))?;
        }
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Db, Replication};

    #[tokio::test]
    async fn test_replication_section() {
        let ctx = Context::new(Db::new(), Replication::new_master());
        let reply = InfoCmd::new(Some("replication".into()))
            .apply(&ctx)
            .await
            .unwrap();
        let Reply::Frame(Frame::BulkString(body)) = reply else {
            panic!("expected a bulk string");
        };
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains("role:master\r\n"));
        assert!(body.contains("connected_slaves:0\r\n"));
        assert!(body.contains("master_repl_offset:0\r\n"));
    }

    #[tokio::test]
    async fn test_unknown_section_is_empty() {
        let ctx = Context::new(Db::new(), Replication::new_master());
        let reply = InfoCmd::new(Some("keyspace".into()))
            .apply(&ctx)
            .await
            .unwrap();
        assert!(matches!(reply, Reply::Frame(Frame::BulkString(body)) if body.is_empty()));
    }
}
