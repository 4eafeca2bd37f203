use bytes::Bytes;
use tracing::{debug, info};

use super::{Command, Context, Reply};
use crate::{parse::Parse, Error, Frame, LResult};

/// `REPLCONF`, exchanged between a master and its replicas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplConfCmd {
    /// Port the replica listens on for clients.
    ListeningPort(u16),
    /// Capabilities announced by the replica, e.g. `psync2`.
    Capa(Vec<String>),
    /// Master asks for the processed offset.
    GetAck,
    /// Replica reports its processed offset.
    Ack(u64),
}

impl ReplConfCmd {
    pub fn listening_port(port: u16) -> Self {
        Self::ListeningPort(port)
    }

    pub fn capa_psync2() -> Self {
        Self::Capa(vec!["psync2".to_string()])
    }
}

impl Command for ReplConfCmd {
    const NAME: &'static str = "replconf";

    fn parse_frames(parse: &mut Parse) -> LResult<Self> {
        let sub = parse.next_string()?.to_lowercase();
        match &sub[..] {
            "listening-port" => {
                let port = u16::try_from(parse.next_int()?)?;
                Ok(Self::ListeningPort(port))
            }
            "capa" => {
                // `capa eof capa psync2` repeats the keyword per value
                let mut capa = vec![parse.next_string()?];
                while parse.remaining() > 0 {
                    let value = parse.next_string()?;
                    if !value.eq_ignore_ascii_case("capa") {
                        capa.push(value);
                    }
                }
                Ok(Self::Capa(capa))
            }
            "getack" => {
                // always `*`
                parse.next_string()?;
                Ok(Self::GetAck)
            }
            "ack" => {
                let offset = u64::try_from(parse.next_int()?)?;
                Ok(Self::Ack(offset))
            }
            _ => Err(Error::Protocol(format!(
                "unsupported REPLCONF option `{sub}`"
            ))),
        }
    }

    #[tracing::instrument(skip(ctx))]
    async fn apply(self, ctx: &Context) -> LResult<Reply> {
        match self {
            Self::ListeningPort(port) => {
                info!(port, "replica announced listening port");
                Ok(Frame::SimpleString("OK".into()).into())
            }
            Self::Capa(capa) => {
                debug!(?capa, "replica capabilities");
                Ok(Frame::SimpleString("OK".into()).into())
            }
            Self::GetAck => {
                let offset = ctx.replication.offset();
                Ok(Reply::Ack(Self::Ack(offset).into_frame()?))
            }
            Self::Ack(offset) => {
                debug!(offset, "replica acknowledged offset");
                Ok(Reply::Silent)
            }
        }
    }

    fn into_frame(self) -> LResult<Frame> {
        let mut frame = Frame::array();
        frame.push_bulk(Bytes::from("REPLCONF"))?;
        match self {
            Self::ListeningPort(port) => {
                frame.push_bulk(Bytes::from("listening-port"))?;
                frame.push_int(i64::from(port))?;
            }
            Self::Capa(capa) => {
                for value in capa {
                    frame.push_bulk(Bytes::from("capa"))?;
                    frame.push_bulk(Bytes::from(value))?;
                }
            }
            Self::GetAck => {
                frame.push_bulk(Bytes::from("GETACK"))?;
                frame.push_bulk(Bytes::from("*"))?;
            }
            Self::Ack(offset) => {
                frame.push_bulk(Bytes::from("ACK"))?;
                frame.push_int(i64::try_from(offset)?)?;
            }
        }
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Db, Replication};

    fn parse(src: &[u8]) -> LResult<ReplConfCmd> {
        let (frame, _) = Frame::decode(src)?;
        let mut parse = Parse::new(frame)?;
        assert_eq!(parse.next_string()?.to_lowercase(), "replconf");
        let cmd = ReplConfCmd::parse_frames(&mut parse)?;
        parse.finish()?;
        Ok(cmd)
    }

    #[test]
    fn test_handshake_frames() {
        assert_eq!(
            &ReplConfCmd::listening_port(6380).into_frame().unwrap().to_bytes()[..],
            b"*3\r\n$8\r\nREPLCONF\r\n$14\r\nlistening-port\r\n$4\r\n6380\r\n"
        );
        assert_eq!(
            &ReplConfCmd::capa_psync2().into_frame().unwrap().to_bytes()[..],
            b"*3\r\n$8\r\nREPLCONF\r\n$4\r\ncapa\r\n$6\r\npsync2\r\n"
        );
    }

    #[test]
    fn test_parse_variants() {
        assert_eq!(
            parse(b"*3\r\n$8\r\nREPLCONF\r\n$14\r\nlistening-port\r\n$4\r\n6380\r\n").unwrap(),
            ReplConfCmd::ListeningPort(6380)
        );
        assert_eq!(
            parse(b"*3\r\n$8\r\nreplconf\r\n$6\r\nGETACK\r\n$1\r\n*\r\n").unwrap(),
            ReplConfCmd::GetAck
        );
        assert_eq!(
            parse(b"*3\r\n$8\r\nREPLCONF\r\n$3\r\nACK\r\n$2\r\n37\r\n").unwrap(),
            ReplConfCmd::Ack(37)
        );
        assert!(parse(b"*3\r\n$8\r\nREPLCONF\r\n$14\r\nlistening-port\r\n$5\r\n99999\r\n").is_err());
        assert!(parse(b"*2\r\n$8\r\nREPLCONF\r\n$3\r\nfoo\r\n").is_err());
    }

    #[tokio::test]
    async fn test_getack_reports_offset() {
        let replication = Replication::new_master();
        replication.advance_offset(51);
        let ctx = Context::new(Db::new(), replication);

        let Reply::Ack(frame) = ReplConfCmd::GetAck.apply(&ctx).await.unwrap() else {
            panic!("expected an ack");
        };
        assert_eq!(
            &frame.to_bytes()[..],
            b"*3\r\n$8\r\nREPLCONF\r\n$3\r\nACK\r\n$2\r\n51\r\n"
        );
    }
}
