use bytes::Bytes;
use tracing::{debug, info};

use super::{Command, Context, Reply};
use crate::{parse::Parse, snapshot, Error, Frame, LResult};

/// `PSYNC <replid> <offset>`. Every request is answered with a full resync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PsyncCmd {
    replid: String,
    offset: i64,
}

impl PsyncCmd {
    pub fn new(replid: impl ToString, offset: i64) -> Self {
        Self {
            replid: replid.to_string(),
            offset,
        }
    }

    /// `PSYNC ? -1`, sent by a replica without any prior state.
    pub fn full() -> Self {
        Self::new("?", -1)
    }
}

impl Command for PsyncCmd {
    const NAME: &'static str = "psync";

    fn parse_frames(parse: &mut Parse) -> LResult<Self> {
        let replid = parse.next_string()?;
        let offset = parse.next_int()?;
        Ok(Self { replid, offset })
    }

    #[tracing::instrument(skip(ctx))]
    async fn apply(self, ctx: &Context) -> LResult<Reply> {
        if !ctx.replication.is_master() {
            return Err(Error::Response(
                "ERR PSYNC is only served by a master".to_string(),
            ));
        }

        let replid = ctx.replication.replid();
        if self.replid == replid {
            debug!(offset = self.offset, "partial resync not supported, sending full resync");
        }

        // no write may be applied or propagated while the snapshot is taken
        let order = ctx.replication.order_writes().await;
        let feed = ctx.replication.subscribe();
        let offset = ctx.replication.offset();
        let snapshot = snapshot::dump(&ctx.db.dump());
        drop(order);
        info!(%replid, offset, snapshot_len = snapshot.len(), "full resync");

        Ok(Reply::FullResync {
            header: Frame::SimpleString(format!("FULLRESYNC {replid} {offset}")),
            snapshot,
            feed,
        })
    }

    fn into_frame(self) -> LResult<Frame> {
        let mut frame = Frame::array();
        frame.push_bulk(Bytes::from("PSYNC"))?;
        frame.push_bulk(Bytes::from(self.replid))?;
        frame.push_int(self.offset)?;
        Ok(frame)
    }
}

/// `+FULLRESYNC <replid> <offset>` split into its parts.
pub fn parse_full_resync(reply: &str) -> Option<(String, u64)> {
    let mut parts = reply.split_whitespace();
    if !parts.next()?.eq_ignore_ascii_case("FULLRESYNC") {
        return None;
    }
    let replid = parts.next()?.to_string();
    let offset = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((replid, offset))
}
