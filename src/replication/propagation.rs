//! Command stream from the master, once the handshake is done.

use std::sync::Arc;

use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn, Span};

use crate::{Connection, ConnectionStream, Frame, LResult};

/// Records buffered between the socket and the applier. When full, reading
/// from the master stops until the applier catches up.
pub const CHANNEL_CAPACITY: usize = 64;

/// Write side of the master connection, shared by every record read from it.
pub type Responder<S> = Arc<Mutex<Connection<WriteHalf<S>>>>;

/// One command read from the master.
#[derive(Debug)]
pub struct PropagatedCommand<S> {
    pub frame: Frame,
    /// Exact number of bytes the frame occupied on the wire.
    pub len: usize,
    pub responder: Responder<S>,
    pub span: Span,
}

pub fn channel<S>() -> (
    mpsc::Sender<PropagatedCommand<S>>,
    mpsc::Receiver<PropagatedCommand<S>>,
) {
    mpsc::channel(CHANNEL_CAPACITY)
}

/// Read frames from the master and forward them in order.
///
/// Returns `Ok(())` when the master closes the stream between frames or the
/// receiver goes away. A frame that fails to decode is skipped. Any other
/// error ends the loop.
pub async fn run<S>(
    mut reader: Connection<ReadHalf<S>>,
    responder: Responder<S>,
    tx: mpsc::Sender<PropagatedCommand<S>>,
    span: Span,
) -> LResult<()>
where
    S: ConnectionStream,
{
    info!(parent: &span, "listening for propagated commands");
    loop {
        let (frame, len) = match reader.read_frame_with_len().await {
            Ok(Some((frame @ Frame::Array(_), len))) => (frame, len),
            Ok(Some((frame, len))) => {
                warn!(parent: &span, %frame, len, "ignoring non-array frame from master");
                continue;
            }
            Ok(None) => {
                info!(parent: &span, "master closed the replication stream");
                return Ok(());
            }
            Err(e) if e.is_framing() => {
                warn!(parent: &span, error = %e, "skipping corrupted frame from master");
                reader.resync();
                continue;
            }
            Err(e) => return Err(e),
        };

        debug!(parent: &span, %frame, len, "read propagated command");
        let record = PropagatedCommand {
            frame,
            len,
            responder: responder.clone(),
            span: span.clone(),
        };
        if tx.send(record).await.is_err() {
            debug!(parent: &span, "applier stopped, leaving propagation loop");
            return Ok(());
        }
    }
}
