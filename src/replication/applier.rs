//! Applies commands propagated by the master to the local key space.

use tokio::sync::mpsc;
use tracing::{debug, warn, Instrument};

use super::propagation::PropagatedCommand;
use crate::{Context, ConnectionStream, Handlers, LResult, Reply};

/// Drain `rx` until the propagation loop ends.
pub async fn run<S: ConnectionStream>(
    mut rx: mpsc::Receiver<PropagatedCommand<S>>,
    ctx: Context,
    handlers: Handlers,
) {
    while let Some(record) = rx.recv().await {
        let span = record.span.clone();
        if let Err(e) = apply(&ctx, &handlers, record).instrument(span).await {
            warn!(error = %e, "failed to answer the master");
        }
    }
    debug!("replica applier stopped");
}

/// Apply one record. Replies are dropped except acknowledgements, which
/// are written back to the master.
///
/// The offset advances by the record's wire length after the handler runs,
/// so an acknowledgement reports the bytes processed before the request.
pub async fn apply<S: ConnectionStream>(
    ctx: &Context,
    handlers: &Handlers,
    record: PropagatedCommand<S>,
) -> LResult<()> {
    let PropagatedCommand {
        frame,
        len,
        responder,
        ..
    } = record;

    let result = match handlers.resolve(frame) {
        Ok((name, handler, args)) => {
            debug!(command = %name, len, "applying propagated command");
            handler.call(ctx.clone(), args).await
        }
        Err(e) => Err(e),
    };
    let offset = ctx.replication.advance_offset(len);

    match result {
        Ok(Reply::Ack(frame)) => {
            debug!(offset, "acknowledging offset to master");
            responder.lock().await.write_frame(&frame).await?;
        }
        Ok(Reply::FullResync { .. }) => {
            warn!("master sent PSYNC over the replication link, ignoring");
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "failed to apply propagated command"),
    }
    Ok(())
}
