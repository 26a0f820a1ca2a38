//! Connection handler: one protocol exchange against a single agency.

use std::fmt;
use std::marker::Unpin;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::protocol::{
    encode_reply, encode_winners, read_batch, read_confirmation, write_frame,
    AgencyId, MsgId, WireError,
};
use crate::server::{Agency, DrawEngine};
use crate::utils::{CancelToken, TallyError};

/// Failure of one handler step. Either way the caller closes and
/// de-registers the connection.
#[derive(Debug)]
pub enum StepError {
    /// Framing, connection, or cancellation failure on the wire.
    Wire(WireError),

    /// The bet store refused the batch.
    Store(TallyError),
}

impl StepError {
    /// True if the step stopped because termination was requested.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StepError::Wire(WireError::Cancelled))
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StepError::Wire(e) => write!(f, "{}", e),
            StepError::Store(e) => write!(f, "bet store error: {}", e),
        }
    }
}

impl From<WireError> for StepError {
    fn from(e: WireError) -> Self {
        StepError::Wire(e)
    }
}

/// Sends a best-effort ERROR frame before the connection gets dropped.
async fn reply_error<Conn>(agency: &mut Agency<Conn>, cancel: &CancelToken)
where
    Conn: AsyncWrite + Unpin,
{
    let res = match encode_reply(MsgId::Error) {
        Ok(frame) => write_frame(&mut agency.conn, &frame, cancel).await,
        Err(e) => Err(e),
    };
    if let Err(e) = res {
        pf_debug!("could not send ERROR to {}: {}", agency.label(), e);
    }
}

/// Ingestion step: reads one BATCH frame, stores its bets, and replies ACK.
/// Marks the agency complete if the batch was its last. On a framing error
/// or a store failure an ERROR frame is sent back before returning.
/// `claimed` holds the IDs already taken by other registered agencies.
pub(crate) async fn ingest_step<Conn>(
    agency: &mut Agency<Conn>,
    claimed: &[AgencyId],
    draw: &mut DrawEngine,
    cancel: &CancelToken,
) -> Result<(), StepError>
where
    Conn: AsyncRead + AsyncWrite + Unpin,
{
    let batch = match read_batch(&mut agency.conn, cancel).await {
        Ok(batch) => batch,
        Err(WireError::Framing(msg)) => {
            reply_error(agency, cancel).await;
            return Err(WireError::Framing(msg).into());
        }
        Err(e) => return Err(e.into()),
    };

    let known_id = agency.id;
    match known_id {
        None if claimed.contains(&batch.agency) => {
            reply_error(agency, cancel).await;
            return Err(WireError::Framing(format!(
                "agency {} already registered on another connection",
                batch.agency
            ))
            .into());
        }
        None => {
            agency.id = Some(batch.agency);
            pf_info!("registered {}", agency.label());
        }
        Some(id) if id != batch.agency => {
            reply_error(agency, cancel).await;
            return Err(WireError::Framing(format!(
                "agency {} sent a batch tagged as agency {}",
                id, batch.agency
            ))
            .into());
        }
        Some(_) => {}
    }
    pf_debug!(
        "batch received from {}: {} bets, last {}",
        agency.label(),
        batch.bets.len(),
        batch.last
    );

    if let Err(e) = draw.store(&batch.bets).await {
        reply_error(agency, cancel).await;
        return Err(StepError::Store(e));
    }
    pf_info!("stored {} bets from {}", batch.bets.len(), agency.label());

    let ack = encode_reply(MsgId::Ack)?;
    write_frame(&mut agency.conn, &ack, cancel).await?;

    if batch.last {
        agency.complete = true;
        pf_info!("all bets of {} stored", agency.label());
    }
    Ok(())
}

/// Winners-delivery step: sends the agency its WINNERS frame and reads back
/// the confirmation. Returns `Ok(true)` if confirmed. A bad or missing
/// confirmation is only logged and yields `Ok(false)`; nothing is resent.
pub(crate) async fn deliver_winners_step<Conn>(
    agency: &mut Agency<Conn>,
    cancel: &CancelToken,
) -> Result<bool, StepError>
where
    Conn: AsyncRead + AsyncWrite + Unpin,
{
    let frame = encode_winners(&agency.winners)?;
    write_frame(&mut agency.conn, &frame, cancel).await?;
    pf_info!(
        "sent {} winners to {}",
        agency.winners.len(),
        agency.label()
    );

    match read_confirmation(&mut agency.conn, cancel).await {
        Ok(()) => Ok(true),
        Err(WireError::Cancelled) => Err(WireError::Cancelled.into()),
        Err(e) => {
            pf_warn!(
                "winners confirmation from {} failed: {}",
                agency.label(),
                e
            );
            Ok(false)
        }
    }
}
