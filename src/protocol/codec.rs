//! Frame encoding into byte buffers and cancellation-aware frame decoding
//! straight off a connection.
//!
//! Layouts:
//!   - BATCH:   id(1) agency(1) last(1) count(1) count x BetRecord
//!   - BetRecord: name_len(1) name surname_len(1) surname document(4)
//!     birthdate(10) number(2)
//!   - ACK / ERROR: id(1)
//!   - WINNERS: id(1) count(1) count x document(4)

use std::marker::Unpin;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use tokio::io::{AsyncRead, AsyncWrite};

use crate::protocol::{
    AgencyId, BatchFrame, Bet, Document, MsgId, WireError, BIRTHDATE_LEN,
    MAX_FRAME_ITEMS,
};
use crate::utils::{cancellable_read, cancellable_write, CancelToken};

/// Appends a length-prefixed text field, rejecting texts over 255 bytes.
fn put_short_text(
    buf: &mut BytesMut,
    text: &str,
    field: &str,
) -> Result<(), WireError> {
    let len = u8::try_from(text.len()).map_err(|_| {
        WireError::Framing(format!(
            "{} too long: {} bytes (max {})",
            field,
            text.len(),
            u8::MAX
        ))
    })?;
    buf.put_u8(len);
    buf.put_slice(text.as_bytes());
    Ok(())
}

/// Encodes a BATCH frame carrying `bets` on behalf of `agency`.
pub fn encode_batch(
    agency: AgencyId,
    last: bool,
    bets: &[Bet],
) -> Result<Bytes, WireError> {
    if bets.len() > MAX_FRAME_ITEMS {
        return Err(WireError::Framing(format!(
            "too many bets in batch: {} (max {})",
            bets.len(),
            MAX_FRAME_ITEMS
        )));
    }

    let mut buf = BytesMut::with_capacity(4 + bets.len() * 48);
    buf.put_u8(MsgId::Batch as u8);
    buf.put_u8(agency);
    buf.put_u8(last as u8);
    buf.put_u8(bets.len() as u8);

    for bet in bets {
        put_short_text(&mut buf, &bet.first_name, "first name")?;
        put_short_text(&mut buf, &bet.last_name, "last name")?;
        buf.put_u32(bet.document);
        if bet.birthdate.len() != BIRTHDATE_LEN {
            return Err(WireError::Framing(format!(
                "birthdate '{}' is not {} bytes",
                bet.birthdate, BIRTHDATE_LEN
            )));
        }
        buf.put_slice(bet.birthdate.as_bytes());
        buf.put_u16(bet.number);
    }

    Ok(buf.freeze())
}

/// Encodes a single-byte ACK or ERROR frame.
pub fn encode_reply(id: MsgId) -> Result<Bytes, WireError> {
    match id {
        MsgId::Ack | MsgId::Error => Ok(Bytes::from(vec![id as u8])),
        _ => Err(WireError::Framing(format!("{:?} is not a reply frame", id))),
    }
}

/// Encodes a WINNERS frame listing `winners` in order.
pub fn encode_winners(winners: &[Document]) -> Result<Bytes, WireError> {
    if winners.len() > MAX_FRAME_ITEMS {
        return Err(WireError::Framing(format!(
            "too many winners for one frame: {} (max {})",
            winners.len(),
            MAX_FRAME_ITEMS
        )));
    }

    let mut buf = BytesMut::with_capacity(2 + winners.len() * 4);
    buf.put_u8(MsgId::Winners as u8);
    buf.put_u8(winners.len() as u8);
    for &doc in winners {
        buf.put_u32(doc);
    }
    Ok(buf.freeze())
}

/// Writes an already encoded frame to `conn_write`.
pub async fn write_frame<Conn>(
    conn_write: &mut Conn,
    frame: &[u8],
    cancel: &CancelToken,
) -> Result<(), WireError>
where
    Conn: AsyncWrite + Unpin,
{
    cancellable_write(conn_write, frame, cancel).await
}

/// Pulls fixed-width fields off a connection one at a time. Each field is
/// read in full into the scratch buffer before it gets parsed.
struct FrameReader<'c, Conn> {
    conn: &'c mut Conn,
    cancel: &'c CancelToken,
    buf: BytesMut,
}

impl<'c, Conn> FrameReader<'c, Conn>
where
    Conn: AsyncRead + Unpin,
{
    fn new(conn: &'c mut Conn, cancel: &'c CancelToken) -> Self {
        FrameReader {
            conn,
            cancel,
            buf: BytesMut::with_capacity(64),
        }
    }

    async fn fill(&mut self, len: usize) -> Result<(), WireError> {
        self.buf.clear();
        self.buf.resize(len, 0);
        cancellable_read(&mut *self.conn, &mut self.buf[..], self.cancel).await
    }

    async fn u8(&mut self) -> Result<u8, WireError> {
        self.fill(1).await?;
        Ok(self.buf.get_u8())
    }

    async fn u16(&mut self) -> Result<u16, WireError> {
        self.fill(2).await?;
        Ok(self.buf.get_u16())
    }

    async fn u32(&mut self) -> Result<u32, WireError> {
        self.fill(4).await?;
        Ok(self.buf.get_u32())
    }

    async fn text(
        &mut self,
        len: usize,
        field: &str,
    ) -> Result<String, WireError> {
        self.fill(len).await?;
        let bytes = self.buf.split().freeze();
        String::from_utf8(bytes.to_vec()).map_err(|e| {
            WireError::Framing(format!("{} is not valid UTF-8: {}", field, e))
        })
    }

    /// Reads the message id byte and checks it against `expected`.
    async fn expect_id(&mut self, expected: MsgId) -> Result<(), WireError> {
        let byte = self.u8().await?;
        match MsgId::from_byte(byte) {
            Some(id) if id == expected => Ok(()),
            _ => Err(WireError::Framing(format!(
                "unexpected message id {} while expecting {:?}",
                byte, expected
            ))),
        }
    }

    async fn bet(&mut self, agency: AgencyId) -> Result<Bet, WireError> {
        let name_len = self.u8().await? as usize;
        let first_name = self.text(name_len, "first name").await?;
        let surname_len = self.u8().await? as usize;
        let last_name = self.text(surname_len, "last name").await?;
        let document = self.u32().await?;
        let birthdate = self.text(BIRTHDATE_LEN, "birthdate").await?;
        let number = self.u16().await?;
        Ok(Bet {
            agency,
            first_name,
            last_name,
            document,
            birthdate,
            number,
        })
    }
}

/// Reads one BATCH frame from `conn_read`.
pub async fn read_batch<Conn>(
    conn_read: &mut Conn,
    cancel: &CancelToken,
) -> Result<BatchFrame, WireError>
where
    Conn: AsyncRead + Unpin,
{
    let mut reader = FrameReader::new(conn_read, cancel);
    reader.expect_id(MsgId::Batch).await?;

    let agency = reader.u8().await?;
    let last = match reader.u8().await? {
        0 => false,
        1 => true,
        flag => {
            return Err(WireError::Framing(format!(
                "invalid last-batch flag {}",
                flag
            )))
        }
    };
    let count = reader.u8().await? as usize;

    let mut bets = Vec::with_capacity(count);
    for _ in 0..count {
        bets.push(reader.bet(agency).await?);
    }
    Ok(BatchFrame { agency, last, bets })
}

/// Reads a single-byte ACK or ERROR reply.
pub async fn read_reply<Conn>(
    conn_read: &mut Conn,
    cancel: &CancelToken,
) -> Result<MsgId, WireError>
where
    Conn: AsyncRead + Unpin,
{
    let mut reader = FrameReader::new(conn_read, cancel);
    let byte = reader.u8().await?;
    match MsgId::from_byte(byte) {
        Some(id @ (MsgId::Ack | MsgId::Error)) => Ok(id),
        _ => Err(WireError::Framing(format!(
            "unexpected message id {} while expecting a reply",
            byte
        ))),
    }
}

/// Reads the confirmation that follows a WINNERS delivery; anything other
/// than ACK is a framing error.
pub async fn read_confirmation<Conn>(
    conn_read: &mut Conn,
    cancel: &CancelToken,
) -> Result<(), WireError>
where
    Conn: AsyncRead + Unpin,
{
    FrameReader::new(conn_read, cancel)
        .expect_id(MsgId::Ack)
        .await
}

/// Reads one WINNERS frame, returning the documents in frame order.
pub async fn read_winners<Conn>(
    conn_read: &mut Conn,
    cancel: &CancelToken,
) -> Result<Vec<Document>, WireError>
where
    Conn: AsyncRead + Unpin,
{
    let mut reader = FrameReader::new(conn_read, cancel);
    reader.expect_id(MsgId::Winners).await?;
    let count = reader.u8().await? as usize;
    let mut winners = Vec::with_capacity(count);
    for _ in 0..count {
        winners.push(reader.u32().await?);
    }
    Ok(winners)
}
