//! Agency-facing binary wire protocol.
//!
//! Every frame starts with a one-byte message id. All multi-byte integers are
//! big-endian, and every count field is a single byte, which caps a frame at
//! 255 bets or 255 winners.

mod messages;
mod codec;

use std::error;
use std::fmt;
use std::io;

pub use messages::{AgencyId, BatchFrame, Bet, Document, MsgId};
pub use messages::{BIRTHDATE_LEN, MAX_FRAME_ITEMS};
pub use codec::{
    encode_batch, encode_reply, encode_winners, read_batch, read_confirmation,
    read_reply, read_winners, write_frame,
};

/// Failure of one protocol exchange on a single connection.
#[derive(Debug)]
pub enum WireError {
    /// Short read, unexpected message id, or malformed field.
    Framing(String),

    /// Socket failure or peer reset.
    Connection(io::Error),

    /// Termination requested before the next blocking socket call.
    Cancelled,
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WireError::Framing(msg) => write!(f, "framing error: {}", msg),
            WireError::Connection(e) => write!(f, "connection error: {}", e),
            WireError::Cancelled => write!(f, "cancelled by termination"),
        }
    }
}

impl error::Error for WireError {}

impl From<io::Error> for WireError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            WireError::Framing(format!("short read: {}", e))
        } else {
            WireError::Connection(e)
        }
    }
}
