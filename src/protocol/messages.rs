//! Wire message ids and the values carried inside frames.

use serde::{Deserialize, Serialize};

/// Agency ID type; a single byte on the wire.
pub type AgencyId = u8;

/// National document number of a bettor.
pub type Document = u32;

/// Fixed length of the birth date field, e.g. `1999-03-17`.
pub const BIRTHDATE_LEN: usize = 10;

/// Upper bound on bets per BATCH frame and winners per WINNERS frame.
pub const MAX_FRAME_ITEMS: usize = u8::MAX as usize;

/// One-byte prefix distinguishing frame kinds.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum MsgId {
    /// Agency -> center: a batch of bets.
    Batch = 0,

    /// Center -> agency: batch stored; agency -> center: winners received.
    Ack = 1,

    /// Center -> agency: batch rejected.
    Error = 2,

    /// Center -> agency: winning documents of this agency.
    Winners = 3,
}

impl MsgId {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(MsgId::Batch),
            1 => Some(MsgId::Ack),
            2 => Some(MsgId::Error),
            3 => Some(MsgId::Winners),
            _ => None,
        }
    }
}

/// A single bet as submitted by an agency. Immutable once decoded.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Bet {
    /// Agency that submitted the bet.
    pub agency: AgencyId,

    pub first_name: String,
    pub last_name: String,

    /// Bettor's document number.
    pub document: Document,

    /// Birth date text, exactly `BIRTHDATE_LEN` bytes.
    pub birthdate: String,

    /// Number the bettor played.
    pub number: u16,
}

/// Decoded content of a BATCH frame.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct BatchFrame {
    /// Agency ID carried in the frame header.
    pub agency: AgencyId,

    /// Set on the final batch of the agency.
    pub last: bool,

    /// Bets in submission order, each tagged with `agency`.
    pub bets: Vec<Bet>,
}
