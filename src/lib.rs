//! Lottery center: collects bet batches from a fixed set of agencies over a
//! custom binary protocol, performs a single draw once every agency is done,
//! and sends each agency back its winners.

#[macro_use]
mod utils;

mod protocol;
mod server;

pub use utils::{logger_init, CancelToken, TallyError, ME};

pub use protocol::{
    encode_batch, encode_reply, encode_winners, read_batch, read_confirmation,
    read_reply, read_winners, write_frame,
};
pub use protocol::{
    AgencyId, BatchFrame, Bet, Document, MsgId, WireError, BIRTHDATE_LEN,
    MAX_FRAME_ITEMS,
};

pub use server::{
    Agency, BetStore, CenterConfig, DrawEngine, FileBetStore, LotteryCenter,
    LuckyNumber, MemoryBetStore, Phase, Scheduler, StepError, WinRule,
    WinnersMap, MAX_AGENCIES,
};
