//! Lottery center server-side modules.

mod scheduler;
mod storage;
mod draw;
mod handler;
mod center;

pub use scheduler::{Agency, Scheduler, MAX_AGENCIES};
pub use storage::{BetStore, FileBetStore, MemoryBetStore};
pub use draw::{DrawEngine, LuckyNumber, WinRule, WinnersMap};
pub use handler::StepError;
pub use center::{CenterConfig, LotteryCenter, Phase};
