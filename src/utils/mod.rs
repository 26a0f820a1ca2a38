//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod error;
mod cancel;
mod safetcp;

pub use error::TallyError;
pub use print::{logger_init, ME};
pub use cancel::CancelToken;

pub(crate) use safetcp::{
    cancellable_read, cancellable_write, tcp_bind_with_retry,
};
