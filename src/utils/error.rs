//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;
use std::net;
use std::num;
use std::string;

use crate::protocol::WireError;

/// Customized error type for the lottery center.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TallyError(String);

impl TallyError {
    pub fn msg(msg: impl ToString) -> Self {
        TallyError(msg.to_string())
    }
}

impl fmt::Display for TallyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl error::Error for TallyError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `TallyError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for TallyError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                TallyError(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(string::FromUtf8Error);
impl_from_error!(num::ParseIntError);
impl_from_error!(net::AddrParseError);
impl_from_error!(toml::de::Error);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(ctrlc::Error);
impl_from_error!(WireError);
