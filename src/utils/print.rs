//! Prefixed logging macros on top of `log`.

use std::sync::OnceLock;

use env_logger::Env;

/// Process identity shown in front of every log line, e.g. "center".
pub static ME: OnceLock<String> = OnceLock::new();

/// Logs at the given `log::Level` with the `(ME)` prefix. Backs the
/// `pf_*` family below.
#[doc(hidden)]
#[macro_export]
macro_rules! pf_log {
    ($lvl:expr, $($fmt_args:tt)*) => {
        log::log!(
            $lvl,
            "({}) {}",
            $crate::ME.get().map_or("-", |me| me.as_str()),
            format!($($fmt_args)*)
        )
    };
}

/// Log TRACE message with parenthesized prefix.
///
/// Example:
/// ```no_compile
/// pf_trace!("frame bytes {:?}", buf);
/// ```
#[macro_export]
macro_rules! pf_trace {
    ($($fmt_args:tt)*) => { $crate::pf_log!(log::Level::Trace, $($fmt_args)*) };
}

/// Log DEBUG message with parenthesized prefix.
///
/// Example:
/// ```no_compile
/// pf_debug!("batch of {} bets", n);
/// ```
#[macro_export]
macro_rules! pf_debug {
    ($($fmt_args:tt)*) => { $crate::pf_log!(log::Level::Debug, $($fmt_args)*) };
}

/// Log INFO message with parenthesized prefix.
///
/// Example:
/// ```no_compile
/// pf_info!("agency {} registered", id);
/// ```
#[macro_export]
macro_rules! pf_info {
    ($($fmt_args:tt)*) => { $crate::pf_log!(log::Level::Info, $($fmt_args)*) };
}

/// Log WARN message with parenthesized prefix.
///
/// Example:
/// ```no_compile
/// pf_warn!("torn record at offset {}", offset);
/// ```
#[macro_export]
macro_rules! pf_warn {
    ($($fmt_args:tt)*) => { $crate::pf_log!(log::Level::Warn, $($fmt_args)*) };
}

/// Log ERROR message with parenthesized prefix.
///
/// Example:
/// ```no_compile
/// pf_error!("dropping {}: {}", label, e);
/// ```
#[macro_export]
macro_rules! pf_error {
    ($($fmt_args:tt)*) => { $crate::pf_log!(log::Level::Error, $($fmt_args)*) };
}

/// Sets up `env_logger` (INFO unless `RUST_LOG` says otherwise). Repeated
/// calls are no-ops.
pub fn logger_init() {
    let _ =
        env_logger::Builder::from_env(Env::default().default_filter_or("info"))
            .format_timestamp(None)
            .format_module_path(false)
            .format_target(false)
            .try_init();
}

/// Logs the message as an error and evaluates to `Err(TallyError)` holding
/// the same text.
///
/// Example:
/// ```no_compile
/// return logged_err!("invalid max_agencies {}", n);
/// ```
#[macro_export]
macro_rules! logged_err {
    ($($fmt_args:tt)*) => {
        {
            $crate::pf_error!($($fmt_args)*);
            Err($crate::TallyError::msg(format!($($fmt_args)*)))
        }
    };
}
