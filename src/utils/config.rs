//! Configuration parameters struct parsing helper.

/// Composes a configuration struct from its default values, then overwrites
/// the listed fields with whatever the given TOML string sets, if it's not
/// `None`. Keys in the string that are not listed are rejected. Returns an
/// `Ok(config)` on success, and `Err(TallyError)` on parser failure.
///
/// Example:
/// ```no_compile
/// let config = parsed_config!(config_str => MyConfig; batch_size, file_path)?;
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let config_str: Option<&str> = $config_str;

        // closure helper for easier error returning
        let compose_config = || -> Result<$config_type, $crate::TallyError> {
            let mut config: $config_type = Default::default();
            let Some(config_str) = config_str else {
                return Ok(config);
            };

            let mut table = config_str.parse::<toml::Table>()?;

            $({
                if let Some(v) = table.remove(stringify!($field)) {
                    config.$field = v.try_into()?;
                }
            })+

            // leftover keys are not expected hence invalid
            if let Some(key) = table.keys().next() {
                return Err($crate::TallyError::msg(format!(
                    "invalid field name '{}' in config",
                    key
                )));
            }

            Ok(config)
        };

        compose_config()
    }};
}
