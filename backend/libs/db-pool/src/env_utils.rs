//! Pool sizing overrides read from the environment

use std::fmt::Display;
use std::str::FromStr;
use tracing::warn;

/// Value of `key`, or `default` when it is unset or does not parse.
pub(crate) fn parse_env_with_default<T>(key: &str, default: T) -> T
where
    T: FromStr + Display,
{
    let Ok(raw) = std::env::var(key) else {
        return default;
    };
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            warn!(key, value = %raw, default = %default, "Ignoring unparseable pool override");
            default
        }
    }
}
