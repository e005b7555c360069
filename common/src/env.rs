//! Typed environment-variable getters.
//!
//! Both binaries are configured entirely through environment variables (plus
//! the server's YAML accounts file). Every option has a compiled default; a
//! set-but-unparsable value falls back to the default with a warning rather
//! than aborting startup.

use std::fmt::Display;
use std::str::FromStr;

use tracing::warn;

/// Read a string option, falling back to `default` when unset.
pub fn env_value(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Read an option that is absent unless explicitly set (e.g. `CLIENT_IP_HEADER`).
pub fn env_value_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Read and parse a numeric option.
pub fn env_value_parsed<T>(key: &str, default: T) -> T
where
    T: FromStr + Display + Copy,
{
    match std::env::var(key) {
        Ok(raw) => match raw.parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!("{key}={raw} is not a valid value, using default {default}");
                default
            }
        },
        Err(_) => default,
    }
}

/// Read a boolean option. Only the literal string `true` (any case) enables it.
pub fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(raw) => raw.eq_ignore_ascii_case("true"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_defaults_when_unset() {
        assert_eq!(env_value("STREAMSOCKETS_TEST_UNSET", "fallback"), "fallback");
        assert_eq!(env_value_opt("STREAMSOCKETS_TEST_UNSET"), None);
    }

    #[test]
    fn parsed_value_roundtrips() {
        std::env::set_var("STREAMSOCKETS_TEST_PORT", "9001");
        assert_eq!(env_value_parsed("STREAMSOCKETS_TEST_PORT", 8080u16), 9001);
        std::env::remove_var("STREAMSOCKETS_TEST_PORT");
    }

    #[test]
    fn unparsable_value_falls_back() {
        std::env::set_var("STREAMSOCKETS_TEST_BAD", "not-a-number");
        assert_eq!(env_value_parsed("STREAMSOCKETS_TEST_BAD", 42u32), 42);
        std::env::remove_var("STREAMSOCKETS_TEST_BAD");
    }

    #[test]
    fn flag_requires_literal_true() {
        std::env::set_var("STREAMSOCKETS_TEST_FLAG", "TRUE");
        assert!(env_flag("STREAMSOCKETS_TEST_FLAG", false));
        std::env::set_var("STREAMSOCKETS_TEST_FLAG", "1");
        assert!(!env_flag("STREAMSOCKETS_TEST_FLAG", true));
        std::env::remove_var("STREAMSOCKETS_TEST_FLAG");
    }
}
