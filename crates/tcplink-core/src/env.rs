//! Environment variable helpers for `TCPLINK_*` overrides
//!
//! ```ignore
//! use tcplink_core::env::{env_get, env_get_bool, env_get_millis};
//!
//! let backlog: i32 = env_get("TCPLINK_BACKLOG", 4000);
//! let select = env_get_bool("TCPLINK_KEEPALIVE_SELECT", true);
//! let timeout = env_get_millis("TCPLINK_KEEPALIVE_TIMEOUT_MS", Duration::from_secs(120));
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Parse `key` as `T`, falling back to `default` when unset or malformed
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Boolean flag. Accepts "1", "true", "yes", "on" and "0", "false", "no", "off".
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// Duration given in milliseconds
#[inline]
pub fn env_get_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let v: usize = env_get("__TCPLINK_TEST_NONEXISTENT__", 42);
        assert_eq!(v, 42);
    }

    #[test]
    fn test_env_get_set() {
        std::env::set_var("__TCPLINK_TEST_USIZE__", " 123 ");
        let v: usize = env_get("__TCPLINK_TEST_USIZE__", 0);
        assert_eq!(v, 123);
        std::env::remove_var("__TCPLINK_TEST_USIZE__");
    }

    #[test]
    fn test_env_get_invalid() {
        std::env::set_var("__TCPLINK_TEST_INVALID__", "not_a_number");
        let v: usize = env_get("__TCPLINK_TEST_INVALID__", 99);
        assert_eq!(v, 99);
        std::env::remove_var("__TCPLINK_TEST_INVALID__");
    }

    #[test]
    fn test_env_get_bool() {
        std::env::set_var("__TCPLINK_TEST_BOOL__", "off");
        assert!(!env_get_bool("__TCPLINK_TEST_BOOL__", true));
        std::env::set_var("__TCPLINK_TEST_BOOL__", "YES");
        assert!(env_get_bool("__TCPLINK_TEST_BOOL__", false));
        std::env::set_var("__TCPLINK_TEST_BOOL__", "maybe");
        assert!(env_get_bool("__TCPLINK_TEST_BOOL__", true));
        std::env::remove_var("__TCPLINK_TEST_BOOL__");
    }

    #[test]
    fn test_env_get_millis() {
        std::env::set_var("__TCPLINK_TEST_MS__", "250");
        assert_eq!(
            env_get_millis("__TCPLINK_TEST_MS__", Duration::ZERO),
            Duration::from_millis(250)
        );
        std::env::remove_var("__TCPLINK_TEST_MS__");
        assert_eq!(
            env_get_millis("__TCPLINK_TEST_MS__", Duration::from_secs(1)),
            Duration::from_secs(1)
        );
    }
}
