//! Environment-driven configuration helpers.

use std::str::FromStr;
use std::time::Duration;

/// Read `key` from the environment and parse it, falling back to `default`
/// when unset or unparsable.
pub fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

pub fn env_millis(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_or(key, default_ms))
}

pub fn env_secs(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(env_or(key, default_secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_on_missing_or_garbage() {
        assert_eq!(env_or("KEEL_TEST_UNSET_VAR_XYZ", 7usize), 7);
        std::env::set_var("KEEL_TEST_GARBAGE_VAR", "not-a-number");
        assert_eq!(env_or("KEEL_TEST_GARBAGE_VAR", 3u64), 3);
        std::env::set_var("KEEL_TEST_SET_VAR", " 42 ");
        assert_eq!(env_or("KEEL_TEST_SET_VAR", 3u64), 42);
    }
}
