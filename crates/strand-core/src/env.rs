//! Environment variable helpers
//!
//! Typed `env_get<T>` parsing with defaults, used by config and settings.

use std::str::FromStr;

/// Parse an environment variable as `T`, falling back to `default` when
/// unset or unparsable.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Boolean variant; "1", "true", "yes", "on" (any case) are true, anything
/// else set is false, unset returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// `Some(T)` when the variable is set and parses, `None` otherwise.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// String variant without the `FromStr` bound.
#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Whether the variable is set at all.
#[inline]
pub fn env_is_set(key: &str) -> bool {
    std::env::var(key).is_ok()
}
