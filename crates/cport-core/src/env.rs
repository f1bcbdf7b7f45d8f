//! Environment variable helpers for `CPORT_*` overrides
//!
//! ```ignore
//! use cport_core::env::{env_get, env_get_ms};
//!
//! let workers: usize = env_get("CPORT_NUM_WORKERS", 4);
//! let park = env_get_ms("CPORT_PARK_TIMEOUT_MS", Duration::from_millis(10));
//! ```
//!
//! A variable that is set but does not parse falls back to the default and
//! logs a warning, so a typo never silently changes behavior.

use std::str::FromStr;
use std::time::Duration;

/// Get environment variable parsed as `T`, or return `default`.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(key, value = %raw, "ignoring unparsable environment override");
                default
            }
        },
        Err(_) => default,
    }
}

/// Get environment variable as boolean.
///
/// "1", "true", "yes", "on" (any case) are true; "0", "false", "no", "off"
/// are false. Anything else keeps the default.
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

/// Get environment variable as `Some(T)` if set and parsable.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Get a millisecond count as a `Duration`.
#[inline]
pub fn env_get_ms(key: &str, default: Duration) -> Duration {
    Duration::from_millis(env_get(key, default.as_millis() as u64))
}
