//! Session budgets, timeouts and backend endpoints loaded from environment.

use std::time::Duration;

pub const DEFAULT_MAX_PROFILE_FETCH_ATTEMPTS: u32 = 5;
pub const DEFAULT_MAX_RECOVERY_ATTEMPTS: u32 = 5;
const DEFAULT_BACKOFF_BASE_MS: u64 = 1000;
const DEFAULT_CONNECTIVITY_TIMEOUT_MS: u64 = 3000;
const DEFAULT_PROFILE_READ_TIMEOUT_MS: u64 = 7000;
const DEFAULT_IDENTITY_TIMEOUT_MS: u64 = 5000;
const DEFAULT_PROFILE_INSERT_TIMEOUT_MS: u64 = 7000;
const DEFAULT_PROFILE_REREAD_TIMEOUT_MS: u64 = 5000;
const DEFAULT_AUTH_CALL_TIMEOUT_MS: u64 = 7000;
const DEFAULT_VALIDATION_INTERVAL_SECS: u64 = 15 * 60;
const DEFAULT_LOADING_WATCHDOG_MS: u64 = 10_000;
const DEFAULT_MIRROR_FRESHNESS_SECS: u64 = 24 * 60 * 60;
const DEFAULT_SKIP_CHECKS_MS: u64 = 3000;

/// Retry budgets and per-call deadlines for the session core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub max_profile_fetch_attempts: u32,
    pub max_recovery_attempts: u32,
    /// First retry delay; doubles after every failed attempt.
    pub backoff_base: Duration,
    pub connectivity_check: bool,
    pub connectivity_timeout: Duration,
    pub profile_read_timeout: Duration,
    pub identity_timeout: Duration,
    pub profile_insert_timeout: Duration,
    pub profile_reread_timeout: Duration,
    /// Deadline for sign-in, sign-up, sign-out and token refresh calls.
    pub auth_call_timeout: Duration,
    pub validation_interval: Duration,
    pub loading_watchdog: Duration,
    pub mirror_freshness: Duration,
    /// Corruption checks are suppressed this long after a sign-out.
    pub skip_checks_window: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_profile_fetch_attempts: DEFAULT_MAX_PROFILE_FETCH_ATTEMPTS,
            max_recovery_attempts: DEFAULT_MAX_RECOVERY_ATTEMPTS,
            backoff_base: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
            connectivity_check: true,
            connectivity_timeout: Duration::from_millis(DEFAULT_CONNECTIVITY_TIMEOUT_MS),
            profile_read_timeout: Duration::from_millis(DEFAULT_PROFILE_READ_TIMEOUT_MS),
            identity_timeout: Duration::from_millis(DEFAULT_IDENTITY_TIMEOUT_MS),
            profile_insert_timeout: Duration::from_millis(DEFAULT_PROFILE_INSERT_TIMEOUT_MS),
            profile_reread_timeout: Duration::from_millis(DEFAULT_PROFILE_REREAD_TIMEOUT_MS),
            auth_call_timeout: Duration::from_millis(DEFAULT_AUTH_CALL_TIMEOUT_MS),
            validation_interval: Duration::from_secs(DEFAULT_VALIDATION_INTERVAL_SECS),
            loading_watchdog: Duration::from_millis(DEFAULT_LOADING_WATCHDOG_MS),
            mirror_freshness: Duration::from_secs(DEFAULT_MIRROR_FRESHNESS_SECS),
            skip_checks_window: Duration::from_millis(DEFAULT_SKIP_CHECKS_MS),
        }
    }
}

impl SessionConfig {
    /// Build from `AUTH_*` environment variables, falling back to defaults
    /// for anything missing or unparseable.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parse = |key: &str, default: u64| -> u64 {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(default)
        };
        let parse_u32 = |key: &str, default: u32| -> u32 {
            lookup(key)
                .and_then(|v| v.trim().parse::<u32>().ok())
                .unwrap_or(default)
        };
        let millis = |key: &str, default: u64| Duration::from_millis(parse(key, default));
        let secs = |key: &str, default: u64| Duration::from_secs(parse(key, default));

        Self {
            max_profile_fetch_attempts: parse_u32(
                "AUTH_MAX_PROFILE_FETCH_ATTEMPTS",
                DEFAULT_MAX_PROFILE_FETCH_ATTEMPTS,
            ),
            max_recovery_attempts: parse_u32("AUTH_MAX_RECOVERY_ATTEMPTS", DEFAULT_MAX_RECOVERY_ATTEMPTS),
            backoff_base: millis("AUTH_BACKOFF_BASE_MS", DEFAULT_BACKOFF_BASE_MS),
            connectivity_check: lookup("AUTH_CONNECTIVITY_CHECK")
                .and_then(|raw| parse_bool(&raw))
                .unwrap_or(true),
            connectivity_timeout: millis("AUTH_CONNECTIVITY_TIMEOUT_MS", DEFAULT_CONNECTIVITY_TIMEOUT_MS),
            profile_read_timeout: millis("AUTH_PROFILE_READ_TIMEOUT_MS", DEFAULT_PROFILE_READ_TIMEOUT_MS),
            identity_timeout: millis("AUTH_IDENTITY_TIMEOUT_MS", DEFAULT_IDENTITY_TIMEOUT_MS),
            profile_insert_timeout: millis("AUTH_PROFILE_INSERT_TIMEOUT_MS", DEFAULT_PROFILE_INSERT_TIMEOUT_MS),
            profile_reread_timeout: millis("AUTH_PROFILE_REREAD_TIMEOUT_MS", DEFAULT_PROFILE_REREAD_TIMEOUT_MS),
            auth_call_timeout: millis("AUTH_CALL_TIMEOUT_MS", DEFAULT_AUTH_CALL_TIMEOUT_MS),
            validation_interval: secs("AUTH_VALIDATION_INTERVAL_SECS", DEFAULT_VALIDATION_INTERVAL_SECS),
            loading_watchdog: millis("AUTH_LOADING_WATCHDOG_MS", DEFAULT_LOADING_WATCHDOG_MS),
            mirror_freshness: secs("AUTH_MIRROR_FRESHNESS_SECS", DEFAULT_MIRROR_FRESHNESS_SECS),
            skip_checks_window: millis("AUTH_SKIP_CHECKS_MS", DEFAULT_SKIP_CHECKS_MS),
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// REST endpoint and public API key for the auth/record backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub base_url: String,
    pub anon_key: String,
}

impl BackendConfig {
    /// Load from `AUTH_BACKEND_URL` and `AUTH_BACKEND_ANON_KEY`.
    /// Returns `None` if either is missing.
    #[must_use]
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let base_url = lookup("AUTH_BACKEND_URL").filter(|v| !v.trim().is_empty())?;
        let anon_key = lookup("AUTH_BACKEND_ANON_KEY").filter(|v| !v.trim().is_empty())?;
        Some(Self { base_url: base_url.trim().trim_end_matches('/').to_string(), anon_key })
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
