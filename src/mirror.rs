//! Local identity artifacts: the identity mirror, the persisted
//! profile-fetch budget, and the post-sign-out skip window.
//!
//! All reads degrade to "absent" on storage failure; a broken local cache
//! must never block sign-in, it only disables optimistic recovery.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::AuthUser;
use crate::clock::{Clock, unix_millis};
use crate::storage::KeyValueStore;

pub const IDENTITY_MIRROR_KEY: &str = "authkeeper.identity";
pub const PROFILE_FETCH_ATTEMPTS_KEY: &str = "authkeeper.profile_fetch_attempts";
pub const SKIP_CHECKS_KEY: &str = "authkeeper.skip_checks";

/// Cached `{id, email, timestamp}` of the last confirmed identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityMirror {
    pub id: String,
    pub email: String,
    /// Unix millis when the identity was last confirmed.
    pub timestamp: i64,
}

impl IdentityMirror {
    #[must_use]
    pub fn to_user(&self) -> AuthUser {
        AuthUser::new(self.id.clone(), self.email.clone())
    }
}

#[derive(Clone)]
pub struct LocalArtifacts {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    freshness: Duration,
    skip_window: Duration,
}

impl LocalArtifacts {
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, freshness: Duration, skip_window: Duration) -> Self {
        Self { store, clock, freshness, skip_window }
    }

    // =========================================================================
    // IDENTITY MIRROR
    // =========================================================================

    /// Record `user` as the last confirmed identity, stamped now.
    pub fn save_identity(&self, user: &AuthUser) {
        if !user.is_valid() {
            warn!(user_id = %user.id, "refusing to mirror malformed identity");
            return;
        }
        let mirror =
            IdentityMirror { id: user.id.clone(), email: user.email.clone(), timestamp: unix_millis(self.clock.now()) };
        let raw = match serde_json::to_string(&mirror) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "identity mirror encode failed");
                return;
            }
        };
        if let Err(e) = self.store.set(IDENTITY_MIRROR_KEY, &raw, None) {
            warn!(error = %e, "identity mirror write failed");
        }
    }

    /// The mirrored identity, if present, well-formed and younger than the
    /// freshness window. Stale or malformed mirrors are deleted.
    #[must_use]
    pub fn load_identity(&self) -> Option<IdentityMirror> {
        let raw = match self.store.get(IDENTITY_MIRROR_KEY) {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(error = %e, "identity mirror read failed");
                return None;
            }
        };

        let Ok(mirror) = serde_json::from_str::<IdentityMirror>(&raw) else {
            warn!("identity mirror unreadable; discarding");
            self.remove(IDENTITY_MIRROR_KEY);
            return None;
        };

        if !mirror.to_user().is_valid() {
            warn!(user_id = %mirror.id, "identity mirror malformed; discarding");
            self.remove(IDENTITY_MIRROR_KEY);
            return None;
        }

        let age_ms = unix_millis(self.clock.now()).saturating_sub(mirror.timestamp);
        let freshness_ms = i64::try_from(self.freshness.as_millis()).unwrap_or(i64::MAX);
        if age_ms > freshness_ms {
            debug!(user_id = %mirror.id, age_ms, "identity mirror stale; discarding");
            self.remove(IDENTITY_MIRROR_KEY);
            return None;
        }

        Some(mirror)
    }

    // =========================================================================
    // PROFILE FETCH BUDGET
    // =========================================================================

    #[must_use]
    pub fn profile_fetch_attempts(&self) -> u32 {
        match self.store.get(PROFILE_FETCH_ATTEMPTS_KEY) {
            Ok(raw) => raw.and_then(|v| v.trim().parse().ok()).unwrap_or(0),
            Err(e) => {
                warn!(error = %e, "profile fetch counter read failed");
                0
            }
        }
    }

    pub fn set_profile_fetch_attempts(&self, attempts: u32) {
        if let Err(e) = self.store.set(PROFILE_FETCH_ATTEMPTS_KEY, &attempts.to_string(), None) {
            warn!(error = %e, attempts, "profile fetch counter write failed");
        }
    }

    pub fn reset_profile_fetch_attempts(&self) {
        self.remove(PROFILE_FETCH_ATTEMPTS_KEY);
    }

    // =========================================================================
    // SKIP WINDOW
    // =========================================================================

    /// Suppress corruption checks for the configured window.
    pub fn begin_skip_checks(&self) {
        if let Err(e) = self.store.set(SKIP_CHECKS_KEY, "1", Some(self.skip_window)) {
            warn!(error = %e, "skip-checks flag write failed");
        }
    }

    #[must_use]
    pub fn skip_checks_active(&self) -> bool {
        matches!(self.store.get(SKIP_CHECKS_KEY), Ok(Some(_)))
    }

    // =========================================================================
    // TEARDOWN
    // =========================================================================

    /// Drop the mirror and the fetch budget. The skip window survives so the
    /// redirect that follows a sign-out is not re-checked. Session tokens are
    /// the backend's to drop; its `sign_out` still needs them to revoke.
    pub fn clear_identity(&self) {
        self.remove(IDENTITY_MIRROR_KEY);
        self.remove(PROFILE_FETCH_ATTEMPTS_KEY);
    }

    fn remove(&self, key: &str) {
        if let Err(e) = self.store.remove(key) {
            warn!(error = %e, key, "local artifact removal failed");
        }
    }
}

#[cfg(test)]
#[path = "mirror_test.rs"]
mod tests;
