//! Observable auth state with stale-write rejection.
//!
//! DESIGN
//! ======
//! `StateStore` owns the externally visible [`AuthSnapshot`] plus the
//! bookkeeping the core needs around it: the current [`Session`], the
//! monotonic [`AuthStateVersion`], and the last successful validation time.
//!
//! Every accepted session replacement or clear bumps the version. Async work
//! (profile loads, recovery) captures the version before suspending and
//! commits through [`StateStore::commit_profile`], which discards the result
//! if the version moved in the meantime. Ordering is by version, not by
//! completion order.
//!
//! `is_authenticated` is never written directly; it is derived from `user`
//! on every publish.

use std::sync::Mutex;

use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::debug;

use crate::backend::{AuthUser, UserProfile};

/// Monotonic counter bumped on every accepted session replacement.
pub type AuthStateVersion = u64;

/// Backend-confirmed login, replaced wholesale and never edited in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
    pub email: String,
    pub issued_version: AuthStateVersion,
}

/// What the rest of the application sees.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthSnapshot {
    pub is_authenticated: bool,
    pub is_loading: bool,
    pub user: Option<AuthUser>,
    pub user_profile: Option<UserProfile>,
    pub is_state_corrupted: bool,
    pub is_fetching_profile: bool,
}

impl Default for AuthSnapshot {
    fn default() -> Self {
        Self {
            is_authenticated: false,
            is_loading: true,
            user: None,
            user_profile: None,
            is_state_corrupted: false,
            is_fetching_profile: false,
        }
    }
}

pub struct StateStore {
    inner: Mutex<StoreInner>,
    tx: watch::Sender<AuthSnapshot>,
}

struct StoreInner {
    snapshot: AuthSnapshot,
    session: Option<Session>,
    version: AuthStateVersion,
    last_validation: Option<OffsetDateTime>,
    fetches_in_flight: u32,
    /// Session version for which a missing profile is accepted.
    profile_tolerated: Option<AuthStateVersion>,
}

impl StateStore {
    #[must_use]
    pub fn new() -> Self {
        let snapshot = AuthSnapshot::default();
        let (tx, _rx) = watch::channel(snapshot.clone());
        Self {
            inner: Mutex::new(StoreInner {
                snapshot,
                session: None,
                version: 0,
                last_validation: None,
                fetches_in_flight: 0,
                profile_tolerated: None,
            }),
            tx,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Mutate under the lock, then publish the derived snapshot.
    fn update<R>(&self, f: impl FnOnce(&mut StoreInner) -> R) -> R {
        let mut inner = self.lock();
        let result = f(&mut inner);
        inner.snapshot.is_authenticated = inner.snapshot.user.is_some();
        inner.snapshot.is_fetching_profile = inner.fetches_in_flight > 0;
        let next = inner.snapshot.clone();
        self.tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        result
    }

    // =========================================================================
    // READS
    // =========================================================================

    #[must_use]
    pub fn snapshot(&self) -> AuthSnapshot {
        self.lock().snapshot.clone()
    }

    /// Change stream. Unchanged writes do not wake receivers.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<AuthSnapshot> {
        self.tx.subscribe()
    }

    #[must_use]
    pub fn version(&self) -> AuthStateVersion {
        self.lock().version
    }

    #[must_use]
    pub fn session(&self) -> Option<Session> {
        self.lock().session.clone()
    }

    #[must_use]
    pub fn user(&self) -> Option<AuthUser> {
        self.lock().snapshot.user.clone()
    }

    #[must_use]
    pub fn last_validation(&self) -> Option<OffsetDateTime> {
        self.lock().last_validation
    }

    #[must_use]
    pub fn profile_tolerated(&self) -> bool {
        let inner = self.lock();
        inner.profile_tolerated == Some(inner.version)
    }

    // =========================================================================
    // SESSION TRANSITIONS
    // =========================================================================

    /// Replace the session with `user`. The profile is kept only when the
    /// identity is unchanged.
    pub fn accept_session(&self, user: AuthUser, now: OffsetDateTime) -> AuthStateVersion {
        self.update(|inner| {
            inner.version += 1;
            let same_identity = inner
                .snapshot
                .user
                .as_ref()
                .is_some_and(|current| current.id == user.id);
            if !same_identity {
                inner.snapshot.user_profile = None;
            }
            inner.session =
                Some(Session { user_id: user.id.clone(), email: user.email.clone(), issued_version: inner.version });
            inner.snapshot.user = Some(user);
            inner.last_validation = Some(now);
            inner.profile_tolerated = None;
            inner.version
        })
    }

    /// Update cached identity fields without replacing the session. Only
    /// applies when id and email are unchanged; returns whether it applied.
    pub fn refresh_user_fields(&self, user: AuthUser, now: OffsetDateTime) -> bool {
        self.update(|inner| {
            let unchanged = inner
                .session
                .as_ref()
                .is_some_and(|s| s.user_id == user.id && s.email == user.email);
            if unchanged {
                inner.snapshot.user = Some(user);
                inner.last_validation = Some(now);
            }
            unchanged
        })
    }

    /// Drop session, user and profile.
    pub fn clear_session(&self, now: OffsetDateTime) -> AuthStateVersion {
        self.update(|inner| {
            inner.version += 1;
            inner.session = None;
            inner.snapshot.user = None;
            inner.snapshot.user_profile = None;
            inner.snapshot.is_state_corrupted = false;
            inner.last_validation = Some(now);
            inner.profile_tolerated = None;
            inner.version
        })
    }

    pub fn touch_validation(&self, now: OffsetDateTime) {
        self.lock().last_validation = Some(now);
    }

    // =========================================================================
    // PROFILE
    // =========================================================================

    pub fn begin_profile_fetch(&self) {
        self.update(|inner| inner.fetches_in_flight += 1);
    }

    pub fn finish_profile_fetch(&self) {
        self.update(|inner| inner.fetches_in_flight = inner.fetches_in_flight.saturating_sub(1));
    }

    /// Store `profile` if `expected` is still the current version and the
    /// profile belongs to the current user. Returns whether it was applied.
    pub fn commit_profile(&self, expected: AuthStateVersion, profile: UserProfile) -> bool {
        self.update(|inner| {
            if inner.version != expected {
                debug!(expected, current = inner.version, "discarding stale profile result");
                return false;
            }
            let owner_matches = inner
                .snapshot
                .user
                .as_ref()
                .is_some_and(|u| u.id == profile.id);
            if !owner_matches {
                debug!(profile_id = %profile.id, "discarding profile for a different user");
                return false;
            }
            inner.snapshot.user_profile = Some(profile);
            true
        })
    }

    /// Accept a missing profile for the session issued at `expected`.
    pub fn tolerate_missing_profile(&self, expected: AuthStateVersion) -> bool {
        self.update(|inner| {
            if inner.version != expected {
                return false;
            }
            inner.profile_tolerated = Some(expected);
            true
        })
    }

    // =========================================================================
    // FLAGS
    // =========================================================================

    pub fn set_loading(&self, loading: bool) {
        self.update(|inner| inner.snapshot.is_loading = loading);
    }

    pub fn set_corrupted(&self, corrupted: bool) {
        self.update(|inner| inner.snapshot.is_state_corrupted = corrupted);
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "state_test.rs"]
mod tests;
