//! Profile loader: fetch-or-create of the profile row for an identity.
//!
//! DESIGN
//! ======
//! One logical call makes at most `max_profile_fetch_attempts` attempts.
//! Each attempt is:
//!
//! 1. optional connectivity check (non-fatal),
//! 2. read by id; found ends the call, not-found moves to creation,
//! 3. re-confirm the identity with the auth backend,
//! 4. insert a profile seeded from that identity; a duplicate key is
//!    resolved by re-reading.
//!
//! Failed attempts sleep with exponential backoff. The attempt count is
//! persisted so a reload mid-storm does not get a fresh budget; entering
//! the auth callback route resets it.
//!
//! ERROR HANDLING
//! ==============
//! Nothing here returns an error. Exhaustion yields `None`; what that means
//! for the session depends on the route and is decided in [`ProfileLoader::sync`].

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::backend::{AuthBackend, BackendError, NewProfile, RecordStore, UserProfile};
use crate::clock::{Clock, timed};
use crate::config::SessionConfig;
use crate::mirror::LocalArtifacts;
use crate::route::{Navigator, PROFILE_FETCH_FAILED_ROUTE, RouteClass};
use crate::services::signout::SignOutService;
use crate::state::{AuthStateVersion, StateStore};

/// How a profile load ended, as seen by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileSync {
    /// Profile stored for the current session.
    Loaded,
    /// The session changed while loading; the result was discarded.
    Stale,
    /// Budget exhausted on a non-protected route; missing profile accepted.
    Tolerated,
    /// Budget exhausted on a protected route; the user was signed out.
    SignedOut,
}

#[derive(Debug, thiserror::Error)]
enum AttemptError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("auth backend returned no identity")]
    NoIdentity,
    #[error("auth backend identity {0} does not match requested profile")]
    IdentityMismatch(String),
}

pub struct ProfileLoader {
    backend: Arc<dyn AuthBackend>,
    records: Arc<dyn RecordStore>,
    state: Arc<StateStore>,
    artifacts: LocalArtifacts,
    navigator: Arc<dyn Navigator>,
    sign_out: Arc<SignOutService>,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
}

impl ProfileLoader {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backend: Arc<dyn AuthBackend>,
        records: Arc<dyn RecordStore>,
        state: Arc<StateStore>,
        artifacts: LocalArtifacts,
        navigator: Arc<dyn Navigator>,
        sign_out: Arc<SignOutService>,
        clock: Arc<dyn Clock>,
        config: SessionConfig,
    ) -> Self {
        Self { backend, records, state, artifacts, navigator, sign_out, clock, config }
    }

    /// Fetch the profile for `user_id`, creating it if absent.
    ///
    /// Returns `None` once the attempt budget is spent. Every call made while
    /// the current route is the auth callback starts from a fresh budget.
    pub async fn fetch_or_create(&self, user_id: &str) -> Option<UserProfile> {
        if user_id.trim().is_empty() {
            warn!("profile fetch requested without a user id");
            return None;
        }

        if self.navigator.route_class() == RouteClass::AuthCallback {
            debug!("auth callback route; resetting profile fetch budget");
            self.artifacts.reset_profile_fetch_attempts();
        }

        self.state.begin_profile_fetch();
        let profile = self.run_attempts(user_id).await;
        self.state.finish_profile_fetch();
        profile
    }

    async fn run_attempts(&self, user_id: &str) -> Option<UserProfile> {
        let max = self.config.max_profile_fetch_attempts;
        let mut backoff = self.config.backoff_base;
        let mut attempts = self.artifacts.profile_fetch_attempts();

        while attempts < max {
            attempts += 1;
            self.artifacts.set_profile_fetch_attempts(attempts);

            match self.attempt(user_id).await {
                Ok(profile) => {
                    self.artifacts.reset_profile_fetch_attempts();
                    info!(user_id, attempt = attempts, "profile loaded");
                    return Some(profile);
                }
                Err(e) => {
                    warn!(user_id, attempt = attempts, max, error = %e, "profile attempt failed");
                }
            }

            if attempts < max {
                self.clock.sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
        }

        warn!(user_id, max, "profile fetch budget exhausted");
        None
    }

    async fn attempt(&self, user_id: &str) -> Result<UserProfile, AttemptError> {
        let clock = self.clock.as_ref();
        let cfg = &self.config;

        if cfg.connectivity_check {
            if let Err(e) = timed(clock, cfg.connectivity_timeout, "connectivity check", self.records.ping()).await {
                debug!(error = %e, "connectivity check failed; continuing");
            }
        }

        match timed(clock, cfg.profile_read_timeout, "profile read", self.records.read_profile(user_id)).await {
            Ok(profile) => return Ok(profile),
            Err(BackendError::NotFound) => debug!(user_id, "profile missing; creating"),
            Err(e) => return Err(e.into()),
        }

        let identity = timed(clock, cfg.identity_timeout, "identity check", self.backend.get_current_user())
            .await?
            .ok_or(AttemptError::NoIdentity)?;
        if identity.id != user_id {
            return Err(AttemptError::IdentityMismatch(identity.id));
        }

        let seed = NewProfile::from_user(&identity);
        match timed(clock, cfg.profile_insert_timeout, "profile insert", self.records.insert_profile(&seed)).await {
            Ok(profile) => {
                info!(user_id, "profile created");
                Ok(profile)
            }
            Err(BackendError::DuplicateKey) => {
                debug!(user_id, "profile created concurrently; re-reading");
                let profile =
                    timed(clock, cfg.profile_reread_timeout, "profile re-read", self.records.read_profile(user_id))
                        .await?;
                Ok(profile)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Load the profile for the session issued at `version` and apply the
    /// exhaustion policy for the current route.
    pub async fn sync(&self, version: AuthStateVersion, user_id: &str) -> ProfileSync {
        if let Some(profile) = self.fetch_or_create(user_id).await {
            return if self.state.commit_profile(version, profile) { ProfileSync::Loaded } else { ProfileSync::Stale };
        }

        if self.state.version() != version {
            return ProfileSync::Stale;
        }

        let route = self.navigator.route_class();
        if route == RouteClass::Protected {
            error!(user_id, route = %self.navigator.current_route(), "profile unavailable on protected route; signing out");
            if let Err(e) = self.sign_out.sign_out(true).await {
                warn!(error = %e, "silent sign-out reported a remote failure");
            }
            self.navigator.navigate(PROFILE_FETCH_FAILED_ROUTE);
            ProfileSync::SignedOut
        } else {
            warn!(user_id, ?route, "profile unavailable on public route; tolerating");
            if self.state.tolerate_missing_profile(version) { ProfileSync::Tolerated } else { ProfileSync::Stale }
        }
    }
}

#[cfg(test)]
#[path = "profile_test.rs"]
mod tests;
