//! Recovery coordinator: bounded re-establishment of a valid session.
//!
//! STATE MACHINE
//! =============
//! ```text
//! IDLE ──► ATTEMPTING_REFRESH ──► ATTEMPTING_LOCAL_CACHE ──► (fail)
//!   ▲            │ ok                     │ ok                   │
//!   │            ▼                        ▼                      ▼
//!   └──────── recovered ◄─────────────────┘     non-critical: give back attempt, IDLE
//!   │                                           protected: back off, retry
//!   └──────────────── EXHAUSTED (forced sign-out) ◄── attempts >= max
//! ```
//!
//! The attempt counter lives on the instance. It is reset on success, on
//! the home route, and after a forced sign-out; on non-critical routes a
//! failed attempt is handed back instead of burned.

use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::backend::{AuthBackend, AuthUser};
use crate::clock::{Clock, timed};
use crate::config::SessionConfig;
use crate::mirror::LocalArtifacts;
use crate::route::{Navigator, RouteClass};
use crate::services::profile::{ProfileLoader, ProfileSync};
use crate::services::signout::SignOutService;
use crate::state::StateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPhase {
    Idle,
    AttemptingRefresh,
    AttemptingLocalCache,
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Recovered,
    NotRecovered,
    /// Invoked on the home route; nothing attempted.
    Aborted,
    /// Budget spent (or profile sign-out); the user is signed out.
    SignedOut,
}

/// What the next step of a recovery run should be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPlan {
    Abort,
    ForceSignOut,
    Attempt,
}

/// Decide the next step from the route and attempts already made.
#[must_use]
pub fn plan(route: RouteClass, attempts: u32, max: u32) -> RecoveryPlan {
    if route == RouteClass::Home {
        RecoveryPlan::Abort
    } else if attempts >= max {
        RecoveryPlan::ForceSignOut
    } else {
        RecoveryPlan::Attempt
    }
}

struct Progress {
    phase: RecoveryPhase,
    attempts: u32,
}

pub struct RecoveryCoordinator {
    backend: Arc<dyn AuthBackend>,
    state: Arc<StateStore>,
    artifacts: LocalArtifacts,
    navigator: Arc<dyn Navigator>,
    loader: Arc<ProfileLoader>,
    sign_out: Arc<SignOutService>,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
    progress: Mutex<Progress>,
}

impl RecoveryCoordinator {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backend: Arc<dyn AuthBackend>,
        state: Arc<StateStore>,
        artifacts: LocalArtifacts,
        navigator: Arc<dyn Navigator>,
        loader: Arc<ProfileLoader>,
        sign_out: Arc<SignOutService>,
        clock: Arc<dyn Clock>,
        config: SessionConfig,
    ) -> Self {
        Self {
            backend,
            state,
            artifacts,
            navigator,
            loader,
            sign_out,
            clock,
            config,
            progress: Mutex::new(Progress { phase: RecoveryPhase::Idle, attempts: 0 }),
        }
    }

    fn progress(&self) -> std::sync::MutexGuard<'_, Progress> {
        self.progress
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[must_use]
    pub fn phase(&self) -> RecoveryPhase {
        self.progress().phase
    }

    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.progress().attempts
    }

    fn set_phase(&self, phase: RecoveryPhase) {
        self.progress().phase = phase;
    }

    /// Back to IDLE with a full budget.
    pub fn reset(&self) {
        let mut progress = self.progress();
        progress.phase = RecoveryPhase::Idle;
        progress.attempts = 0;
    }

    /// Run recovery until it succeeds, gives up for this route, or exhausts
    /// the budget and forces a sign-out.
    pub async fn recover(&self, reason: &str) -> RecoveryOutcome {
        let max = self.config.max_recovery_attempts;
        let mut backoff = self.config.backoff_base;

        loop {
            let route = self.navigator.route_class();
            let attempts = self.attempts();

            match plan(route, attempts, max) {
                RecoveryPlan::Abort => {
                    debug!(reason, "recovery skipped on home route");
                    self.reset();
                    return RecoveryOutcome::Aborted;
                }
                RecoveryPlan::ForceSignOut => {
                    self.set_phase(RecoveryPhase::Exhausted);
                    warn!(reason, attempts, max, "recovery budget exhausted");
                    self.sign_out.force("recovery exhausted").await;
                    self.reset();
                    return RecoveryOutcome::SignedOut;
                }
                RecoveryPlan::Attempt => {}
            }

            let attempt = {
                let mut progress = self.progress();
                progress.attempts += 1;
                progress.attempts
            };
            info!(reason, attempt, max, ?route, "attempting session recovery");

            if let Some(outcome) = self.attempt_once().await {
                self.reset();
                return outcome;
            }

            if route.is_non_critical() {
                let mut progress = self.progress();
                progress.attempts = progress.attempts.saturating_sub(1);
                progress.phase = RecoveryPhase::Idle;
                debug!(reason, ?route, "recovery failed on non-critical route; attempt returned");
                return RecoveryOutcome::NotRecovered;
            }

            if attempt < max {
                self.clock.sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
        }
    }

    /// One pass through refresh then local cache. `None` means both failed.
    async fn attempt_once(&self) -> Option<RecoveryOutcome> {
        self.set_phase(RecoveryPhase::AttemptingRefresh);
        if let Some(user) = self.try_refresh().await {
            return Some(self.adopt(user, "token refresh").await);
        }

        self.set_phase(RecoveryPhase::AttemptingLocalCache);
        if let Some(user) = self.try_local_cache().await {
            return Some(self.adopt(user, "identity mirror").await);
        }

        None
    }

    async fn try_refresh(&self) -> Option<AuthUser> {
        match timed(self.clock.as_ref(), self.config.auth_call_timeout, "token refresh", self.backend.refresh_session())
            .await
        {
            Ok(Some(user)) if user.is_valid() => Some(user),
            Ok(Some(user)) => {
                warn!(user_id = %user.id, "refresh returned malformed identity");
                None
            }
            Ok(None) => {
                debug!("refresh returned no session");
                None
            }
            Err(e) => {
                debug!(error = %e, "token refresh failed");
                None
            }
        }
    }

    async fn try_local_cache(&self) -> Option<AuthUser> {
        let mirror = self.artifacts.load_identity()?;
        match timed(self.clock.as_ref(), self.config.identity_timeout, "identity check", self.backend.get_current_user())
            .await
        {
            Ok(Some(user)) if user.id == mirror.id && user.is_valid() => Some(user),
            Ok(Some(user)) => {
                warn!(mirror_id = %mirror.id, backend_id = %user.id, "identity mirror does not match backend");
                None
            }
            Ok(None) => None,
            Err(e) => {
                debug!(error = %e, "identity check for mirror promotion failed");
                None
            }
        }
    }

    async fn adopt(&self, user: AuthUser, source: &'static str) -> RecoveryOutcome {
        let version = self.state.accept_session(user.clone(), self.clock.now());
        self.artifacts.save_identity(&user);
        info!(user_id = %user.id, version, source, "session recovered");

        match self.loader.sync(version, &user.id).await {
            ProfileSync::SignedOut => RecoveryOutcome::SignedOut,
            ProfileSync::Loaded | ProfileSync::Tolerated | ProfileSync::Stale => RecoveryOutcome::Recovered,
        }
    }
}

#[cfg(test)]
#[path = "recovery_test.rs"]
mod tests;
