//! Session watcher: turns backend lifecycle events into state transitions.
//!
//! DESIGN
//! ======
//! The watcher is driven by the manager's single run loop, one event at a
//! time, so its transitions never interleave with each other. After every
//! transition it re-runs the corruption check and dispatches at most one
//! recovery per detection.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::backend::{AuthBackend, AuthEvent, AuthEventKind, AuthUser};
use crate::clock::{Clock, timed};
use crate::config::SessionConfig;
use crate::mirror::LocalArtifacts;
use crate::route::Navigator;
use crate::services::corruption::{CheckContext, Corruption, CorruptionDetector, Evaluation, detect};
use crate::services::profile::ProfileLoader;
use crate::services::recovery::{RecoveryCoordinator, RecoveryOutcome};
use crate::services::signout::SignOutService;
use crate::state::StateStore;

pub struct SessionWatcher {
    backend: Arc<dyn AuthBackend>,
    state: Arc<StateStore>,
    artifacts: LocalArtifacts,
    navigator: Arc<dyn Navigator>,
    loader: Arc<ProfileLoader>,
    recovery: Arc<RecoveryCoordinator>,
    sign_out: Arc<SignOutService>,
    detector: CorruptionDetector,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
}

impl SessionWatcher {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backend: Arc<dyn AuthBackend>,
        state: Arc<StateStore>,
        artifacts: LocalArtifacts,
        navigator: Arc<dyn Navigator>,
        loader: Arc<ProfileLoader>,
        recovery: Arc<RecoveryCoordinator>,
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
            recovery,
            sign_out,
            detector: CorruptionDetector::new(),
            clock,
            config,
        }
    }

    /// Restore whatever session the backend holds at startup. With none,
    /// recovery gets a chance to use the local cache before the signed-out
    /// view is committed.
    pub async fn initialize(&self) {
        let restored =
            timed(self.clock.as_ref(), self.config.auth_call_timeout, "session restore", self.backend.current_session())
                .await;

        match restored {
            Ok(Some(user)) => {
                debug!(user_id = %user.id, "session present at startup");
                self.establish(user, AuthEventKind::SessionEstablished).await;
            }
            Ok(None) => {
                let outcome = self.recovery.recover("no session at startup").await;
                debug!(?outcome, "startup recovery finished");
            }
            Err(e) => {
                warn!(error = %e, "session restore failed; attempting recovery");
                let outcome = self.recovery.recover("session restore failed").await;
                debug!(?outcome, "startup recovery finished");
            }
        }

        self.state.set_loading(false);
        self.check_integrity().await;
    }

    /// Apply one backend event.
    pub async fn handle(&self, event: AuthEvent) {
        debug!(kind = ?event.kind, has_session = event.session.is_some(), "auth event");
        match event.session {
            Some(user) => self.establish(user, event.kind).await,
            None => self.clear(event.kind),
        }
        self.state.set_loading(false);
        self.check_integrity().await;
    }

    async fn establish(&self, user: AuthUser, kind: AuthEventKind) {
        if !user.is_valid() {
            error!(user_id = %user.id, ?kind, "backend delivered malformed identity");
            self.sign_out.force("malformed identity").await;
            self.recovery.reset();
            return;
        }

        let snapshot = self.state.snapshot();
        let same_identity = snapshot
            .user
            .as_ref()
            .is_some_and(|current| current.id == user.id && current.email == user.email);
        let needs_profile = kind == AuthEventKind::UserUpdated || !same_identity || snapshot.user_profile.is_none();

        let version = self.state.accept_session(user.clone(), self.clock.now());
        self.artifacts.save_identity(&user);
        self.recovery.reset();
        info!(user_id = %user.id, ?kind, version, "session accepted");

        if needs_profile {
            let outcome = self.loader.sync(version, &user.id).await;
            debug!(user_id = %user.id, ?outcome, "profile sync finished");
        }
    }

    fn clear(&self, kind: AuthEventKind) {
        let had_user = self.state.user().is_some();
        let version = self.state.clear_session(self.clock.now());
        self.artifacts.clear_identity();
        self.recovery.reset();
        if had_user {
            info!(?kind, version, "session cleared");
        }
    }

    /// Evaluate the pairing invariant and react to a new corruption.
    pub async fn check_integrity(&self) {
        let snapshot = self.state.snapshot();
        match self.detector.evaluate(&snapshot, &self.context()) {
            Evaluation::Clean => {
                if snapshot.is_state_corrupted {
                    self.state.set_corrupted(false);
                }
            }
            Evaluation::Persisting(_) => {}
            Evaluation::Detected(corruption) => {
                warn!(?corruption, "auth state corrupted");
                self.state.set_corrupted(true);
                self.respond(corruption).await;

                let after = detect(&self.state.snapshot(), &self.context());
                self.state.set_corrupted(after.is_some());
                if after.is_none() {
                    self.detector.reset();
                }
            }
        }
    }

    async fn respond(&self, corruption: Corruption) {
        match corruption {
            Corruption::MalformedUser { .. } => {
                self.sign_out.force("malformed identity").await;
                self.recovery.reset();
            }
            Corruption::MissingProfile { .. } | Corruption::MismatchedProfile { .. } => {
                let outcome = self.recovery.recover("state corrupted").await;
                if outcome == RecoveryOutcome::NotRecovered {
                    debug!("corruption left in place on non-critical route");
                }
            }
        }
    }

    fn context(&self) -> CheckContext {
        CheckContext {
            route: self.navigator.route_class(),
            skip_window_active: self.artifacts.skip_checks_active(),
            profile_tolerated: self.state.profile_tolerated(),
        }
    }
}

#[cfg(test)]
#[path = "watcher_test.rs"]
mod tests;
