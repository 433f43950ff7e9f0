//! Periodic revalidation of the local session against the backend.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::backend::AuthBackend;
use crate::clock::{Clock, timed};
use crate::config::SessionConfig;
use crate::mirror::LocalArtifacts;
use crate::route::{Navigator, RouteClass};
use crate::services::recovery::{RecoveryCoordinator, RecoveryOutcome};
use crate::services::signout::SignOutService;
use crate::state::StateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationTrigger {
    /// Timer tick; subject to the half-interval throttle.
    Interval,
    /// Network came back; checked immediately.
    Reconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationOutcome {
    Skipped,
    Valid,
    /// Backend had no identity; recovery ran.
    Recovery(RecoveryOutcome),
    /// Backend identity differed from ours; forced sign-out.
    IdentityMismatch,
}

pub struct PeriodicValidator {
    backend: Arc<dyn AuthBackend>,
    state: Arc<StateStore>,
    artifacts: LocalArtifacts,
    navigator: Arc<dyn Navigator>,
    recovery: Arc<RecoveryCoordinator>,
    sign_out: Arc<SignOutService>,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
}

impl PeriodicValidator {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backend: Arc<dyn AuthBackend>,
        state: Arc<StateStore>,
        artifacts: LocalArtifacts,
        navigator: Arc<dyn Navigator>,
        recovery: Arc<RecoveryCoordinator>,
        sign_out: Arc<SignOutService>,
        clock: Arc<dyn Clock>,
        config: SessionConfig,
    ) -> Self {
        Self { backend, state, artifacts, navigator, recovery, sign_out, clock, config }
    }

    fn due(&self, trigger: ValidationTrigger) -> bool {
        if trigger == ValidationTrigger::Reconnect {
            return true;
        }
        let Some(last) = self.state.last_validation() else {
            return true;
        };
        let elapsed = self.clock.now() - last;
        let threshold = self.config.validation_interval / 2;
        elapsed >= time::Duration::try_from(threshold).unwrap_or(time::Duration::MAX)
    }

    pub async fn validate(&self, trigger: ValidationTrigger) -> ValidationOutcome {
        let Some(local) = self.state.user() else {
            return ValidationOutcome::Skipped;
        };
        if self.navigator.route_class() == RouteClass::Home {
            return ValidationOutcome::Skipped;
        }
        if !self.due(trigger) {
            debug!(?trigger, "validated recently; skipping");
            return ValidationOutcome::Skipped;
        }

        let remote =
            timed(self.clock.as_ref(), self.config.identity_timeout, "session validation", self.backend.get_current_user())
                .await;

        let remote = match remote {
            Ok(Some(user)) => user,
            Ok(None) => {
                warn!(user_id = %local.id, "backend has no identity for local user; recovering");
                return ValidationOutcome::Recovery(self.recovery.recover("validation found no identity").await);
            }
            Err(e) => {
                warn!(user_id = %local.id, error = %e, "session validation failed; recovering");
                return ValidationOutcome::Recovery(self.recovery.recover("validation failed").await);
            }
        };

        if remote.id != local.id {
            error!(local_id = %local.id, remote_id = %remote.id, "identity mismatch during validation");
            self.sign_out.force("identity mismatch").await;
            self.recovery.reset();
            return ValidationOutcome::IdentityMismatch;
        }

        let now = self.clock.now();
        if !self.state.refresh_user_fields(remote.clone(), now) {
            self.state.accept_session(remote.clone(), now);
        }
        self.state.touch_validation(now);
        self.artifacts.save_identity(&remote);
        info!(user_id = %remote.id, ?trigger, "session validated");
        ValidationOutcome::Valid
    }
}

#[cfg(test)]
#[path = "validator_test.rs"]
mod tests;
