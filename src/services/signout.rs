//! Sign-out paths: the user-initiated one and the forced terminal fallback.
//!
//! ERROR HANDLING
//! ==============
//! Local state is cleared before the backend is told, and a backend failure
//! never restores it. `force` has no failure mode at all: it is the point
//! every bounded retry loop converges on, so it must always terminate.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::backend::AuthBackend;
use crate::clock::{Clock, timed};
use crate::config::SessionConfig;
use crate::mirror::LocalArtifacts;
use crate::route::{HOME_ROUTE, Navigator};
use crate::state::StateStore;

pub struct SignOutService {
    backend: Arc<dyn AuthBackend>,
    state: Arc<StateStore>,
    artifacts: LocalArtifacts,
    navigator: Arc<dyn Navigator>,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
}

impl SignOutService {
    #[must_use]
    pub fn new(
        backend: Arc<dyn AuthBackend>,
        state: Arc<StateStore>,
        artifacts: LocalArtifacts,
        navigator: Arc<dyn Navigator>,
        clock: Arc<dyn Clock>,
        config: SessionConfig,
    ) -> Self {
        Self { backend, state, artifacts, navigator, clock, config }
    }

    /// Sign the user out. `silent` suppresses the redirect home so the
    /// caller can choose where to send the user.
    ///
    /// # Errors
    ///
    /// Returns the backend's error message if the remote sign-out failed.
    /// Local state is cleared either way.
    pub async fn sign_out(&self, silent: bool) -> Result<(), String> {
        let user_id = self.state.user().map(|u| u.id);
        self.clear_local();

        let remote = timed(self.clock.as_ref(), self.config.auth_call_timeout, "sign out", self.backend.sign_out()).await;

        if !silent {
            self.navigator.navigate(HOME_ROUTE);
        }

        match remote {
            Ok(()) => {
                info!(user_id = ?user_id, silent, "signed out");
                Ok(())
            }
            Err(e) => {
                warn!(user_id = ?user_id, error = %e, "remote sign-out failed; local state already cleared");
                Err(e.to_string())
            }
        }
    }

    /// Unconditionally clear every trace of the identity and go home.
    pub async fn force(&self, reason: &str) {
        let user_id = self.state.user().map(|u| u.id);
        error!(user_id = ?user_id, reason, "forced sign-out");
        self.clear_local();

        if let Err(e) =
            timed(self.clock.as_ref(), self.config.auth_call_timeout, "forced sign out", self.backend.sign_out()).await
        {
            warn!(error = %e, "remote sign-out failed during forced sign-out; ignoring");
        }

        self.navigator.navigate(HOME_ROUTE);
    }

    fn clear_local(&self) {
        self.state.clear_session(self.clock.now());
        self.artifacts.clear_identity();
        self.artifacts.begin_skip_checks();
        self.state.set_loading(false);
    }
}
