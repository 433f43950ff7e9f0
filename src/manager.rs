//! Session manager: construction, lifecycle and the public actions.
//!
//! LIFECYCLE
//! =========
//! 1. [`SessionManager::new`] wires the services around one [`StateStore`].
//!    Nothing runs yet and no counters are shared with other instances.
//! 2. [`SessionManager::start`] takes the backend event stream (once) and
//!    spawns the run loop, the validation ticker and the loading watchdog.
//! 3. [`SessionRuntime::shutdown`] stops all three and waits for the loop.
//!
//! The run loop is the only consumer of backend events. Actions run on the
//! caller's task; those that clear state bump the version so any in-flight
//! loop work computed against the old session is discarded on commit.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{AuthBackend, AuthEvent, RecordStore, UserMetadata, UserProfile};
use crate::clock::{Clock, timed};
use crate::config::SessionConfig;
use crate::mirror::LocalArtifacts;
use crate::route::Navigator;
use crate::services::profile::{ProfileLoader, ProfileSync};
use crate::services::recovery::RecoveryCoordinator;
use crate::services::signout::SignOutService;
use crate::services::validator::{PeriodicValidator, ValidationTrigger};
use crate::services::watcher::SessionWatcher;
use crate::state::{AuthSnapshot, StateStore};
use crate::storage::KeyValueStore;

const CONTROL_QUEUE_CAPACITY: usize = 16;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("backend event stream already taken")]
    AlreadySubscribed,
}

/// Outcome of a user-facing action. Actions never panic or return `Err`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionResult {
    pub success: bool,
    pub error: Option<String>,
}

impl ActionResult {
    #[must_use]
    pub fn ok() -> Self {
        Self { success: true, error: None }
    }

    #[must_use]
    pub fn err(message: impl Into<String>) -> Self {
        Self { success: false, error: Some(message.into()) }
    }
}

/// External capabilities the session core runs against.
#[derive(Clone)]
pub struct SessionDeps {
    pub backend: Arc<dyn AuthBackend>,
    pub records: Arc<dyn RecordStore>,
    pub storage: Arc<dyn KeyValueStore>,
    pub navigator: Arc<dyn Navigator>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    ValidationTick,
    Reconnected,
    Shutdown,
}

// =============================================================================
// MANAGER
// =============================================================================

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    backend: Arc<dyn AuthBackend>,
    records: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
    state: Arc<StateStore>,
    artifacts: LocalArtifacts,
    sign_out: Arc<SignOutService>,
    loader: Arc<ProfileLoader>,
    recovery: Arc<RecoveryCoordinator>,
    validator: Arc<PeriodicValidator>,
    watcher: Arc<SessionWatcher>,
    control: std::sync::Mutex<Option<mpsc::Sender<Control>>>,
}

impl SessionManager {
    #[must_use]
    pub fn new(deps: SessionDeps, config: SessionConfig) -> Self {
        let SessionDeps { backend, records, storage, navigator, clock } = deps;
        let state = Arc::new(StateStore::new());
        let artifacts =
            LocalArtifacts::new(storage, clock.clone(), config.mirror_freshness, config.skip_checks_window);

        let sign_out = Arc::new(SignOutService::new(
            backend.clone(),
            state.clone(),
            artifacts.clone(),
            navigator.clone(),
            clock.clone(),
            config,
        ));
        let loader = Arc::new(ProfileLoader::new(
            backend.clone(),
            records.clone(),
            state.clone(),
            artifacts.clone(),
            navigator.clone(),
            sign_out.clone(),
            clock.clone(),
            config,
        ));
        let recovery = Arc::new(RecoveryCoordinator::new(
            backend.clone(),
            state.clone(),
            artifacts.clone(),
            navigator.clone(),
            loader.clone(),
            sign_out.clone(),
            clock.clone(),
            config,
        ));
        let validator = Arc::new(PeriodicValidator::new(
            backend.clone(),
            state.clone(),
            artifacts.clone(),
            navigator.clone(),
            recovery.clone(),
            sign_out.clone(),
            clock.clone(),
            config,
        ));
        let watcher = Arc::new(SessionWatcher::new(
            backend.clone(),
            state.clone(),
            artifacts.clone(),
            navigator,
            loader.clone(),
            recovery.clone(),
            sign_out.clone(),
            clock.clone(),
            config,
        ));

        Self {
            inner: Arc::new(ManagerInner {
                backend,
                records,
                clock,
                config,
                state,
                artifacts,
                sign_out,
                loader,
                recovery,
                validator,
                watcher,
                control: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Subscribe to the backend and spawn the background tasks.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::AlreadySubscribed`] if the backend's event
    /// stream was already taken by an earlier `start`.
    pub fn start(&self) -> Result<SessionRuntime, ManagerError> {
        let events = self
            .inner
            .backend
            .subscribe()
            .ok_or(ManagerError::AlreadySubscribed)?;
        let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE_CAPACITY);
        *self
            .inner
            .control
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(control_tx.clone());

        let run_loop = tokio::spawn(run_loop(self.inner.clone(), events, control_rx));
        let ticker = spawn_validation_ticker(self.inner.clock.clone(), self.inner.config, control_tx.clone());
        let watchdog = spawn_loading_watchdog(self.inner.clock.clone(), self.inner.config, self.inner.state.clone());

        info!("session manager started");
        Ok(SessionRuntime { control: control_tx, run_loop, ticker, watchdog })
    }

    // =========================================================================
    // STATE
    // =========================================================================

    #[must_use]
    pub fn snapshot(&self) -> AuthSnapshot {
        self.inner.state.snapshot()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<AuthSnapshot> {
        self.inner.state.subscribe()
    }

    #[must_use]
    pub fn state(&self) -> &Arc<StateStore> {
        &self.inner.state
    }

    // =========================================================================
    // ACTIONS
    // =========================================================================

    pub async fn sign_in(&self, email: &str, password: &str) -> ActionResult {
        let email = email.trim();
        if email.is_empty() || password.is_empty() {
            return ActionResult::err("email and password are required");
        }

        self.inner.artifacts.reset_profile_fetch_attempts();
        self.inner.recovery.reset();

        let inner = &self.inner;
        match timed(
            inner.clock.as_ref(),
            inner.config.auth_call_timeout,
            "sign in",
            inner.backend.sign_in_with_password(email, password),
        )
        .await
        {
            Ok(user) => {
                info!(user_id = %user.id, "signed in");
                ActionResult::ok()
            }
            Err(e) => {
                warn!(error = %e, "sign-in failed");
                ActionResult::err(e.to_string())
            }
        }
    }

    pub async fn sign_up(&self, email: &str, password: &str, metadata: UserMetadata) -> ActionResult {
        let email = email.trim();
        if email.is_empty() || password.is_empty() {
            return ActionResult::err("email and password are required");
        }

        self.inner.artifacts.reset_profile_fetch_attempts();
        self.inner.recovery.reset();

        let inner = &self.inner;
        match timed(
            inner.clock.as_ref(),
            inner.config.auth_call_timeout,
            "sign up",
            inner.backend.sign_up(email, password, &metadata),
        )
        .await
        {
            Ok(Some(user)) => {
                info!(user_id = %user.id, "signed up");
                ActionResult::ok()
            }
            Ok(None) => {
                info!("signed up; awaiting email confirmation");
                ActionResult::ok()
            }
            Err(e) => {
                warn!(error = %e, "sign-up failed");
                ActionResult::err(e.to_string())
            }
        }
    }

    pub async fn sign_out(&self, silent: bool) -> ActionResult {
        let result = self.inner.sign_out.sign_out(silent).await;
        self.inner.recovery.reset();
        match result {
            Ok(()) => ActionResult::ok(),
            Err(message) => ActionResult::err(message),
        }
    }

    pub async fn force_sign_out(&self) {
        self.inner.sign_out.force("requested").await;
        self.inner.recovery.reset();
    }

    /// Reload the profile for the current user.
    pub async fn refresh_profile(&self) -> ActionResult {
        let Some(user) = self.inner.state.user() else {
            return ActionResult::err("not signed in");
        };
        let version = self.inner.state.version();
        match self.inner.loader.sync(version, &user.id).await {
            ProfileSync::Loaded => ActionResult::ok(),
            ProfileSync::Stale => ActionResult::err("session changed during profile refresh"),
            ProfileSync::Tolerated => ActionResult::err("profile unavailable"),
            ProfileSync::SignedOut => ActionResult::err("profile unavailable; signed out"),
        }
    }

    /// Fetch the profile without touching state.
    pub async fn fetch_or_create_profile(&self, user_id: &str) -> Option<UserProfile> {
        self.inner.loader.fetch_or_create(user_id).await
    }

    pub async fn refresh_session(&self) -> ActionResult {
        let inner = &self.inner;
        match timed(inner.clock.as_ref(), inner.config.auth_call_timeout, "token refresh", inner.backend.refresh_session())
            .await
        {
            Ok(Some(_)) => ActionResult::ok(),
            Ok(None) => ActionResult::err("no session to refresh"),
            Err(e) => {
                warn!(error = %e, "session refresh failed");
                ActionResult::err(e.to_string())
            }
        }
    }

    /// Claim guest bookings made with `email` for the signed-in user.
    /// Returns the number of bookings linked; 0 on any failure.
    pub async fn link_bookings_to_account(&self, email: &str) -> u64 {
        let Some(user) = self.inner.state.user() else {
            debug!("booking link requested while signed out");
            return 0;
        };
        let Some(email) = normalize_email(email) else {
            warn!("booking link requested with malformed email");
            return 0;
        };

        let inner = &self.inner;
        match timed(
            inner.clock.as_ref(),
            inner.config.auth_call_timeout,
            "link bookings",
            inner.records.link_bookings(&user.id, &email),
        )
        .await
        {
            Ok(count) => {
                info!(user_id = %user.id, count, "bookings linked");
                count
            }
            Err(e) => {
                warn!(user_id = %user.id, error = %e, "booking link failed");
                0
            }
        }
    }

    /// Report that network connectivity came back.
    pub async fn notify_reconnected(&self) {
        let control = self
            .inner
            .control
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        if let Some(tx) = control {
            if tx.send(Control::Reconnected).await.is_err() {
                debug!("reconnect ignored; run loop stopped");
            }
        }
    }
}

#[must_use]
pub fn normalize_email(email: &str) -> Option<String> {
    let normalized = email.trim().to_ascii_lowercase();
    let (local, domain) = normalized.split_once('@')?;
    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return None;
    }
    Some(normalized)
}

// =============================================================================
// RUNTIME
// =============================================================================

/// Handles to the background tasks of a started manager.
pub struct SessionRuntime {
    control: mpsc::Sender<Control>,
    run_loop: JoinHandle<()>,
    ticker: JoinHandle<()>,
    watchdog: JoinHandle<()>,
}

impl SessionRuntime {
    /// Stop the timers, let the run loop finish its current event, and wait
    /// for it to exit.
    pub async fn shutdown(self) {
        self.ticker.abort();
        self.watchdog.abort();
        if self.control.send(Control::Shutdown).await.is_err() {
            debug!("run loop already stopped");
        }
        if let Err(e) = self.run_loop.await {
            warn!(error = %e, "session run loop ended abnormally");
        }
        info!("session manager stopped");
    }
}

async fn run_loop(inner: Arc<ManagerInner>, mut events: mpsc::Receiver<AuthEvent>, mut control: mpsc::Receiver<Control>) {
    inner.watcher.initialize().await;

    loop {
        tokio::select! {
            biased;
            msg = control.recv() => match msg {
                Some(Control::ValidationTick) => {
                    let outcome = inner.validator.validate(ValidationTrigger::Interval).await;
                    debug!(?outcome, "periodic validation");
                    inner.watcher.check_integrity().await;
                }
                Some(Control::Reconnected) => {
                    let outcome = inner.validator.validate(ValidationTrigger::Reconnect).await;
                    debug!(?outcome, "reconnect validation");
                    inner.watcher.check_integrity().await;
                }
                Some(Control::Shutdown) | None => break,
            },
            event = events.recv() => match event {
                Some(event) => inner.watcher.handle(event).await,
                None => {
                    warn!("backend event stream closed");
                    break;
                }
            },
        }
    }
}

fn spawn_validation_ticker(clock: Arc<dyn Clock>, config: SessionConfig, control: mpsc::Sender<Control>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            clock.sleep(config.validation_interval).await;
            if control.send(Control::ValidationTick).await.is_err() {
                break;
            }
        }
    })
}

fn spawn_loading_watchdog(clock: Arc<dyn Clock>, config: SessionConfig, state: Arc<StateStore>) -> JoinHandle<()> {
    tokio::spawn(async move {
        clock.sleep(config.loading_watchdog).await;
        if state.snapshot().is_loading {
            warn!(after_ms = config.loading_watchdog.as_millis(), "auth still loading; releasing watchdog");
            state.set_loading(false);
        }
    })
}

#[cfg(test)]
#[path = "manager_test.rs"]
mod tests;
