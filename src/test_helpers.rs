//! Shared mocks and wiring for unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::mpsc;

use crate::backend::{
    AuthBackend, AuthEvent, AuthEventKind, AuthUser, BackendError, NewProfile, RecordStore, UserMetadata, UserProfile,
};
use crate::clock::Clock;
use crate::config::SessionConfig;
use crate::manager::{SessionDeps, SessionManager};
use crate::mirror::LocalArtifacts;
use crate::route::MemoryNavigator;
use crate::services::profile::ProfileLoader;
use crate::services::recovery::RecoveryCoordinator;
use crate::services::signout::SignOutService;
use crate::services::validator::PeriodicValidator;
use crate::services::watcher::SessionWatcher;
use crate::state::StateStore;
use crate::storage::MemoryStore;

// =============================================================================
// FIXTURES
// =============================================================================

#[must_use]
pub fn user(id: &str) -> AuthUser {
    AuthUser::new(id, format!("{id}@example.com"))
}

#[must_use]
pub fn profile(id: &str) -> UserProfile {
    UserProfile {
        id: id.to_string(),
        email: format!("{id}@example.com"),
        full_name: Some(format!("User {id}")),
        phone: None,
        extra: serde_json::Map::new(),
    }
}

// =============================================================================
// CLOCK
// =============================================================================

/// Clock that follows tokio's (possibly paused) time and records every
/// completed sleep.
pub struct TestClock {
    base_wall: OffsetDateTime,
    base: tokio::time::Instant,
    skew: Mutex<Duration>,
    sleeps: Mutex<Vec<Duration>>,
}

impl TestClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            base_wall: OffsetDateTime::from_unix_timestamp(1_750_000_000).unwrap(),
            base: tokio::time::Instant::now(),
            skew: Mutex::new(Duration::ZERO),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    /// Jump wall time forward without sleeping.
    pub fn advance_wall(&self, by: Duration) {
        *self.skew.lock().unwrap() += by;
    }

    #[must_use]
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Clock for TestClock {
    fn now(&self) -> OffsetDateTime {
        self.base_wall + self.base.elapsed() + *self.skew.lock().unwrap()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
        self.sleeps.lock().unwrap().push(duration);
    }
}

// =============================================================================
// AUTH BACKEND
// =============================================================================

/// Scripted auth backend. Successful sign-in/out/refresh emit the same
/// events a real backend would.
pub struct MockBackend {
    events_tx: mpsc::Sender<AuthEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<AuthEvent>>>,
    current_session: Mutex<Result<Option<AuthUser>, BackendError>>,
    current_user: Mutex<Result<Option<AuthUser>, BackendError>>,
    refresh: Mutex<Result<Option<AuthUser>, BackendError>>,
    sign_in: Mutex<Result<AuthUser, BackendError>>,
    sign_up: Mutex<Result<Option<AuthUser>, BackendError>>,
    hanging: Mutex<HashSet<&'static str>>,
    calls: Mutex<Vec<&'static str>>,
}

impl MockBackend {
    #[must_use]
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::channel(64);
        Self {
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            current_session: Mutex::new(Ok(None)),
            current_user: Mutex::new(Ok(None)),
            refresh: Mutex::new(Ok(None)),
            sign_in: Mutex::new(Err(BackendError::InvalidCredentials("no script".into()))),
            sign_up: Mutex::new(Ok(None)),
            hanging: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Backend that holds a live session for `user`.
    #[must_use]
    pub fn signed_in(user: &AuthUser) -> Self {
        let backend = Self::new();
        backend.set_current_session(Ok(Some(user.clone())));
        backend.set_current_user(Ok(Some(user.clone())));
        backend
    }

    pub fn set_current_session(&self, result: Result<Option<AuthUser>, BackendError>) {
        *self.current_session.lock().unwrap() = result;
    }

    pub fn set_current_user(&self, result: Result<Option<AuthUser>, BackendError>) {
        *self.current_user.lock().unwrap() = result;
    }

    pub fn set_refresh(&self, result: Result<Option<AuthUser>, BackendError>) {
        *self.refresh.lock().unwrap() = result;
    }

    pub fn set_sign_in(&self, result: Result<AuthUser, BackendError>) {
        *self.sign_in.lock().unwrap() = result;
    }

    pub fn set_sign_up(&self, result: Result<Option<AuthUser>, BackendError>) {
        *self.sign_up.lock().unwrap() = result;
    }

    /// Make `call` never resolve.
    pub fn hang(&self, call: &'static str) {
        self.hanging.lock().unwrap().insert(call);
    }

    /// Push an event as if the backend emitted it.
    pub async fn emit(&self, event: AuthEvent) {
        self.events_tx.send(event).await.unwrap();
    }

    #[must_use]
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    #[must_use]
    pub fn call_count(&self, call: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| **c == call).count()
    }

    async fn enter(&self, call: &'static str) {
        self.calls.lock().unwrap().push(call);
        let hanging = self.hanging.lock().unwrap().contains(call);
        if hanging {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait::async_trait]
impl AuthBackend for MockBackend {
    fn subscribe(&self) -> Option<mpsc::Receiver<AuthEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    async fn current_session(&self) -> Result<Option<AuthUser>, BackendError> {
        self.enter("current_session").await;
        self.current_session.lock().unwrap().clone()
    }

    async fn get_current_user(&self) -> Result<Option<AuthUser>, BackendError> {
        self.enter("get_current_user").await;
        self.current_user.lock().unwrap().clone()
    }

    async fn refresh_session(&self) -> Result<Option<AuthUser>, BackendError> {
        self.enter("refresh_session").await;
        let result = self.refresh.lock().unwrap().clone();
        if let Ok(Some(user)) = &result {
            let _ = self
                .events_tx
                .try_send(AuthEvent::new(AuthEventKind::TokenRefreshed, Some(user.clone())));
        }
        result
    }

    async fn sign_in_with_password(&self, _email: &str, _password: &str) -> Result<AuthUser, BackendError> {
        self.enter("sign_in").await;
        let result = self.sign_in.lock().unwrap().clone();
        if let Ok(user) = &result {
            self.set_current_user(Ok(Some(user.clone())));
            let _ = self
                .events_tx
                .try_send(AuthEvent::new(AuthEventKind::SessionEstablished, Some(user.clone())));
        }
        result
    }

    async fn sign_up(
        &self,
        _email: &str,
        _password: &str,
        _metadata: &UserMetadata,
    ) -> Result<Option<AuthUser>, BackendError> {
        self.enter("sign_up").await;
        let result = self.sign_up.lock().unwrap().clone();
        if let Ok(Some(user)) = &result {
            let _ = self
                .events_tx
                .try_send(AuthEvent::new(AuthEventKind::SessionEstablished, Some(user.clone())));
        }
        result
    }

    async fn sign_out(&self) -> Result<(), BackendError> {
        self.enter("sign_out").await;
        self.set_current_user(Ok(None));
        Ok(())
    }
}

// =============================================================================
// RECORD STORE
// =============================================================================

/// In-memory profile table with optional scripted responses that take
/// precedence over the table.
pub struct MockRecords {
    profiles: Mutex<HashMap<String, UserProfile>>,
    read_script: Mutex<VecDeque<Result<UserProfile, BackendError>>>,
    insert_script: Mutex<VecDeque<Result<UserProfile, BackendError>>>,
    ping_result: Mutex<Result<(), BackendError>>,
    link_result: Mutex<Result<u64, BackendError>>,
    reads: AtomicUsize,
    inserts: AtomicUsize,
    pings: AtomicUsize,
    links: Mutex<Vec<(String, String)>>,
}

impl MockRecords {
    #[must_use]
    pub fn new() -> Self {
        Self {
            profiles: Mutex::new(HashMap::new()),
            read_script: Mutex::new(VecDeque::new()),
            insert_script: Mutex::new(VecDeque::new()),
            ping_result: Mutex::new(Ok(())),
            link_result: Mutex::new(Ok(0)),
            reads: AtomicUsize::new(0),
            inserts: AtomicUsize::new(0),
            pings: AtomicUsize::new(0),
            links: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn with_profile(profile: UserProfile) -> Self {
        let records = Self::new();
        records.put(profile);
        records
    }

    pub fn put(&self, profile: UserProfile) {
        self.profiles.lock().unwrap().insert(profile.id.clone(), profile);
    }

    pub fn script_reads(&self, results: Vec<Result<UserProfile, BackendError>>) {
        self.read_script.lock().unwrap().extend(results);
    }

    pub fn script_inserts(&self, results: Vec<Result<UserProfile, BackendError>>) {
        self.insert_script.lock().unwrap().extend(results);
    }

    /// Every read fails with `error`.
    pub fn fail_reads(&self, error: BackendError, times: usize) {
        self.script_reads(vec![Err(error); times]);
    }

    pub fn set_ping(&self, result: Result<(), BackendError>) {
        *self.ping_result.lock().unwrap() = result;
    }

    pub fn set_link_result(&self, result: Result<u64, BackendError>) {
        *self.link_result.lock().unwrap() = result;
    }

    #[must_use]
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn inserts(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn links(&self) -> Vec<(String, String)> {
        self.links.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl RecordStore for MockRecords {
    async fn ping(&self) -> Result<(), BackendError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        self.ping_result.lock().unwrap().clone()
    }

    async fn read_profile(&self, id: &str) -> Result<UserProfile, BackendError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if let Some(scripted) = self.read_script.lock().unwrap().pop_front() {
            return scripted;
        }
        self.profiles
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or(BackendError::NotFound)
    }

    async fn insert_profile(&self, seed: &NewProfile) -> Result<UserProfile, BackendError> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        if let Some(scripted) = self.insert_script.lock().unwrap().pop_front() {
            return scripted;
        }
        let mut profiles = self.profiles.lock().unwrap();
        if profiles.contains_key(&seed.id) {
            return Err(BackendError::DuplicateKey);
        }
        let created = UserProfile {
            id: seed.id.clone(),
            email: seed.email.clone(),
            full_name: seed.full_name.clone(),
            phone: seed.phone.clone(),
            extra: serde_json::Map::new(),
        };
        profiles.insert(created.id.clone(), created.clone());
        Ok(created)
    }

    async fn link_bookings(&self, user_id: &str, email: &str) -> Result<u64, BackendError> {
        self.links.lock().unwrap().push((user_id.to_string(), email.to_string()));
        self.link_result.lock().unwrap().clone()
    }
}

// =============================================================================
// WIRING
// =============================================================================

/// Every service wired against the mocks, the way the manager wires them.
pub struct Harness {
    pub clock: Arc<TestClock>,
    pub storage: Arc<MemoryStore>,
    pub navigator: Arc<MemoryNavigator>,
    pub backend: Arc<MockBackend>,
    pub records: Arc<MockRecords>,
    pub state: Arc<StateStore>,
    pub artifacts: LocalArtifacts,
    pub config: SessionConfig,
    pub sign_out: Arc<SignOutService>,
    pub loader: Arc<ProfileLoader>,
    pub recovery: Arc<RecoveryCoordinator>,
    pub validator: Arc<PeriodicValidator>,
    pub watcher: Arc<SessionWatcher>,
}

impl Harness {
    #[must_use]
    pub fn new(route: &str, backend: MockBackend, records: MockRecords) -> Self {
        Self::with_config(route, backend, records, test_config())
    }

    #[must_use]
    pub fn with_config(route: &str, backend: MockBackend, records: MockRecords, config: SessionConfig) -> Self {
        let clock = Arc::new(TestClock::new());
        let storage = Arc::new(MemoryStore::new(clock.clone()));
        let navigator = Arc::new(MemoryNavigator::new(route));
        let backend = Arc::new(backend);
        let records = Arc::new(records);
        let state = Arc::new(StateStore::new());
        let artifacts =
            LocalArtifacts::new(storage.clone(), clock.clone(), config.mirror_freshness, config.skip_checks_window);

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
            navigator.clone(),
            loader.clone(),
            recovery.clone(),
            sign_out.clone(),
            clock.clone(),
            config,
        ));

        Self {
            clock,
            storage,
            navigator,
            backend,
            records,
            state,
            artifacts,
            config,
            sign_out,
            loader,
            recovery,
            validator,
            watcher,
        }
    }

    /// Put `user` into state as an accepted session, returning its version.
    pub fn seed_session(&self, user: &AuthUser) -> u64 {
        self.artifacts.save_identity(user);
        self.state.accept_session(user.clone(), self.clock.now())
    }

    /// Clear the loading flag the way startup would.
    pub fn finish_loading(&self) {
        self.state.set_loading(false);
    }
}

/// Defaults with the connectivity check off so call counts stay exact.
#[must_use]
pub fn test_config() -> SessionConfig {
    SessionConfig { connectivity_check: false, ..SessionConfig::default() }
}

/// A manager over fresh mocks, plus handles to the mocks.
pub struct ManagerFixture {
    pub manager: SessionManager,
    pub clock: Arc<TestClock>,
    pub storage: Arc<MemoryStore>,
    pub navigator: Arc<MemoryNavigator>,
    pub backend: Arc<MockBackend>,
    pub records: Arc<MockRecords>,
}

impl ManagerFixture {
    #[must_use]
    pub fn new(route: &str, backend: MockBackend, records: MockRecords) -> Self {
        Self::with_config(route, backend, records, test_config())
    }

    #[must_use]
    pub fn with_config(route: &str, backend: MockBackend, records: MockRecords, config: SessionConfig) -> Self {
        let clock = Arc::new(TestClock::new());
        let storage = Arc::new(MemoryStore::new(clock.clone()));
        let navigator = Arc::new(MemoryNavigator::new(route));
        let backend = Arc::new(backend);
        let records = Arc::new(records);
        let deps = SessionDeps {
            backend: backend.clone(),
            records: records.clone(),
            storage: storage.clone(),
            navigator: navigator.clone(),
            clock: clock.clone(),
        };
        let manager = SessionManager::new(deps, config);
        Self { manager, clock, storage, navigator, backend, records }
    }
}
