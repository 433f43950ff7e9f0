//! Backend capabilities: the remote auth service and the record store.
//!
//! ARCHITECTURE
//! ============
//! The session core never talks HTTP directly. It depends on two traits:
//! [`AuthBackend`] (identity, tokens, lifecycle events) and [`RecordStore`]
//! (profile rows and booking linkage). [`http::HttpBackend`] implements both
//! against a REST deployment; tests implement them with in-memory mocks.

pub mod http;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

// =============================================================================
// ERROR
// =============================================================================

/// Structured outcome of a failed backend call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// The requested row does not exist.
    #[error("record not found")]
    NotFound,

    /// An insert collided with an existing primary key.
    #[error("duplicate key")]
    DuplicateKey,

    /// Email/password rejected by the auth service.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    /// The call did not complete before its deadline.
    #[error("{operation} timed out after {millis}ms")]
    Timeout { operation: &'static str, millis: u64 },

    /// Network-level failure reaching the backend.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The backend answered with a non-success status.
    #[error("backend rejected request: status {status}: {message}")]
    Rejected { status: u16, message: String },

    /// A response body could not be decoded.
    #[error("response decode failed: {0}")]
    Decode(String),
}

impl BackendError {
    /// Whether the failure is transient and worth retrying under a budget.
    #[must_use]
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Unavailable(_) | Self::Rejected { status: 429 | 500..=599, .. })
    }
}

// =============================================================================
// IDENTITY
// =============================================================================

/// Profile seed data attached to an identity at sign-up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

/// Identity as confirmed by the auth backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub user_metadata: UserMetadata,
}

impl AuthUser {
    #[must_use]
    pub fn new(id: impl Into<String>, email: impl Into<String>) -> Self {
        Self { id: id.into(), email: email.into(), user_metadata: UserMetadata::default() }
    }

    /// A user is usable only with a real id and a non-empty email.
    ///
    /// Serialized JS-style placeholders (`"undefined"`, `"null"`) are rejected
    /// because they show up when a broken cache round-trips a missing id.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        let id = self.id.trim();
        !id.is_empty() && id != "undefined" && id != "null" && !self.email.trim().is_empty()
    }
}

// =============================================================================
// EVENTS
// =============================================================================

/// Session lifecycle notification kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEventKind {
    SessionEstablished,
    SessionCleared,
    TokenRefreshed,
    UserUpdated,
}

/// One entry of the backend's event stream. The payload is nullable for
/// every kind; a `None` session always means "no one is signed in".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthEvent {
    pub kind: AuthEventKind,
    pub session: Option<AuthUser>,
}

impl AuthEvent {
    #[must_use]
    pub fn new(kind: AuthEventKind, session: Option<AuthUser>) -> Self {
        Self { kind, session }
    }
}

// =============================================================================
// PROFILE
// =============================================================================

/// Application-owned profile row, 1:1 with an identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    /// Columns this crate does not interpret (`created_at`, `role`, ...).
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Insert payload for a lazily created profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewProfile {
    pub id: String,
    pub email: String,
    pub full_name: Option<String>,
    pub phone: Option<String>,
}

impl NewProfile {
    /// Seed a profile from the backend's view of the identity.
    #[must_use]
    pub fn from_user(user: &AuthUser) -> Self {
        Self {
            id: user.id.clone(),
            email: user.email.clone(),
            full_name: user.user_metadata.full_name.clone(),
            phone: user.user_metadata.phone.clone(),
        }
    }
}

// =============================================================================
// CAPABILITIES
// =============================================================================

/// Remote authentication service.
#[async_trait::async_trait]
pub trait AuthBackend: Send + Sync {
    /// Take the event stream. Yields `Some` exactly once per backend instance.
    fn subscribe(&self) -> Option<mpsc::Receiver<AuthEvent>>;

    /// Session restored from locally held tokens, without forcing a network
    /// round trip when tokens are still fresh.
    async fn current_session(&self) -> Result<Option<AuthUser>, BackendError>;

    /// Ask the backend who the current tokens belong to.
    async fn get_current_user(&self) -> Result<Option<AuthUser>, BackendError>;

    /// Exchange the refresh token for a new session.
    async fn refresh_session(&self) -> Result<Option<AuthUser>, BackendError>;

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<AuthUser, BackendError>;

    /// Register an identity. `Ok(None)` means the account awaits email
    /// confirmation and no session was issued.
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: &UserMetadata,
    ) -> Result<Option<AuthUser>, BackendError>;

    async fn sign_out(&self) -> Result<(), BackendError>;
}

/// Remote table access for profiles and bookings.
#[async_trait::async_trait]
pub trait RecordStore: Send + Sync {
    /// Cheap reachability check.
    async fn ping(&self) -> Result<(), BackendError>;

    /// Read a profile by id. Absence is reported as [`BackendError::NotFound`].
    async fn read_profile(&self, id: &str) -> Result<UserProfile, BackendError>;

    /// Insert a profile. A collision is reported as [`BackendError::DuplicateKey`].
    async fn insert_profile(&self, profile: &NewProfile) -> Result<UserProfile, BackendError>;

    /// Attach unowned bookings made under `email` to `user_id`, returning how
    /// many rows were linked.
    async fn link_bookings(&self, user_id: &str, email: &str) -> Result<u64, BackendError>;
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
