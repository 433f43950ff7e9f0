//! REST backend: auth endpoints (`/auth/v1`) and table endpoints (`/rest/v1`).
//!
//! DESIGN
//! ======
//! Thin HTTP wrapper in the shape of a hosted Postgres + auth service:
//! password and refresh-token grants, sign-up with metadata, current-user
//! lookup and logout on the auth side; `profiles` and `bookings` tables on
//! the REST side. Tokens live in the [`KeyValueStore`] so a restart resumes
//! the session. Every token change is announced on the event channel.
//!
//! Response parsing and error classification are pure functions so they can
//! be tested without a server.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{AuthBackend, AuthEvent, AuthEventKind, AuthUser, BackendError, NewProfile, RecordStore, UserMetadata, UserProfile};
use crate::clock::Clock;
use crate::config::BackendConfig;
use crate::storage::KeyValueStore;

/// Storage key for the persisted [`StoredSession`].
pub const SESSION_TOKENS_KEY: &str = "authkeeper.session";

const REQUEST_TIMEOUT_SECS: u64 = 30;
const CONNECT_TIMEOUT_SECS: u64 = 5;
const EVENT_QUEUE_CAPACITY: usize = 64;
/// Refresh tokens this long before they expire.
const EXPIRY_MARGIN_SECS: i64 = 60;
const PGRST_NO_ROWS: &str = "PGRST116";
const PG_UNIQUE_VIOLATION: &str = "23505";
const SINGLE_OBJECT: &str = "application/vnd.pgrst.object+json";

// =============================================================================
// WIRE TYPES
// =============================================================================

/// Tokens and identity persisted between runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSession {
    pub access_token: String,
    pub refresh_token: String,
    /// Unix seconds.
    pub expires_at: i64,
    pub user: AuthUser,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    expires_at: Option<i64>,
    user: Option<AuthUser>,
}

#[derive(Deserialize, Default)]
struct ErrorBody {
    code: Option<serde_json::Value>,
    error_code: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
    msg: Option<String>,
    message: Option<String>,
}

#[derive(Serialize)]
struct SignUpRequest<'a> {
    email: &'a str,
    password: &'a str,
    data: &'a UserMetadata,
}

// =============================================================================
// PARSING
// =============================================================================

/// Parse a token grant response. `Ok(None)` means the body carried a user but
/// no session (sign-up awaiting confirmation).
pub fn parse_token_response(body: &str, now_secs: i64) -> Result<Option<StoredSession>, BackendError> {
    let resp: TokenResponse = serde_json::from_str(body).map_err(|e| BackendError::Decode(e.to_string()))?;
    let (Some(access_token), Some(refresh_token)) = (resp.access_token, resp.refresh_token) else {
        return Ok(None);
    };
    let user = resp
        .user
        .ok_or_else(|| BackendError::Decode("token response without user".into()))?;
    let expires_at = resp
        .expires_at
        .or_else(|| resp.expires_in.map(|secs| now_secs.saturating_add(secs)))
        .unwrap_or(now_secs);
    Ok(Some(StoredSession { access_token, refresh_token, expires_at, user }))
}

/// Map an error response to a structured [`BackendError`].
#[must_use]
pub fn classify_error(status: u16, body: &str) -> BackendError {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    let code = match &parsed.code {
        Some(serde_json::Value::String(code)) => Some(code.as_str()),
        _ => None,
    };

    if code == Some(PGRST_NO_ROWS) || status == 404 {
        return BackendError::NotFound;
    }
    if code == Some(PG_UNIQUE_VIOLATION) || (status == 409 && code.is_none()) {
        return BackendError::DuplicateKey;
    }

    let message = parsed
        .error_description
        .or(parsed.msg)
        .or(parsed.message)
        .or(parsed.error.clone())
        .unwrap_or_else(|| body.chars().take(200).collect());

    let credential_error = matches!(parsed.error.as_deref(), Some("invalid_grant"))
        || matches!(parsed.error_code.as_deref(), Some("invalid_credentials" | "email_not_confirmed"));
    if status == 400 && credential_error {
        return BackendError::InvalidCredentials(message);
    }

    BackendError::Rejected { status, message }
}

// =============================================================================
// CLIENT
// =============================================================================

pub struct HttpBackend {
    http: reqwest::Client,
    config: BackendConfig,
    storage: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    events_tx: mpsc::Sender<AuthEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<AuthEvent>>>,
}

impl HttpBackend {
    /// # Errors
    ///
    /// Returns [`BackendError::Unavailable`] if the HTTP client cannot be built.
    pub fn new(config: BackendConfig, storage: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        Ok(Self { http, config, storage, clock, events_tx, events_rx: Mutex::new(Some(events_rx)) })
    }

    fn auth_url(&self, path: &str) -> String {
        format!("{}/auth/v1/{path}", self.config.base_url)
    }

    fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.config.base_url)
    }

    fn now_secs(&self) -> i64 {
        self.clock.now().unix_timestamp()
    }

    // =========================================================================
    // TOKEN STORAGE
    // =========================================================================

    fn stored_session(&self) -> Option<StoredSession> {
        let raw = match self.storage.get(SESSION_TOKENS_KEY) {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(error = %e, "session token read failed");
                return None;
            }
        };
        serde_json::from_str(&raw)
            .inspect_err(|e| warn!(error = %e, "stored session unreadable"))
            .ok()
    }

    fn store_session(&self, session: &StoredSession) {
        match serde_json::to_string(session) {
            Ok(raw) => {
                if let Err(e) = self.storage.set(SESSION_TOKENS_KEY, &raw, None) {
                    warn!(error = %e, "session token write failed");
                }
            }
            Err(e) => warn!(error = %e, "session token encode failed"),
        }
    }

    fn drop_session(&self) {
        if let Err(e) = self.storage.remove(SESSION_TOKENS_KEY) {
            warn!(error = %e, "session token removal failed");
        }
    }

    fn bearer(&self) -> String {
        self.stored_session()
            .map_or_else(|| self.config.anon_key.clone(), |s| s.access_token)
    }

    fn emit(&self, kind: AuthEventKind, session: Option<AuthUser>) {
        if let Err(e) = self.events_tx.try_send(AuthEvent::new(kind, session)) {
            warn!(?kind, error = %e, "auth event dropped");
        }
    }

    // =========================================================================
    // REQUESTS
    // =========================================================================

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<String, BackendError> {
        let response = request
            .header("apikey", &self.config.anon_key)
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        if (200..300).contains(&status) { Ok(text) } else { Err(classify_error(status, &text)) }
    }

    async fn token_grant(&self, grant_type: &str, body: serde_json::Value) -> Result<StoredSession, BackendError> {
        let text = self
            .send(
                self.http
                    .post(self.auth_url("token"))
                    .query(&[("grant_type", grant_type)])
                    .json(&body),
            )
            .await?;
        parse_token_response(&text, self.now_secs())?
            .ok_or_else(|| BackendError::Decode("token grant returned no session".into()))
    }
}

#[async_trait::async_trait]
impl AuthBackend for HttpBackend {
    fn subscribe(&self) -> Option<mpsc::Receiver<AuthEvent>> {
        self.events_rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }

    async fn current_session(&self) -> Result<Option<AuthUser>, BackendError> {
        let Some(stored) = self.stored_session() else {
            return Ok(None);
        };
        if stored.expires_at.saturating_sub(EXPIRY_MARGIN_SECS) > self.now_secs() {
            return Ok(Some(stored.user));
        }
        debug!("stored session near expiry; refreshing");
        self.refresh_session().await
    }

    async fn get_current_user(&self) -> Result<Option<AuthUser>, BackendError> {
        let Some(stored) = self.stored_session() else {
            return Ok(None);
        };
        let result = self
            .send(
                self.http
                    .get(self.auth_url("user"))
                    .bearer_auth(&stored.access_token),
            )
            .await;
        match result {
            Ok(text) => serde_json::from_str::<AuthUser>(&text)
                .map(Some)
                .map_err(|e| BackendError::Decode(e.to_string())),
            Err(BackendError::Rejected { status: 401 | 403, .. } | BackendError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn refresh_session(&self) -> Result<Option<AuthUser>, BackendError> {
        let Some(stored) = self.stored_session() else {
            return Ok(None);
        };
        match self
            .token_grant("refresh_token", serde_json::json!({ "refresh_token": stored.refresh_token }))
            .await
        {
            Ok(session) => {
                self.store_session(&session);
                self.emit(AuthEventKind::TokenRefreshed, Some(session.user.clone()));
                Ok(Some(session.user))
            }
            Err(BackendError::InvalidCredentials(_) | BackendError::Rejected { status: 400 | 401, .. }) => {
                self.drop_session();
                self.emit(AuthEventKind::SessionCleared, None);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<AuthUser, BackendError> {
        let session = self
            .token_grant("password", serde_json::json!({ "email": email, "password": password }))
            .await?;
        self.store_session(&session);
        self.emit(AuthEventKind::SessionEstablished, Some(session.user.clone()));
        Ok(session.user)
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: &UserMetadata,
    ) -> Result<Option<AuthUser>, BackendError> {
        let body = SignUpRequest { email, password, data: metadata };
        let text = self
            .send(self.http.post(self.auth_url("signup")).json(&body))
            .await?;
        match parse_token_response(&text, self.now_secs())? {
            Some(session) => {
                self.store_session(&session);
                self.emit(AuthEventKind::SessionEstablished, Some(session.user.clone()));
                Ok(Some(session.user))
            }
            None => Ok(None),
        }
    }

    async fn sign_out(&self) -> Result<(), BackendError> {
        let stored = self.stored_session();
        self.drop_session();
        self.emit(AuthEventKind::SessionCleared, None);

        let Some(stored) = stored else {
            return Ok(());
        };
        self.send(
            self.http
                .post(self.auth_url("logout"))
                .bearer_auth(&stored.access_token),
        )
        .await
        .map(|_| ())
    }
}

#[async_trait::async_trait]
impl RecordStore for HttpBackend {
    async fn ping(&self) -> Result<(), BackendError> {
        self.send(
            self.http
                .get(self.rest_url("profiles"))
                .query(&[("select", "id"), ("limit", "1")])
                .bearer_auth(self.bearer()),
        )
        .await
        .map(|_| ())
    }

    async fn read_profile(&self, id: &str) -> Result<UserProfile, BackendError> {
        let text = self
            .send(
                self.http
                    .get(self.rest_url("profiles"))
                    .query(&[("id", format!("eq.{id}")), ("select", "*".to_string())])
                    .header("Accept", SINGLE_OBJECT)
                    .bearer_auth(self.bearer()),
            )
            .await?;
        serde_json::from_str(&text).map_err(|e| BackendError::Decode(e.to_string()))
    }

    async fn insert_profile(&self, profile: &NewProfile) -> Result<UserProfile, BackendError> {
        let text = self
            .send(
                self.http
                    .post(self.rest_url("profiles"))
                    .header("Accept", SINGLE_OBJECT)
                    .header("Prefer", "return=representation")
                    .bearer_auth(self.bearer())
                    .json(profile),
            )
            .await?;
        serde_json::from_str(&text).map_err(|e| BackendError::Decode(e.to_string()))
    }

    async fn link_bookings(&self, user_id: &str, email: &str) -> Result<u64, BackendError> {
        let text = self
            .send(
                self.http
                    .patch(self.rest_url("bookings"))
                    .query(&[("customer_email", format!("eq.{email}")), ("user_id", "is.null".to_string())])
                    .header("Prefer", "return=representation")
                    .bearer_auth(self.bearer())
                    .json(&serde_json::json!({ "user_id": user_id })),
            )
            .await?;
        let rows: Vec<serde_json::Value> =
            serde_json::from_str(&text).map_err(|e| BackendError::Decode(e.to_string()))?;
        Ok(u64::try_from(rows.len()).unwrap_or(u64::MAX))
    }
}

#[cfg(test)]
#[path = "http_test.rs"]
mod tests;
