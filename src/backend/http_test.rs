use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use super::*;
use crate::config::SessionConfig;
use crate::mirror::LocalArtifacts;
use crate::route::MemoryNavigator;
use crate::services::signout::SignOutService;
use crate::state::StateStore;
use crate::storage::MemoryStore;
use crate::test_helpers::{TestClock, user};

const NOW: i64 = 1_750_000_000;

fn token_body(expires: &str) -> String {
    format!(
        r#"{{"access_token":"at","refresh_token":"rt",{expires},"user":{{"id":"u1","email":"u1@example.com","user_metadata":{{"full_name":"Ada"}}}}}}"#
    )
}

// =============================================================================
// parse_token_response
// =============================================================================

#[test]
fn token_response_with_expires_in_is_anchored_to_now() {
    let session = parse_token_response(&token_body(r#""expires_in":3600"#), NOW)
        .unwrap()
        .unwrap();
    assert_eq!(session.expires_at, NOW + 3600);
    assert_eq!(session.access_token, "at");
    assert_eq!(session.user.id, "u1");
    assert_eq!(session.user.user_metadata.full_name.as_deref(), Some("Ada"));
}

#[test]
fn explicit_expires_at_wins() {
    let body = token_body(r#""expires_in":3600,"expires_at":1750000100"#);
    let session = parse_token_response(&body, NOW).unwrap().unwrap();
    assert_eq!(session.expires_at, 1_750_000_100);
}

#[test]
fn sign_up_awaiting_confirmation_has_no_session() {
    let body = r#"{"id":"u1","email":"u1@example.com","user":{"id":"u1","email":"u1@example.com"}}"#;
    assert_eq!(parse_token_response(body, NOW).unwrap(), None);
}

#[test]
fn tokens_without_user_are_a_decode_error() {
    let body = r#"{"access_token":"at","refresh_token":"rt","expires_in":3600}"#;
    assert!(matches!(parse_token_response(body, NOW), Err(BackendError::Decode(_))));
}

#[test]
fn garbage_body_is_a_decode_error() {
    assert!(matches!(parse_token_response("<html>", NOW), Err(BackendError::Decode(_))));
}

// =============================================================================
// classify_error
// =============================================================================

#[test]
fn no_rows_code_is_not_found() {
    let body = r#"{"code":"PGRST116","message":"JSON object requested, multiple (or no) rows returned"}"#;
    assert_eq!(classify_error(406, body), BackendError::NotFound);
    assert_eq!(classify_error(404, ""), BackendError::NotFound);
}

#[test]
fn unique_violation_is_duplicate_key() {
    let body = r#"{"code":"23505","message":"duplicate key value violates unique constraint \"profiles_pkey\""}"#;
    assert_eq!(classify_error(409, body), BackendError::DuplicateKey);
    assert_eq!(classify_error(409, "conflict"), BackendError::DuplicateKey);
}

#[test]
fn bad_password_is_invalid_credentials() {
    let oauth = r#"{"error":"invalid_grant","error_description":"Invalid login credentials"}"#;
    assert_eq!(classify_error(400, oauth), BackendError::InvalidCredentials("Invalid login credentials".into()));

    let coded = r#"{"code":400,"error_code":"email_not_confirmed","msg":"Email not confirmed"}"#;
    assert_eq!(classify_error(400, coded), BackendError::InvalidCredentials("Email not confirmed".into()));
}

#[test]
fn other_failures_are_rejected_with_message() {
    let err = classify_error(503, "upstream connect error");
    assert_eq!(err, BackendError::Rejected { status: 503, message: "upstream connect error".into() });
    assert!(err.retryable());

    let err = classify_error(401, r#"{"message":"JWT expired"}"#);
    assert_eq!(err, BackendError::Rejected { status: 401, message: "JWT expired".into() });
    assert!(!err.retryable());
}

// =============================================================================
// HttpBackend without a server
// =============================================================================

fn backend(storage: Arc<MemoryStore>, clock: Arc<TestClock>) -> HttpBackend {
    backend_at("http://127.0.0.1:9".into(), storage, clock)
}

fn backend_at(base_url: String, storage: Arc<MemoryStore>, clock: Arc<TestClock>) -> HttpBackend {
    let config = BackendConfig { base_url, anon_key: "anon".into() };
    HttpBackend::new(config, storage, clock).unwrap()
}

fn store_tokens(storage: &MemoryStore, access_token: &str, expires_at: i64) {
    let stored = StoredSession {
        access_token: access_token.into(),
        refresh_token: "rt".into(),
        expires_at,
        user: AuthUser::new("u1", "u1@example.com"),
    };
    storage
        .set(SESSION_TOKENS_KEY, &serde_json::to_string(&stored).unwrap(), None)
        .unwrap();
}

#[tokio::test]
async fn fresh_stored_session_is_restored_without_network() {
    let clock = Arc::new(TestClock::new());
    let storage = Arc::new(MemoryStore::new(clock.clone()));
    let stored = StoredSession {
        access_token: "at".into(),
        refresh_token: "rt".into(),
        expires_at: clock.now().unix_timestamp() + 3600,
        user: AuthUser::new("u1", "u1@example.com"),
    };
    storage
        .set(SESSION_TOKENS_KEY, &serde_json::to_string(&stored).unwrap(), None)
        .unwrap();

    let backend = backend(storage, clock);
    assert_eq!(backend.current_session().await.unwrap(), Some(stored.user));
}

#[tokio::test]
async fn no_stored_tokens_means_no_session() {
    let clock = Arc::new(TestClock::new());
    let backend = backend(Arc::new(MemoryStore::new(clock.clone())), clock);

    assert_eq!(backend.current_session().await.unwrap(), None);
    assert_eq!(backend.get_current_user().await.unwrap(), None);
    assert_eq!(backend.refresh_session().await.unwrap(), None);
}

#[tokio::test]
async fn sign_out_without_tokens_only_announces_clear() {
    let clock = Arc::new(TestClock::new());
    let backend = backend(Arc::new(MemoryStore::new(clock.clone())), clock);
    let mut events = backend.subscribe().unwrap();
    assert!(backend.subscribe().is_none());

    backend.sign_out().await.unwrap();

    let event = events.recv().await.unwrap();
    assert_eq!(event.kind, AuthEventKind::SessionCleared);
    assert!(event.session.is_none());
}

// =============================================================================
// HttpBackend against a local listener
// =============================================================================

/// Serve one canned `(status, body)` per connection and record each request
/// head (request line plus headers).
async fn spawn_server(responses: Vec<(u16, &'static str)>) -> (String, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    let requests = Arc::new(Mutex::new(Vec::new()));
    let seen = requests.clone();

    tokio::spawn(async move {
        for (status, body) in responses {
            let (mut socket, _) = listener.accept().await.unwrap();
            let head = read_request(&mut socket).await;
            seen.lock().unwrap().push(head);
            let reply = format!(
                "HTTP/1.1 {status} Canned\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(reply.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
        }
    });

    (base_url, requests)
}

async fn read_request(socket: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = socket.read(&mut chunk).await.unwrap();
        if n == 0 {
            return String::from_utf8_lossy(&buf).into_owned();
        }
        buf.extend_from_slice(&chunk[..n]);
        let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };
        let head = String::from_utf8_lossy(&buf[..end]).into_owned();
        let body_len = head
            .lines()
            .find_map(|line| {
                line.to_ascii_lowercase()
                    .strip_prefix("content-length:")
                    .and_then(|v| v.trim().parse::<usize>().ok())
            })
            .unwrap_or(0);
        while buf.len() < end + 4 + body_len {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        return head;
    }
}

#[tokio::test]
async fn sign_out_paths_revoke_backend_session() {
    let (base_url, requests) = spawn_server(vec![(204, ""), (204, "")]).await;
    let clock = Arc::new(TestClock::new());
    let storage = Arc::new(MemoryStore::new(clock.clone()));
    let backend = Arc::new(backend_at(base_url, storage.clone(), clock.clone()));
    let config = SessionConfig::default();
    let artifacts =
        LocalArtifacts::new(storage.clone(), clock.clone(), config.mirror_freshness, config.skip_checks_window);
    let state = Arc::new(StateStore::new());
    let service = SignOutService::new(
        backend,
        state.clone(),
        artifacts.clone(),
        Arc::new(MemoryNavigator::new("/account")),
        clock.clone(),
        config,
    );
    let expires_at = clock.now().unix_timestamp() + 3600;

    store_tokens(&storage, "first", expires_at);
    state.accept_session(user("u1"), clock.now());
    artifacts.save_identity(&user("u1"));
    service.sign_out(false).await.unwrap();

    store_tokens(&storage, "second", expires_at);
    state.accept_session(user("u1"), clock.now());
    service.force("identity mismatch").await;

    let requests = requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].starts_with("POST /auth/v1/logout "));
    assert!(requests[0].to_ascii_lowercase().contains("authorization: bearer first"));
    assert!(requests[1].starts_with("POST /auth/v1/logout "));
    assert!(requests[1].to_ascii_lowercase().contains("authorization: bearer second"));
    assert_eq!(storage.get(SESSION_TOKENS_KEY).unwrap(), None);
    assert!(artifacts.load_identity().is_none());
    assert!(!state.snapshot().is_authenticated);
}

#[tokio::test]
async fn extreme_stored_expiry_refreshes_without_overflow() {
    let (base_url, requests) = spawn_server(vec![(
        400,
        r#"{"error":"invalid_grant","error_description":"Invalid Refresh Token: Refresh Token Not Found"}"#,
    )])
    .await;
    let clock = Arc::new(TestClock::new());
    let storage = Arc::new(MemoryStore::new(clock.clone()));
    store_tokens(&storage, "at", i64::MIN);
    let backend = backend_at(base_url, storage.clone(), clock);

    assert_eq!(backend.current_session().await.unwrap(), None);

    let requests = requests.lock().unwrap().clone();
    assert!(requests[0].starts_with("POST /auth/v1/token?grant_type=refresh_token "));
    assert_eq!(storage.get(SESSION_TOKENS_KEY).unwrap(), None);
}
