use std::sync::Arc;

use authkeeper::backend::UserMetadata;
use authkeeper::backend::http::HttpBackend;
use authkeeper::clock::SystemClock;
use authkeeper::route::MemoryNavigator;
use authkeeper::storage::FileStore;
use authkeeper::{BackendConfig, SessionConfig, SessionDeps, SessionManager};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let backend_config = BackendConfig::from_env().expect("AUTH_BACKEND_URL and AUTH_BACKEND_ANON_KEY required");
    let config = SessionConfig::from_env();
    let storage_path = std::env::var("AUTH_STORAGE_PATH").unwrap_or_else(|_| ".authkeeper.json".into());
    let start_route = std::env::var("AUTH_START_ROUTE").unwrap_or_else(|_| "/".into());

    let clock = Arc::new(SystemClock);
    let storage = Arc::new(FileStore::new(storage_path, clock.clone()));
    let backend =
        Arc::new(HttpBackend::new(backend_config, storage.clone(), clock.clone()).expect("http client init failed"));
    let navigator = Arc::new(MemoryNavigator::new(start_route));

    let manager = SessionManager::new(
        SessionDeps { backend: backend.clone(), records: backend, storage, navigator, clock },
        config,
    );
    let runtime = manager.start().expect("session manager start failed");

    if let (Ok(email), Ok(password)) = (std::env::var("AUTH_EMAIL"), std::env::var("AUTH_PASSWORD")) {
        let result = if std::env::var("AUTH_SIGN_UP").is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true")) {
            manager.sign_up(&email, &password, UserMetadata::default()).await
        } else {
            manager.sign_in(&email, &password).await
        };
        if let Some(error) = result.error {
            tracing::error!(%error, "authentication failed");
        }
    }

    let mut changes = manager.subscribe();
    loop {
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                let snap = changes.borrow_and_update().clone();
                tracing::info!(
                    authenticated = snap.is_authenticated,
                    loading = snap.is_loading,
                    user_id = ?snap.user.as_ref().map(|u| u.id.as_str()),
                    has_profile = snap.user_profile.is_some(),
                    corrupted = snap.is_state_corrupted,
                    "auth state changed"
                );
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    runtime.shutdown().await;
}
