//! Client-side auth session core.
//!
//! Keeps the signed-in identity and its profile row consistent with an auth
//! backend, detects when the two drift apart, and recovers with bounded
//! retries. Every retry loop ends in a forced sign-out rather than a hang.
//!
//! The backend, record store, local storage, navigator and clock are all
//! trait objects supplied through [`SessionDeps`]; [`backend::http`] and
//! [`storage::FileStore`] are the production implementations.

pub mod backend;
pub mod clock;
pub mod config;
pub mod manager;
pub mod mirror;
pub mod route;
pub mod services;
pub mod state;
pub mod storage;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use config::{BackendConfig, SessionConfig};
pub use manager::{ActionResult, ManagerError, SessionDeps, SessionManager, SessionRuntime};
pub use state::{AuthSnapshot, AuthStateVersion};
