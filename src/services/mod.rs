//! Session core services.
//!
//! ARCHITECTURE
//! ============
//! ```text
//! backend events ─► watcher ─► state / profile loader
//!                      │
//!                      ▼
//!               corruption check ─► recovery ─► forced sign-out
//!                                      ▲
//! timer / reconnect ─► validator ──────┘
//! ```
//! Each service holds `Arc`s to the capabilities it needs; the manager
//! wires them together once per session lifetime.

pub mod corruption;
pub mod profile;
pub mod recovery;
pub mod signout;
pub mod validator;
pub mod watcher;
