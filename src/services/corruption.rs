//! Corruption detection for the user/profile pairing.
//!
//! [`detect`] is a pure predicate. [`CorruptionDetector`] wraps it with
//! edge-triggering so a corruption that persists across several state
//! changes is reported once, not on every evaluation.

use std::sync::Mutex;

use crate::route::RouteClass;
use crate::state::AuthSnapshot;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Corruption {
    /// The user fails the identity shape check.
    MalformedUser { user_id: String },
    /// A user exists, nothing is loading, and there is no profile.
    MissingProfile { user_id: String },
    /// The cached profile belongs to someone else.
    MismatchedProfile { user_id: String, profile_id: String },
}

/// Circumstances under which the snapshot is judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckContext {
    pub route: RouteClass,
    /// Inside the quiet period that follows a sign-out.
    pub skip_window_active: bool,
    /// Missing profile was accepted for the current session.
    pub profile_tolerated: bool,
}

#[must_use]
pub fn detect(snapshot: &AuthSnapshot, ctx: &CheckContext) -> Option<Corruption> {
    if ctx.route == RouteClass::Home || ctx.skip_window_active {
        return None;
    }
    let user = snapshot.user.as_ref()?;

    if !user.is_valid() {
        return Some(Corruption::MalformedUser { user_id: user.id.clone() });
    }

    match &snapshot.user_profile {
        Some(profile) if profile.id != user.id => {
            Some(Corruption::MismatchedProfile { user_id: user.id.clone(), profile_id: profile.id.clone() })
        }
        Some(_) => None,
        None if snapshot.is_fetching_profile || snapshot.is_loading || ctx.profile_tolerated => None,
        None => Some(Corruption::MissingProfile { user_id: user.id.clone() }),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evaluation {
    Clean,
    /// Newly detected; recovery should run.
    Detected(Corruption),
    /// Same corruption as last reported; already handled.
    Persisting(Corruption),
}

#[derive(Default)]
pub struct CorruptionDetector {
    reported: Mutex<Option<Corruption>>,
}

impl CorruptionDetector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn evaluate(&self, snapshot: &AuthSnapshot, ctx: &CheckContext) -> Evaluation {
        let found = detect(snapshot, ctx);
        let mut reported = self
            .reported
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match found {
            None => {
                *reported = None;
                Evaluation::Clean
            }
            Some(c) if reported.as_ref() == Some(&c) => Evaluation::Persisting(c),
            Some(c) => {
                *reported = Some(c.clone());
                Evaluation::Detected(c)
            }
        }
    }

    /// Forget the last report so the next detection fires again.
    pub fn reset(&self) {
        *self
            .reported
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = None;
    }
}

#[cfg(test)]
#[path = "corruption_test.rs"]
mod tests;
