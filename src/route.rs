//! Route classification and navigation.
//!
//! DESIGN
//! ======
//! Several rules depend on "where the user is": recovery aborts on the home
//! page, the auth callback resets the profile-fetch budget, and exhaustion
//! only signs out on protected pages. Overlapping prefixes are resolved by a
//! fixed priority, highest first:
//!
//! 1. `Home`: exactly `/`; safe harbor, never fought with redirects.
//! 2. `AuthCallback`: `/auth/callback...`.
//! 3. `AuthPage`: sign-in, sign-up and password reset pages.
//! 4. `Protected`: everything else.

use std::sync::Mutex;

pub const HOME_ROUTE: &str = "/";
pub const PROFILE_FETCH_FAILED_ROUTE: &str = "/auth/login?error=profile_fetch_failed";

const AUTH_CALLBACK_PREFIX: &str = "/auth/callback";
const AUTH_PAGES: &[&str] = &[
    "/auth/login",
    "/auth/signin",
    "/auth/signup",
    "/auth/register",
    "/auth/reset-password",
    "/auth/forgot-password",
    "/login",
    "/signup",
    "/reset-password",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    Home,
    AuthCallback,
    AuthPage,
    Protected,
}

impl RouteClass {
    /// Classify a path (query string and fragment ignored).
    #[must_use]
    pub fn of(route: &str) -> Self {
        let path = strip_query(route);
        let path = if path.len() > 1 { path.trim_end_matches('/') } else { path };

        if path.is_empty() || path == HOME_ROUTE {
            return Self::Home;
        }
        if path == AUTH_CALLBACK_PREFIX || path.starts_with("/auth/callback/") {
            return Self::AuthCallback;
        }
        if AUTH_PAGES
            .iter()
            .any(|page| path == *page || path.starts_with(&format!("{page}/")))
        {
            return Self::AuthPage;
        }
        Self::Protected
    }

    /// Pages where failures are expected transients rather than broken state.
    #[must_use]
    pub fn is_non_critical(self) -> bool {
        !matches!(self, Self::Protected)
    }
}

fn strip_query(route: &str) -> &str {
    let end = route.find(['?', '#']).unwrap_or(route.len());
    &route[..end]
}

// =============================================================================
// NAVIGATOR
// =============================================================================

/// Where the user currently is, and how to move them.
pub trait Navigator: Send + Sync {
    fn current_route(&self) -> String;

    fn navigate(&self, route: &str);

    fn route_class(&self) -> RouteClass {
        RouteClass::of(&self.current_route())
    }
}

/// In-process navigator that remembers every redirect.
pub struct MemoryNavigator {
    inner: Mutex<NavigatorInner>,
}

struct NavigatorInner {
    current: String,
    history: Vec<String>,
}

impl MemoryNavigator {
    #[must_use]
    pub fn new(initial: impl Into<String>) -> Self {
        Self { inner: Mutex::new(NavigatorInner { current: initial.into(), history: Vec::new() }) }
    }

    /// Redirects issued through [`Navigator::navigate`], oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .history
            .clone()
    }
}

impl Navigator for MemoryNavigator {
    fn current_route(&self) -> String {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .current
            .clone()
    }

    fn navigate(&self, route: &str) {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.current = route.to_owned();
        inner.history.push(route.to_owned());
    }
}

#[cfg(test)]
#[path = "route_test.rs"]
mod tests;
