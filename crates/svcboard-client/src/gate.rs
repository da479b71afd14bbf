use std::sync::atomic::{AtomicU64, Ordering};

use svcboard_core::{SessionStatus, UserInfo};
use tracing::debug;

use crate::ClientError;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AuthState {
    /// Session check in flight. Protected content stays hidden.
    #[default]
    Checking,
    Unauthenticated,
    Authenticated(String),
}

/// Client-side view of whether the caller holds an admin session.
#[derive(Debug, Default)]
pub struct AuthGate {
    state: AuthState,
    last_error: Option<String>,
}

impl AuthGate {
    /// A gate for a freshly entered protected view: starts in [`AuthState::Checking`].
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &AuthState {
        &self.state
    }

    pub fn username(&self) -> Option<&str> {
        match &self.state {
            AuthState::Authenticated(username) => Some(username),
            _ => None,
        }
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn can_render_protected(&self) -> bool {
        matches!(self.state, AuthState::Authenticated(_))
    }

    /// The protected view must send the user to the login entry point.
    pub fn must_redirect(&self) -> bool {
        self.state == AuthState::Unauthenticated
    }

    pub fn begin_check(&mut self) {
        self.state = AuthState::Checking;
    }

    /// A failed check counts as unauthenticated.
    pub fn check_completed(&mut self, outcome: Result<&SessionStatus, &ClientError>) {
        self.state = match outcome {
            Ok(SessionStatus {
                authenticated: true,
                user: Some(user),
            }) => AuthState::Authenticated(user.username.clone()),
            Ok(_) => AuthState::Unauthenticated,
            Err(err) => {
                debug!(error = %err, "session check failed");
                AuthState::Unauthenticated
            }
        };
    }

    pub fn login_succeeded(&mut self, user: &UserInfo) {
        self.last_error = None;
        self.state = AuthState::Authenticated(user.username.clone());
    }

    /// Bad credentials leave the state untouched and record the message for display.
    pub fn login_failed(&mut self, err: &ClientError) {
        self.last_error = Some(err.user_message());
    }

    /// Explicit logout, or the server refusing an authenticated action.
    pub fn logged_out(&mut self) {
        self.state = AuthState::Unauthenticated;
    }

    /// Keep a failed request visible to the user. Authorization failures also end the
    /// session locally.
    pub fn request_failed(&mut self, err: &ClientError) {
        if err.requires_login() {
            self.logged_out();
        }
        self.last_error = Some(err.user_message());
    }

    pub fn clear_error(&mut self) {
        self.last_error = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewTicket(u64);

/// Generation counter for a view. Results carried by an outdated ticket belong to a
/// view the user already left and are dropped.
#[derive(Debug, Default)]
pub struct ViewScope {
    generation: AtomicU64,
}

impl ViewScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter (or re-enter) the view. Tickets issued earlier become stale.
    pub fn enter(&self) -> ViewTicket {
        ViewTicket(self.generation.fetch_add(1, Ordering::AcqRel) + 1)
    }

    pub fn leave(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn is_current(&self, ticket: ViewTicket) -> bool {
        self.generation.load(Ordering::Acquire) == ticket.0
    }

    pub fn accept<T>(&self, ticket: ViewTicket, value: T) -> Option<T> {
        if self.is_current(ticket) {
            Some(value)
        } else {
            debug!("discarding result for a view that is no longer shown");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(username: Option<&str>) -> SessionStatus {
        match username {
            Some(username) => SessionStatus {
                authenticated: true,
                user: Some(UserInfo {
                    id: 0,
                    username: username.to_string(),
                }),
            },
            None => SessionStatus::anonymous(),
        }
    }

    #[test]
    fn gate_starts_checking_and_hides_protected_content() {
        let gate = AuthGate::new();
        assert_eq!(gate.state(), &AuthState::Checking);
        assert!(!gate.can_render_protected());
        assert!(!gate.must_redirect());
    }

    #[test]
    fn check_outcomes_drive_transitions() {
        let mut gate = AuthGate::new();
        gate.check_completed(Ok(&status(Some("admin"))));
        assert_eq!(gate.username(), Some("admin"));

        gate.begin_check();
        gate.check_completed(Ok(&status(None)));
        assert!(gate.must_redirect());

        gate.begin_check();
        gate.check_completed(Err(&ClientError::NotFound));
        assert_eq!(gate.state(), &AuthState::Unauthenticated);
    }

    #[test]
    fn failed_login_keeps_state_and_surfaces_message() {
        let mut gate = AuthGate::new();
        gate.check_completed(Ok(&status(None)));
        gate.login_failed(&ClientError::Authentication("Invalid credentials".into()));
        assert_eq!(gate.state(), &AuthState::Unauthenticated);
        assert_eq!(gate.last_error(), Some("Invalid credentials"));

        gate.login_succeeded(&UserInfo {
            id: 0,
            username: "admin".into(),
        });
        assert_eq!(gate.state(), &AuthState::Authenticated("admin".into()));
        assert!(gate.last_error().is_none());

        gate.logged_out();
        assert!(gate.must_redirect());
    }

    #[test]
    fn failed_requests_stay_visible_and_401_ends_the_session() {
        let mut gate = AuthGate::new();
        gate.check_completed(Ok(&status(Some("admin"))));
        gate.request_failed(&ClientError::Status {
            status: 500,
            message: None,
        });
        assert_eq!(gate.username(), Some("admin"));
        assert_eq!(gate.last_error(), Some("Server error (500)."));

        gate.request_failed(&ClientError::Authorization);
        assert!(gate.must_redirect());
        gate.clear_error();
        assert!(gate.last_error().is_none());
    }

    #[test]
    fn stale_tickets_are_rejected() {
        let scope = ViewScope::new();
        let first = scope.enter();
        assert_eq!(scope.accept(first, 1), Some(1));
        let second = scope.enter();
        assert_eq!(scope.accept(first, 1), None);
        assert!(scope.is_current(second));
        scope.leave();
        assert_eq!(scope.accept(second, 2), None);
    }
}
