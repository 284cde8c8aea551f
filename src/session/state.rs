//! Session state machine types.

use serde::Serialize;

/// Session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Not connected.
    Disconnected,
    /// Opening the transport.
    Connecting,
    /// Transport up, waiting for the login response.
    Authenticating,
    /// Logged in and exchanging frames.
    Authenticated,
    /// Login rejected; keepalive keeps retrying.
    Unauthenticated,
    /// Stopped by its owner, never reused.
    Terminated,
}

impl SessionState {
    /// Check if data may flow.
    pub fn is_authenticated(&self) -> bool {
        matches!(self, SessionState::Authenticated)
    }

    /// Check if the transport is believed to be up.
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            SessionState::Authenticating
                | SessionState::Authenticated
                | SessionState::Unauthenticated
        )
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, SessionState::Terminated)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "Disconnected"),
            SessionState::Connecting => write!(f, "Connecting"),
            SessionState::Authenticating => write!(f, "Authenticating"),
            SessionState::Authenticated => write!(f, "Authenticated"),
            SessionState::Unauthenticated => write!(f, "Unauthenticated"),
            SessionState::Terminated => write!(f, "Terminated"),
        }
    }
}

/// Events consumed by the session loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Transport connected; login follows.
    Connected,
    /// Login accepted.
    Success,
    /// Schedule a reconnect with backoff.
    Reconnect,
    /// The switch demands a fresh login.
    SignIn,
    /// Resend the login request.
    Login,
    /// Reconnect now, skipping backoff.
    ForceReconnect,
}

impl std::fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionEvent::Connected => "connected",
            SessionEvent::Success => "success",
            SessionEvent::Reconnect => "reconnect",
            SessionEvent::SignIn => "sign-in",
            SessionEvent::Login => "login",
            SessionEvent::ForceReconnect => "force-reconnect",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_helpers() {
        assert!(SessionState::Authenticated.is_authenticated());
        assert!(SessionState::Authenticated.is_connected());
        assert!(SessionState::Unauthenticated.is_connected());
        assert!(!SessionState::Connecting.is_connected());
        assert!(SessionState::Terminated.is_terminated());
        assert_eq!(SessionState::Authenticating.to_string(), "Authenticating");
        assert_eq!(SessionEvent::SignIn.to_string(), "sign-in");
    }
}
