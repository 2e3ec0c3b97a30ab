use thiserror::Error;

use crate::error::UaError;
use crate::status::StatusCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Active,
    /// Requests are deferred until the reconnection controller finishes.
    Reconnecting,
    Closed,
}

#[derive(Debug, Error)]
pub enum SessionStateError {
    #[error("invalid session transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },
}

impl From<SessionStateError> for UaError {
    fn from(err: SessionStateError) -> Self {
        UaError::protocol(StatusCode::BAD_INVALID_STATE, err.to_string())
    }
}

impl SessionState {
    pub fn transition(self, next: SessionState) -> Result<SessionState, SessionStateError> {
        use SessionState::*;
        let allowed = match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Disconnected, Connecting) | (Connecting, Active) | (Connecting, Disconnected) => true,
            (Active, Reconnecting) | (Reconnecting, Active) | (Reconnecting, Disconnected) => true,
            (Disconnected, Reconnecting) => true,
            _ => false,
        };
        if allowed {
            Ok(next)
        } else {
            Err(SessionStateError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }
}
