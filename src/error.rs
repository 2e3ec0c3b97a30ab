use thiserror::Error;

use crate::status::StatusCode;

/// Errors surfaced by every layer of the client stack.
///
/// The variant tells the caller how far the failure reaches:
/// * `Transport` and `Security` are fatal to the channel they occurred on and are
///   handled by the reconnection controller.
/// * `Protocol`, `ServiceFault` and `Timeout` only fail the transaction they belong to.
/// * `Closed` is returned once the owner explicitly closed the channel or session.
#[derive(Debug, Clone, Error)]
pub enum UaError {
    #[error("transport error {status}: {message}")]
    Transport { status: StatusCode, message: String },
    #[error("protocol error {status}: {message}")]
    Protocol { status: StatusCode, message: String },
    #[error("security error {status}: {message}")]
    Security { status: StatusCode, message: String },
    #[error("service fault {0}")]
    ServiceFault(StatusCode),
    #[error("request {request_id} timed out after {timeout_ms} ms")]
    Timeout { request_id: u32, timeout_ms: u64 },
    #[error("closed: {0}")]
    Closed(String),
}

impl UaError {
    pub fn transport(status: StatusCode, message: impl Into<String>) -> Self {
        UaError::Transport {
            status,
            message: message.into(),
        }
    }

    pub fn protocol(status: StatusCode, message: impl Into<String>) -> Self {
        UaError::Protocol {
            status,
            message: message.into(),
        }
    }

    pub fn security(status: StatusCode, message: impl Into<String>) -> Self {
        UaError::Security {
            status,
            message: message.into(),
        }
    }

    pub fn closed(reason: impl Into<String>) -> Self {
        UaError::Closed(reason.into())
    }

    /// Status code carried by (or implied by) this error.
    pub fn status(&self) -> StatusCode {
        match self {
            UaError::Transport { status, .. }
            | UaError::Protocol { status, .. }
            | UaError::Security { status, .. } => *status,
            UaError::ServiceFault(status) => *status,
            UaError::Timeout { .. } => StatusCode::BAD_TIMEOUT,
            UaError::Closed(_) => StatusCode::BAD_SECURE_CHANNEL_CLOSED,
        }
    }

    /// True when the channel this error occurred on can no longer carry traffic.
    pub fn is_channel_fatal(&self) -> bool {
        matches!(self, UaError::Transport { .. } | UaError::Security { .. })
    }

    /// True when the session must be repaired before further requests can succeed.
    pub fn needs_reconnect(&self) -> bool {
        match self {
            UaError::Transport { .. } | UaError::Security { .. } => true,
            UaError::ServiceFault(status) => status.invalidates_session(),
            _ => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, UaError::Closed(_))
    }

    pub fn is_service_fault(&self, status: StatusCode) -> bool {
        matches!(self, UaError::ServiceFault(s) if *s == status)
    }
}

impl From<std::io::Error> for UaError {
    fn from(err: std::io::Error) -> Self {
        UaError::transport(StatusCode::BAD_COMMUNICATION_ERROR, err.to_string())
    }
}

impl From<serde_cbor::Error> for UaError {
    fn from(err: serde_cbor::Error) -> Self {
        UaError::protocol(StatusCode::BAD_DECODING_ERROR, err.to_string())
    }
}

pub type UaResult<T> = Result<T, UaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_follows_taxonomy() {
        let transport = UaError::transport(StatusCode::BAD_CONNECTION_CLOSED, "eof");
        assert!(transport.is_channel_fatal());
        assert!(transport.needs_reconnect());

        let protocol = UaError::protocol(StatusCode::BAD_REQUEST_HEADER_INVALID, "handle");
        assert!(!protocol.is_channel_fatal());
        assert!(!protocol.needs_reconnect());

        let fault = UaError::ServiceFault(StatusCode::BAD_SESSION_ID_INVALID);
        assert!(!fault.is_channel_fatal());
        assert!(fault.needs_reconnect());

        let timeout = UaError::Timeout {
            request_id: 3,
            timeout_ms: 100,
        };
        assert_eq!(timeout.status(), StatusCode::BAD_TIMEOUT);
        assert!(!timeout.needs_reconnect());
    }
}
