use thiserror::Error;

use crate::error::UaError;
use crate::status::StatusCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    Opening,
    Open,
    Renewing,
    Closing,
}

#[derive(Debug, Error)]
pub enum ChannelStateError {
    #[error("invalid channel transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: ChannelState,
        to: ChannelState,
    },
}

impl From<ChannelStateError> for UaError {
    fn from(err: ChannelStateError) -> Self {
        UaError::protocol(StatusCode::BAD_INVALID_STATE, err.to_string())
    }
}

impl ChannelState {
    pub fn transition(self, next: ChannelState) -> Result<ChannelState, ChannelStateError> {
        use ChannelState::*;
        let allowed = matches!(
            (self, next),
            (Closed, Opening)
                | (Opening, Open)
                | (Opening, Closed)
                | (Open, Renewing)
                | (Renewing, Open)
                | (Open, Closing)
                | (Renewing, Closing)
                | (Closing, Closed)
                | (Open, Closed)
                | (Renewing, Closed)
        );
        if allowed {
            Ok(next)
        } else {
            Err(ChannelStateError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    /// States in which service requests may be sent.
    pub fn accepts_requests(&self) -> bool {
        matches!(self, ChannelState::Open | ChannelState::Renewing)
    }
}
