use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::UaError;
use crate::messages::ServiceResponse;
use crate::status::StatusCode;

type Continuation = oneshot::Sender<Result<ServiceResponse, UaError>>;

struct PendingEntry {
    request_handle: u32,
    bytes_written: usize,
    continuation: Continuation,
}

/// A request that has been written but not yet answered.
#[derive(Debug)]
pub struct PendingResponse {
    request_id: u32,
    timeout: Duration,
    rx: oneshot::Receiver<Result<ServiceResponse, UaError>>,
}

impl PendingResponse {
    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        u32,
        Duration,
        oneshot::Receiver<Result<ServiceResponse, UaError>>,
    ) {
        (self.request_id, self.timeout, self.rx)
    }
}

/// Request id -> continuation map of one channel.
///
/// Every entry is resolved exactly once: by its response, by a timeout (removal without
/// resolution) or by [`fail_all`](Self::fail_all) when the channel goes away.
#[derive(Default)]
pub struct PendingTransactions {
    entries: Mutex<HashMap<u32, PendingEntry>>,
    closed: Mutex<Option<UaError>>,
}

impl PendingTransactions {
    pub fn register(
        &self,
        request_id: u32,
        request_handle: u32,
        timeout: Duration,
    ) -> Result<PendingResponse, UaError> {
        if let Some(err) = self.closed.lock().clone() {
            return Err(err);
        }
        let (tx, rx) = oneshot::channel();
        self.entries.lock().insert(
            request_id,
            PendingEntry {
                request_handle,
                bytes_written: 0,
                continuation: tx,
            },
        );
        Ok(PendingResponse {
            request_id,
            timeout,
            rx,
        })
    }

    pub fn set_bytes_written(&self, request_id: u32, bytes: usize) {
        if let Some(entry) = self.entries.lock().get_mut(&request_id) {
            entry.bytes_written = bytes;
        }
    }

    pub fn remove(&self, request_id: u32) -> bool {
        self.entries.lock().remove(&request_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers a decoded response. A response whose request handle differs from the
    /// request's fails that transaction only.
    pub fn complete(&self, request_id: u32, response: ServiceResponse) -> bool {
        let Some(entry) = self.entries.lock().remove(&request_id) else {
            warn!(request_id, "response for unknown or expired request");
            return false;
        };
        let handle = response.response_header().request_handle;
        let result = if handle == entry.request_handle {
            Ok(response)
        } else {
            Err(UaError::protocol(
                StatusCode::BAD_REQUEST_HEADER_INVALID,
                format!(
                    "response handle {} does not match request handle {}",
                    handle, entry.request_handle
                ),
            ))
        };
        debug!(
            request_id,
            bytes_written = entry.bytes_written,
            "transaction completed"
        );
        entry.continuation.send(result).is_ok()
    }

    pub fn fail(&self, request_id: u32, err: UaError) -> bool {
        match self.entries.lock().remove(&request_id) {
            Some(entry) => entry.continuation.send(Err(err)).is_ok(),
            None => false,
        }
    }

    /// Fails every outstanding transaction and refuses new ones.
    pub fn fail_all(&self, err: UaError) -> usize {
        {
            let mut closed = self.closed.lock();
            if closed.is_none() {
                *closed = Some(err.clone());
            }
        }
        let drained: Vec<PendingEntry> = self.entries.lock().drain().map(|(_, e)| e).collect();
        let count = drained.len();
        for entry in drained {
            let _ = entry.continuation.send(Err(err.clone()));
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{RequestHeader, ServiceResponse};

    fn response_with_handle(handle: u32) -> ServiceResponse {
        let header = RequestHeader {
            request_handle: handle,
            ..RequestHeader::default()
        };
        ServiceResponse::fault(&header, StatusCode::GOOD)
    }

    #[tokio::test]
    async fn matching_handle_delivers_response() {
        let pending = PendingTransactions::default();
        let waiter = pending.register(1, 10, Duration::from_secs(1)).unwrap();
        assert!(pending.complete(1, response_with_handle(10)));
        let (_, _, rx) = waiter.into_parts();
        assert!(rx.await.unwrap().is_ok());
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn handle_mismatch_fails_locally() {
        let pending = PendingTransactions::default();
        let waiter = pending.register(1, 10, Duration::from_secs(1)).unwrap();
        pending.complete(1, response_with_handle(11));
        let (_, _, rx) = waiter.into_parts();
        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, UaError::Protocol { .. }));
    }

    #[tokio::test]
    async fn fail_all_resolves_each_once_and_closes() {
        let pending = PendingTransactions::default();
        let a = pending.register(1, 1, Duration::from_secs(1)).unwrap();
        let b = pending.register(2, 2, Duration::from_secs(1)).unwrap();
        assert_eq!(pending.fail_all(UaError::closed("channel closed")), 2);
        for waiter in [a, b] {
            let (_, _, rx) = waiter.into_parts();
            assert!(rx.await.unwrap().unwrap_err().is_closed());
        }
        assert!(pending.register(3, 3, Duration::from_secs(1)).is_err());
        assert!(!pending.complete(1, response_with_handle(1)));
    }
}
