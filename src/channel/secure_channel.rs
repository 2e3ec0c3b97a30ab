use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use super::pending::{PendingResponse, PendingTransactions};
use super::state::ChannelState;
use super::token::SecurityToken;
use super::{ChannelEvent, ChannelStats, ServiceChannel};
use crate::chunking::{Assembled, ChannelSecurity, ChunkAssembler, Chunker, TokenKeys};
use crate::config::{ChannelConfig, TransportConfig};
use crate::crypto::{derive_channel_keys, random_nonce};
use crate::error::UaError;
use crate::messages::{
    expect_response, now_ms, CloseSecureChannelRequest, OpenSecureChannelRequest, RequestHeader,
    SecurityTokenRequestType, ServiceRequest, ServiceResponse,
};
use crate::status::StatusCode;
use crate::transport::{ErrorMessage, MessageType, RawChunk, TransportConnection};

const EVENT_CAPACITY: usize = 64;

/// Client end of one secure channel.
///
/// The channel owns its transport connection, a reader task that assembles and dispatches
/// responses, and a renewal task that replaces the security token before it expires. Both
/// tasks are aborted when the channel is closed or dropped.
pub struct SecureChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    config: ChannelConfig,
    connection: TransportConnection,
    security: RwLock<ChannelSecurity>,
    chunker: tokio::sync::Mutex<Chunker>,
    pending: PendingTransactions,
    state: Mutex<ChannelState>,
    token: Mutex<Option<SecurityToken>>,
    next_request_id: AtomicU32,
    next_request_handle: AtomicU32,
    completed: AtomicU64,
    events: broadcast::Sender<ChannelEvent>,
    broken: watch::Sender<Option<UaError>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    renewal: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("channel_id", &self.channel_id())
            .field("state", &self.state())
            .finish()
    }
}

impl SecureChannel {
    /// Connects over TCP, performs the transport handshake and opens the channel.
    pub async fn connect(
        endpoint_url: &str,
        transport: &TransportConfig,
        config: ChannelConfig,
        security: ChannelSecurity,
    ) -> Result<Self, UaError> {
        let connection = TransportConnection::connect(endpoint_url, transport).await?;
        Self::open_on(connection, config, security).await
    }

    /// Opens a channel over an already handshaken connection.
    pub async fn open_on(
        connection: TransportConnection,
        config: ChannelConfig,
        security: ChannelSecurity,
    ) -> Result<Self, UaError> {
        let inbound = connection.take_inbound()?;
        let limits = connection.limits();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (broken, _) = watch::channel(None);
        let inner = Arc::new(ChannelInner {
            config,
            connection,
            security: RwLock::new(security),
            chunker: tokio::sync::Mutex::new(Chunker::new()),
            pending: PendingTransactions::default(),
            state: Mutex::new(ChannelState::Closed),
            token: Mutex::new(None),
            next_request_id: AtomicU32::new(1),
            next_request_handle: AtomicU32::new(1),
            completed: AtomicU64::new(0),
            events,
            broken,
            reader: Mutex::new(None),
            renewal: Mutex::new(None),
        });
        let reader = tokio::spawn(read_loop(
            Arc::downgrade(&inner),
            inbound,
            ChunkAssembler::new(limits),
        ));
        *inner.reader.lock() = Some(reader);

        let channel = Self { inner };
        if let Err(err) = channel.open().await {
            channel.inner.shutdown(err.clone()).await;
            return Err(err);
        }
        Ok(channel)
    }

    /// Issues the first token.
    pub async fn open(&self) -> Result<(), UaError> {
        self.inner.transition(ChannelState::Opening)?;
        match self.inner.request_token(SecurityTokenRequestType::Issue).await {
            Ok(token) => {
                self.inner.transition(ChannelState::Open)?;
                info!(
                    channel_id = token.channel_id,
                    token_id = token.token_id,
                    lifetime_ms = token.revised_lifetime.as_millis() as u64,
                    "secure channel open"
                );
                let _ = self.inner.events.send(ChannelEvent::Opened {
                    channel_id: token.channel_id,
                    token_id: token.token_id,
                });
                let renewal = tokio::spawn(renewal_loop(Arc::downgrade(&self.inner)));
                if let Some(old) = self.inner.renewal.lock().replace(renewal) {
                    old.abort();
                }
                Ok(())
            }
            Err(err) => {
                let _ = self.inner.transition(ChannelState::Closed);
                Err(err)
            }
        }
    }

    /// Replaces the current token; transactions in flight are unaffected.
    pub async fn renew(&self) -> Result<(), UaError> {
        self.inner.renew().await
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state.lock()
    }

    pub fn current_token(&self) -> Option<SecurityToken> {
        self.inner.token.lock().clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.events.subscribe()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn stats(&self) -> ChannelStats {
        let transport = self.inner.connection.stats();
        ChannelStats {
            bytes_written: transport.bytes_written(),
            bytes_read: transport.bytes_read(),
            transactions_completed: self.inner.completed.load(Ordering::Relaxed),
        }
    }

    /// Writes a request and returns a handle to await its response separately.
    pub async fn start_transaction(
        &self,
        request: ServiceRequest,
    ) -> Result<PendingResponse, UaError> {
        if !self.inner.state.lock().accepts_requests() {
            return Err(UaError::closed("secure channel is not open"));
        }
        self.inner.send_request(MessageType::Message, request).await
    }

    /// Waits for a service response. Only these exchanges count towards
    /// [`ChannelStats::transactions_completed`]; OPN and CLO do not.
    pub async fn wait_transaction(
        &self,
        pending: PendingResponse,
    ) -> Result<ServiceResponse, UaError> {
        let result = self.inner.wait_response(pending).await;
        if result.is_ok() {
            self.inner.completed.fetch_add(1, Ordering::Relaxed);
        }
        result
    }
}

#[async_trait]
impl ServiceChannel for SecureChannel {
    fn channel_id(&self) -> u32 {
        self.inner.security.read().channel_id
    }

    fn is_valid(&self) -> bool {
        self.state().accepts_requests() && self.inner.broken.borrow().is_none()
    }

    async fn perform_transaction(
        &self,
        request: ServiceRequest,
    ) -> Result<ServiceResponse, UaError> {
        let pending = self.start_transaction(request).await?;
        self.wait_transaction(pending).await
    }

    async fn wait_broken(&self) -> UaError {
        let mut rx = self.inner.broken.subscribe();
        loop {
            if let Some(err) = rx.borrow_and_update().clone() {
                return err;
            }
            if rx.changed().await.is_err() {
                return UaError::closed("secure channel dropped");
            }
        }
    }

    /// Sends CLO (no reply expected), tears the connection down and fails every pending
    /// transaction.
    async fn close(&self) {
        let sending = {
            let mut state = self.inner.state.lock();
            match state.transition(ChannelState::Closing) {
                Ok(next) => {
                    *state = next;
                    true
                }
                Err(_) => false,
            }
        };
        if let Some(renewal) = self.inner.renewal.lock().take() {
            renewal.abort();
        }
        if sending {
            let request = ServiceRequest::from(CloseSecureChannelRequest {
                request_header: RequestHeader::default(),
            });
            if let Err(err) = self.inner.send_close(request).await {
                debug!(error = %err, "CLO not delivered");
            }
        }
        self.inner
            .shutdown(UaError::closed("secure channel closed"))
            .await;
        let _ = self.inner.events.send(ChannelEvent::Closed);
    }
}

impl ChannelInner {
    fn transition(&self, next: ChannelState) -> Result<(), UaError> {
        let mut state = self.state.lock();
        *state = state.transition(next)?;
        Ok(())
    }

    fn limits(&self) -> crate::transport::NegotiatedLimits {
        self.connection.limits()
    }

    async fn renew(&self) -> Result<(), UaError> {
        self.transition(ChannelState::Renewing)?;
        let result = self.request_token(SecurityTokenRequestType::Renew).await;
        // A close may have raced the renewal; only a renewing channel goes back to Open.
        {
            let mut state = self.state.lock();
            if *state == ChannelState::Renewing {
                *state = ChannelState::Open;
            }
        }
        let token = result?;
        info!(
            channel_id = token.channel_id,
            token_id = token.token_id,
            "security token renewed"
        );
        let _ = self.events.send(ChannelEvent::TokenRenewed {
            token_id: token.token_id,
        });
        Ok(())
    }

    async fn request_token(
        &self,
        request_type: SecurityTokenRequestType,
    ) -> Result<SecurityToken, UaError> {
        let (policy, mode, channel_id) = {
            let security = self.security.read();
            (security.policy, security.mode, security.channel_id)
        };
        let client_nonce = if mode.signs() {
            random_nonce(policy.nonce_length())
        } else {
            Vec::new()
        };
        let requested_lifetime = self.config.requested_lifetime_ms;
        let request = ServiceRequest::from(OpenSecureChannelRequest {
            request_header: RequestHeader::default(),
            client_protocol_version: self.limits().protocol_version,
            request_type,
            security_mode: mode,
            client_nonce: client_nonce.clone(),
            requested_lifetime,
        });
        let pending = self.send_request(MessageType::OpenChannel, request).await?;
        let response = self.wait_response(pending).await?.into_result()?;
        let response = expect_response!(response, OpenSecureChannel)?;

        if request_type == SecurityTokenRequestType::Renew
            && response.security_token.channel_id != channel_id
        {
            return Err(UaError::security(
                StatusCode::BAD_SECURE_CHANNEL_ID_INVALID,
                format!(
                    "renewal answered for channel {} instead of {}",
                    response.security_token.channel_id, channel_id
                ),
            ));
        }
        let keys = if mode.signs() {
            if response.server_nonce.len() != client_nonce.len() {
                return Err(UaError::security(
                    StatusCode::BAD_NONCE_INVALID,
                    format!(
                        "server nonce of {} bytes, expected {}",
                        response.server_nonce.len(),
                        client_nonce.len()
                    ),
                ));
            }
            Some(derive_channel_keys(
                policy,
                &client_nonce,
                &response.server_nonce,
            ))
        } else {
            None
        };

        let token = SecurityToken::from_response(&response.security_token, requested_lifetime);
        {
            let mut security = self.security.write();
            security.channel_id = token.channel_id;
            security.install_token(TokenKeys {
                token_id: token.token_id,
                keys,
                expires_at: token.expires_at(),
            });
        }
        *self.token.lock() = Some(token.clone());
        Ok(token)
    }

    /// Assigns request id and handle, chunks the request and writes it. The chunker lock is
    /// held across the write so sequence numbers reach the wire in order.
    async fn send_request(
        &self,
        message_type: MessageType,
        mut request: ServiceRequest,
    ) -> Result<PendingResponse, UaError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let request_handle = self.next_request_handle.fetch_add(1, Ordering::Relaxed);
        {
            let header = request.request_header_mut();
            header.request_handle = request_handle;
            if header.timestamp_ms == 0 {
                header.timestamp_ms = now_ms();
            }
        }
        let timeout = self
            .config
            .transaction_timeout(request.request_header().timeout_hint);
        let body = request.encode()?;
        let pending = self.pending.register(request_id, request_handle, timeout)?;

        let limits = self.limits();
        let mut chunker = self.chunker.lock().await;
        let chunks = {
            let security = self.security.read();
            chunker.encode(&security, &limits, message_type, request_id, &body)
        };
        let chunks = match chunks {
            Ok(chunks) => chunks,
            Err(err) => {
                self.pending.remove(request_id);
                return Err(err);
            }
        };
        let bytes: usize = chunks.iter().map(RawChunk::len).sum();
        if let Err(err) = self.connection.write_all(chunks).await {
            drop(chunker);
            self.pending.remove(request_id);
            self.mark_broken(err.clone());
            return Err(err);
        }
        drop(chunker);
        self.pending.set_bytes_written(request_id, bytes);
        debug!(
            request_id,
            request_handle,
            service = request.type_name(),
            bytes,
            "request sent"
        );
        Ok(pending)
    }

    async fn send_close(&self, request: ServiceRequest) -> Result<(), UaError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let body = request.encode()?;
        let limits = self.limits();
        let mut chunker = self.chunker.lock().await;
        let chunks = {
            let security = self.security.read();
            chunker.encode(
                &security,
                &limits,
                MessageType::CloseChannel,
                request_id,
                &body,
            )?
        };
        self.connection.write_all(chunks).await
    }

    async fn wait_response(&self, pending: PendingResponse) -> Result<ServiceResponse, UaError> {
        let (request_id, timeout, rx) = pending.into_parts();
        match time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(UaError::closed("transaction dropped by its channel")),
            Err(_) => {
                self.pending.remove(request_id);
                warn!(
                    request_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "request timed out"
                );
                let _ = self.events.send(ChannelEvent::TimedOutRequest { request_id });
                Err(UaError::Timeout {
                    request_id,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    fn dispatch(&self, assembled: Assembled) {
        match assembled {
            Assembled::Aborted {
                request_id,
                status,
                reason,
            } => {
                self.pending
                    .fail(request_id, UaError::protocol(status, reason));
            }
            Assembled::Complete(message) => match ServiceResponse::decode(&message.body) {
                Ok(response) => {
                    self.pending.complete(message.request_id, response);
                }
                Err(err) => {
                    warn!(request_id = message.request_id, error = %err, "undecodable response");
                    self.pending.fail(message.request_id, err);
                }
            },
        }
    }

    /// Records a channel-fatal error: pending transactions fail and watchers are woken.
    fn mark_broken(&self, err: UaError) {
        {
            let mut state = self.state.lock();
            if matches!(*state, ChannelState::Closing | ChannelState::Closed) {
                return;
            }
            *state = ChannelState::Closed;
        }
        if let Some(renewal) = self.renewal.lock().take() {
            renewal.abort();
        }
        warn!(
            channel_id = self.security.read().channel_id,
            error = %err,
            "secure channel broken"
        );
        self.pending.fail_all(err.clone());
        let _ = self.events.send(ChannelEvent::ConnectionBroken {
            status: err.status(),
        });
        self.broken.send_replace(Some(err));
    }

    async fn shutdown(&self, reason: UaError) {
        if let Some(renewal) = self.renewal.lock().take() {
            renewal.abort();
        }
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.connection.disconnect().await;
        self.pending.fail_all(reason.clone());
        *self.state.lock() = ChannelState::Closed;
        self.security.write().reset_tokens();
        if self.broken.borrow().is_none() {
            self.broken.send_replace(Some(reason));
        }
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        if let Some(handle) = self.reader.get_mut().take() {
            handle.abort();
        }
        if let Some(handle) = self.renewal.get_mut().take() {
            handle.abort();
        }
    }
}

async fn read_loop(
    inner: Weak<ChannelInner>,
    mut inbound: mpsc::Receiver<Result<RawChunk, UaError>>,
    mut assembler: ChunkAssembler,
) {
    let failure = loop {
        let Some(item) = inbound.recv().await else {
            break UaError::transport(StatusCode::BAD_CONNECTION_CLOSED, "inbound queue ended");
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let chunk = match item {
            Ok(chunk) => chunk,
            Err(err) => break UaError::transport(err.status(), err.to_string()),
        };
        if chunk.message_type == MessageType::Error {
            match ErrorMessage::from_chunk(&chunk) {
                Ok(error) => break UaError::transport(error.status, error.reason),
                Err(err) => break UaError::transport(err.status(), err.to_string()),
            }
        }
        let outcome = {
            let security = inner.security.read();
            assembler.push(&security, chunk)
        };
        match outcome {
            Ok(Some(assembled)) => inner.dispatch(assembled),
            Ok(None) => {}
            Err(err) => break err,
        }
    };
    if let Some(inner) = inner.upgrade() {
        inner.mark_broken(failure);
    }
}

async fn renewal_loop(inner: Weak<ChannelInner>) {
    loop {
        let delay = {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let token = inner.token.lock().clone();
            match token {
                Some(token) => token.renewal_delay(&inner.config),
                None => return,
            }
        };
        time::sleep(delay).await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if !inner.state.lock().accepts_requests() {
            return;
        }
        if let Err(err) = inner.renew().await {
            warn!(error = %err, "token renewal failed");
            inner.mark_broken(err);
            return;
        }
    }
}
