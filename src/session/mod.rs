//! Session holder shared by the client, the publish engine and the reconnection controller.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::{ChannelConnector, ServiceChannel};
use crate::config::ClientConfig;
use crate::crypto::random_nonce;
use crate::error::UaError;
use crate::messages::{
    expect_response, ActivateSessionRequest, CloseSessionRequest, CreateSessionRequest,
    PublishRequest, PublishResponse, RequestHeader, ServiceRequest, ServiceResponse, UserIdentity,
};
use crate::status::StatusCode;
use crate::subscription::publish::PublishTransport;

pub mod state;
pub use state::{SessionState, SessionStateError};

const EVENT_CAPACITY: usize = 64;
const SESSION_NONCE_LENGTH: usize = 32;

/// Lifecycle notifications for applications watching the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ConnectionBreak { status: StatusCode },
    Backoff { attempt: u32, delay: Duration },
    SessionRepaired,
    SessionRepairFailed { reason: String },
    SessionClosed,
}

/// Server-assigned identity of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionIdentity {
    pub session_id: Uuid,
    pub authentication_token: Uuid,
    pub revised_timeout: Duration,
}

/// A repair request, tagged with the channel whose failure raised it.
#[derive(Debug, Clone)]
pub struct ReconnectTrigger {
    pub reason: UaError,
    /// Generation of the failed channel; `None` for explicit requests.
    pub channel_generation: Option<u64>,
}

struct CurrentChannel {
    channel: Arc<dyn ServiceChannel>,
    generation: u64,
}

enum Route {
    Deferred(oneshot::Receiver<Result<ServiceResponse, UaError>>),
    Direct(ServiceRequest),
}

struct DeferredTransaction {
    request: ServiceRequest,
    continuation: oneshot::Sender<Result<ServiceResponse, UaError>>,
}

#[derive(Debug, Clone)]
struct SessionSettings {
    application_uri: String,
    session_name: String,
    session_timeout: Duration,
}

/// Client session over a replaceable secure channel.
///
/// While the session is [`SessionState::Reconnecting`], [`call`](Self::call) queues
/// requests; the reconnection controller drains the queue in order once the session is
/// usable again, or fails it if the session is closed.
pub struct Session {
    connector: Arc<dyn ChannelConnector>,
    settings: SessionSettings,
    user_identity: UserIdentity,
    state: Mutex<SessionState>,
    identity: Mutex<Option<SessionIdentity>>,
    channel: Mutex<Option<CurrentChannel>>,
    next_generation: AtomicU64,
    watcher: Mutex<Option<JoinHandle<()>>>,
    deferred: Mutex<VecDeque<DeferredTransaction>>,
    reconnect_trigger: Mutex<Option<mpsc::UnboundedSender<ReconnectTrigger>>>,
    events: broadcast::Sender<SessionEvent>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("endpoint", &self.connector.endpoint_url())
            .field("state", &self.state())
            .field("identity", &self.identity())
            .finish()
    }
}

impl Session {
    pub fn new(
        connector: Arc<dyn ChannelConnector>,
        config: &ClientConfig,
        user_identity: UserIdentity,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            connector,
            settings: SessionSettings {
                application_uri: config.application_uri.clone(),
                session_name: config.session_name.clone(),
                session_timeout: config.session_timeout(),
            },
            user_identity,
            state: Mutex::new(SessionState::Disconnected),
            identity: Mutex::new(None),
            channel: Mutex::new(None),
            next_generation: AtomicU64::new(1),
            watcher: Mutex::new(None),
            deferred: Mutex::new(VecDeque::new()),
            reconnect_trigger: Mutex::new(None),
            events,
        })
    }

    pub fn connector(&self) -> &Arc<dyn ChannelConnector> {
        &self.connector
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn identity(&self) -> Option<SessionIdentity> {
        *self.identity.lock()
    }

    pub fn channel(&self) -> Option<Arc<dyn ServiceChannel>> {
        self.channel.lock().as_ref().map(|current| current.channel.clone())
    }

    /// Counts channels installed on this session; each install gets a new value.
    pub fn channel_generation(&self) -> Option<u64> {
        self.channel.lock().as_ref().map(|current| current.generation)
    }

    pub fn is_channel_valid(&self) -> bool {
        self.channel
            .lock()
            .as_ref()
            .map(|current| current.channel.is_valid())
            .unwrap_or(false)
    }

    /// True when `trigger` was raised by a channel that has since been replaced by a
    /// working one.
    pub fn is_stale_trigger(&self, trigger: &ReconnectTrigger) -> bool {
        let Some(failed) = trigger.channel_generation else {
            return false;
        };
        match self.channel.lock().as_ref() {
            Some(current) => current.generation != failed && current.channel.is_valid(),
            None => false,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    pub fn deferred_count(&self) -> usize {
        self.deferred.lock().len()
    }

    pub(crate) fn set_reconnect_trigger(&self, trigger: mpsc::UnboundedSender<ReconnectTrigger>) {
        *self.reconnect_trigger.lock() = Some(trigger);
    }

    pub(crate) fn transition(&self, next: SessionState) -> Result<(), UaError> {
        let mut state = self.state.lock();
        *state = state.transition(next)?;
        Ok(())
    }

    /// Moves a session that is being repaired to `next` under the state lock, so no
    /// call can be deferred after the queue is failed. Returns false if it was not
    /// reconnecting.
    pub(crate) fn leave_reconnecting(&self, next: SessionState) -> bool {
        let mut state = self.state.lock();
        if *state != SessionState::Reconnecting {
            return false;
        }
        *state = next;
        true
    }

    /// Opens the first channel, creates and activates the session.
    pub async fn connect(self: &Arc<Self>) -> Result<(), UaError> {
        self.transition(SessionState::Connecting)?;
        let result: Result<Arc<dyn ServiceChannel>, UaError> = async {
            let channel = self.connector.connect().await?;
            let established = match self.create_on(channel.as_ref()).await {
                Ok(_) => self.activate_on(channel.as_ref()).await,
                Err(err) => Err(err),
            };
            if let Err(err) = established {
                channel.close().await;
                return Err(err);
            }
            Ok(channel)
        }
        .await;
        match result {
            Ok(channel) => {
                self.install_channel(channel);
                self.transition(SessionState::Active)?;
                info!(endpoint = %self.connector.endpoint_url(), "session active");
                Ok(())
            }
            Err(err) => {
                let _ = self.transition(SessionState::Disconnected);
                Err(err)
            }
        }
    }

    /// Makes `channel` the session's channel and watches it for breaks.
    pub fn install_channel(self: &Arc<Self>, channel: Arc<dyn ServiceChannel>) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let weak: Weak<Session> = Arc::downgrade(self);
        let watched = channel.clone();
        let watcher = tokio::spawn(async move {
            let err = watched.wait_broken().await;
            if err.is_closed() {
                return;
            }
            if let Some(session) = weak.upgrade() {
                session.request_reconnect_on(generation, err);
            }
        });
        *self.channel.lock() = Some(CurrentChannel {
            channel,
            generation,
        });
        if let Some(old) = self.watcher.lock().replace(watcher) {
            old.abort();
        }
    }

    /// Detaches the current channel without closing it.
    pub fn take_channel(&self) -> Option<Arc<dyn ServiceChannel>> {
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.abort();
        }
        self.channel.lock().take().map(|current| current.channel)
    }

    fn current(&self) -> Option<(Arc<dyn ServiceChannel>, u64)> {
        self.channel
            .lock()
            .as_ref()
            .map(|current| (current.channel.clone(), current.generation))
    }

    fn is_current(&self, generation: u64) -> bool {
        self.channel_generation() == Some(generation)
    }

    /// Asks the reconnection controller (if any) to repair the session.
    pub fn request_reconnect(&self, reason: UaError) {
        self.send_trigger(ReconnectTrigger {
            reason,
            channel_generation: None,
        });
    }

    /// Reports that the channel installed as `generation` failed. Ignored by the
    /// controller once that channel has been replaced by a working one.
    pub fn request_reconnect_on(&self, generation: u64, reason: UaError) {
        self.send_trigger(ReconnectTrigger {
            reason,
            channel_generation: Some(generation),
        });
    }

    fn send_trigger(&self, trigger: ReconnectTrigger) {
        if matches!(self.state(), SessionState::Closed) {
            return;
        }
        match self.reconnect_trigger.lock().as_ref() {
            Some(sender) => {
                let _ = sender.send(trigger);
            }
            None => debug!(error = %trigger.reason, "no reconnection controller attached"),
        }
    }

    fn header(&self, request: &mut ServiceRequest) {
        if let Some(identity) = self.identity() {
            request.request_header_mut().authentication_token =
                Some(identity.authentication_token);
        }
    }

    /// Sends a request on a specific channel with this session's authentication token.
    pub async fn perform_on(
        &self,
        channel: &dyn ServiceChannel,
        mut request: ServiceRequest,
    ) -> Result<ServiceResponse, UaError> {
        self.header(&mut request);
        channel.perform_transaction(request).await?.into_result()
    }

    /// Sends a request on the current channel, bypassing the deferred queue. Failures that
    /// invalidate the session trigger a repair.
    pub async fn perform(&self, request: ServiceRequest) -> Result<ServiceResponse, UaError> {
        let (channel, generation) = self.current().ok_or_else(|| {
            UaError::transport(StatusCode::BAD_NOT_CONNECTED, "session has no channel")
        })?;
        let result = self.perform_on(channel.as_ref(), request).await;
        if let Err(err) = &result {
            // Failures on a channel that has since been replaced are stale.
            if err.needs_reconnect() && self.is_current(generation) {
                self.request_reconnect_on(generation, err.clone());
            }
        }
        result
    }

    /// Application entry point: performs `request`, or defers it while the session is
    /// being repaired.
    pub async fn call(&self, request: ServiceRequest) -> Result<ServiceResponse, UaError> {
        // Lock order: `state`, then `deferred`.
        let route = {
            let state = self.state.lock();
            match *state {
                SessionState::Closed => return Err(UaError::closed("session closed")),
                SessionState::Reconnecting => {
                    let (tx, rx) = oneshot::channel();
                    self.deferred.lock().push_back(DeferredTransaction {
                        request,
                        continuation: tx,
                    });
                    Route::Deferred(rx)
                }
                _ => Route::Direct(request),
            }
        };
        match route {
            Route::Deferred(rx) => rx
                .await
                .unwrap_or_else(|_| Err(UaError::closed("deferred transaction dropped"))),
            Route::Direct(request) => self.perform(request).await,
        }
    }

    /// Runs deferred transactions in arrival order, then marks the session active. Calls
    /// arriving during the drain queue behind the ones already waiting.
    pub async fn drain_deferred(&self) {
        loop {
            let popped = self.deferred.lock().pop_front();
            let next = match popped {
                Some(next) => next,
                None => {
                    let mut state = self.state.lock();
                    // A call may have been queued after the pop above.
                    if *state == SessionState::Reconnecting && !self.deferred.lock().is_empty() {
                        continue;
                    }
                    if *state == SessionState::Reconnecting {
                        *state = SessionState::Active;
                    }
                    return;
                }
            };
            let result = self.perform(next.request).await;
            let _ = next.continuation.send(result);
        }
    }

    pub fn fail_deferred(&self, err: UaError) -> usize {
        let drained: Vec<DeferredTransaction> = self.deferred.lock().drain(..).collect();
        let count = drained.len();
        for deferred in drained {
            let _ = deferred.continuation.send(Err(err.clone()));
        }
        count
    }

    pub async fn create_on(&self, channel: &dyn ServiceChannel) -> Result<SessionIdentity, UaError> {
        let request = ServiceRequest::from(CreateSessionRequest {
            request_header: RequestHeader::default(),
            client_application_uri: self.settings.application_uri.clone(),
            endpoint_url: self.connector.endpoint_url().to_string(),
            session_name: self.settings.session_name.clone(),
            client_nonce: random_nonce(SESSION_NONCE_LENGTH),
            requested_session_timeout_ms: self.settings.session_timeout.as_millis() as u64,
        });
        let response = channel.perform_transaction(request).await?.into_result()?;
        let response = expect_response!(response, CreateSession)?;
        let identity = SessionIdentity {
            session_id: response.session_id,
            authentication_token: response.authentication_token,
            revised_timeout: Duration::from_millis(response.revised_session_timeout_ms),
        };
        info!(session_id = %identity.session_id, "session created");
        *self.identity.lock() = Some(identity);
        Ok(identity)
    }

    /// Activates the current session identity on `channel`.
    pub async fn activate_on(&self, channel: &dyn ServiceChannel) -> Result<(), UaError> {
        if self.identity().is_none() {
            return Err(UaError::ServiceFault(StatusCode::BAD_SESSION_ID_INVALID));
        }
        let request = ServiceRequest::from(ActivateSessionRequest {
            request_header: RequestHeader::default(),
            user_identity: self.user_identity.clone(),
            locale_ids: Vec::new(),
        });
        let response = self.perform_on(channel, request).await?;
        expect_response!(response, ActivateSession)?;
        debug!(channel_id = channel.channel_id(), "session activated");
        Ok(())
    }

    /// Best-effort CloseSession for an identity that is no longer used.
    pub async fn close_stale(&self, channel: &dyn ServiceChannel, stale: SessionIdentity) {
        let mut request = ServiceRequest::from(CloseSessionRequest {
            request_header: RequestHeader::default(),
            delete_subscriptions: false,
        });
        request.request_header_mut().authentication_token = Some(stale.authentication_token);
        match channel.perform_transaction(request).await {
            Ok(_) => debug!(session_id = %stale.session_id, "stale session closed"),
            Err(err) => debug!(session_id = %stale.session_id, error = %err, "stale session not closed"),
        }
    }

    /// Closes the session and its channel. Deferred transactions fail with "closed".
    pub async fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closed;
        }
        let failed = self.fail_deferred(UaError::closed("session closed"));
        if failed > 0 {
            debug!(failed, "deferred transactions failed by close");
        }
        if let Some(channel) = self.take_channel() {
            if channel.is_valid() {
                let request = ServiceRequest::from(CloseSessionRequest {
                    request_header: RequestHeader::default(),
                    delete_subscriptions: true,
                });
                if let Err(err) = self.perform_on(channel.as_ref(), request).await {
                    warn!(error = %err, "CloseSession failed");
                }
            }
            channel.close().await;
        }
        info!("session closed");
        self.emit(SessionEvent::SessionClosed);
    }
}

#[async_trait]
impl PublishTransport for Session {
    async fn publish(&self, request: PublishRequest) -> Result<PublishResponse, UaError> {
        let response = self.perform(request.into()).await?;
        expect_response!(response, Publish)
    }

    fn is_channel_valid(&self) -> bool {
        Session::is_channel_valid(self)
    }
}
