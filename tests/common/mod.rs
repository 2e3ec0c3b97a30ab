#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use uasc::channel::{ChannelConnector, ServiceChannel};
use uasc::chunking::{Assembled, ChannelSecurity, ChunkAssembler, Chunker, TokenKeys};
use uasc::crypto::{
    derive_channel_keys, random_nonce, ApplicationCredentials, Certificate, MessageSecurityMode,
    SecurityPolicy,
};
use uasc::messages::*;
use uasc::subscription::{MonitoredItem, PublishTransport};
use uasc::transport::{
    Acknowledge, Hello, MessageType, NegotiatedLimits, RawChunk, HEADER_SIZE,
};
use uasc::{SessionEvent, StatusCode, UaError};

/// Routes library logs to the test output; `RUST_LOG=uasc=debug` shows the details.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ---------------------------------------------------------------------------------------
// In-process server speaking the real wire protocol over any byte stream.
// ---------------------------------------------------------------------------------------

pub type Handler = Arc<dyn Fn(&ServiceRequest) -> Option<ServiceResponse> + Send + Sync>;

#[derive(Clone)]
pub struct MockOptions {
    pub channel_id: u32,
    pub buffer_size: u32,
    pub mode: MessageSecurityMode,
    pub credentials: Option<(Arc<ApplicationCredentials>, Certificate)>,
    /// Server nonce length to send instead of the policy's.
    pub nonce_length: Option<usize>,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            channel_id: 42,
            buffer_size: 8192,
            mode: MessageSecurityMode::None,
            credentials: None,
            nonce_length: None,
        }
    }
}

impl MockOptions {
    pub fn secured(
        mode: MessageSecurityMode,
        server: Arc<ApplicationCredentials>,
        client_certificate: Certificate,
    ) -> Self {
        Self {
            mode,
            credentials: Some((server, client_certificate)),
            ..Self::default()
        }
    }

    fn security(&self) -> ChannelSecurity {
        match &self.credentials {
            Some((server, client)) if self.mode.signs() => ChannelSecurity::new(
                SecurityPolicy::Aes256Sha256Ed25519,
                self.mode,
                Some(server.clone()),
                Some(client.clone()),
            )
            .expect("server security"),
            _ => ChannelSecurity::none(),
        }
    }
}

pub struct MockServer {
    pub opens: Arc<Mutex<Vec<OpenSecureChannelRequest>>>,
    pub requests: Arc<Mutex<Vec<ServiceRequest>>>,
    kill: Arc<Notify>,
    task: JoinHandle<Result<(), UaError>>,
}

impl MockServer {
    pub fn spawn<S>(stream: S, options: MockOptions, handler: Handler) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let opens = Arc::new(Mutex::new(Vec::new()));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let kill = Arc::new(Notify::new());
        let task = tokio::spawn(serve(
            stream,
            options,
            handler,
            opens.clone(),
            requests.clone(),
            kill.clone(),
        ));
        Self {
            opens,
            requests,
            kill,
            task,
        }
    }

    /// Drops the server end of the stream.
    pub fn drop_connection(&self) {
        self.kill.notify_one();
    }

    pub async fn finished(self) -> Result<(), UaError> {
        self.task.await.expect("server task")
    }
}

pub async fn read_chunk<S: AsyncRead + Unpin>(stream: &mut S) -> Result<RawChunk, UaError> {
    let mut header = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header).await?;
    let size = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
    let mut bytes = header.to_vec();
    bytes.resize(size, 0);
    stream.read_exact(&mut bytes[HEADER_SIZE..]).await?;
    RawChunk::from_bytes(&bytes)
}

async fn write_chunks<S: AsyncWrite + Unpin>(
    stream: &mut S,
    chunks: Vec<RawChunk>,
) -> Result<(), UaError> {
    for chunk in chunks {
        stream.write_all(&chunk.to_bytes()).await?;
    }
    stream.flush().await?;
    Ok(())
}

fn token_id_of(chunk: &RawChunk) -> Option<u32> {
    if chunk.body.len() < 8 {
        return None;
    }
    let b = &chunk.body;
    Some(u32::from_le_bytes([b[4], b[5], b[6], b[7]]))
}

async fn serve<S>(
    mut stream: S,
    options: MockOptions,
    handler: Handler,
    opens: Arc<Mutex<Vec<OpenSecureChannelRequest>>>,
    requests: Arc<Mutex<Vec<ServiceRequest>>>,
    kill: Arc<Notify>,
) -> Result<(), UaError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let hello = Hello::from_chunk(&read_chunk(&mut stream).await?)?;
    let ack = Acknowledge {
        protocol_version: 0,
        receive_buffer_size: options.buffer_size,
        send_buffer_size: options.buffer_size,
        max_message_size: 0,
        max_chunk_count: 0,
    };
    write_chunks(&mut stream, vec![ack.to_chunk()]).await?;
    let limits = NegotiatedLimits::negotiate(&hello, &ack)?.reversed();

    let policy = SecurityPolicy::Aes256Sha256Ed25519;
    let mut security = options.security();
    let mut assembler = ChunkAssembler::new(limits);
    let mut chunker = Chunker::new();
    let mut renewed: Option<TokenKeys> = None;
    let mut next_token = 1u32;

    loop {
        let chunk = tokio::select! {
            chunk = read_chunk(&mut stream) => chunk?,
            _ = kill.notified() => return Ok(()),
        };
        // The client switches to a renewed token first; follow it.
        if chunk.message_type != MessageType::OpenChannel {
            let pending = renewed.as_ref().map(|t| t.token_id);
            if pending.is_some() && token_id_of(&chunk) == pending {
                if let Some(token) = renewed.take() {
                    security.install_token(token);
                }
            }
        }
        let Some(Assembled::Complete(message)) = assembler.push(&security, chunk)? else {
            continue;
        };
        let request = ServiceRequest::decode(&message.body)?;
        requests.lock().push(request.clone());
        match request {
            ServiceRequest::OpenSecureChannel(open) => {
                opens.lock().push(open.clone());
                let server_nonce = if options.mode.signs() {
                    random_nonce(options.nonce_length.unwrap_or(policy.nonce_length()))
                } else {
                    Vec::new()
                };
                let token_id = next_token;
                next_token += 1;
                let keys = options
                    .mode
                    .signs()
                    .then(|| derive_channel_keys(policy, &server_nonce, &open.client_nonce));
                let token = TokenKeys {
                    token_id,
                    keys,
                    expires_at: Instant::now()
                        + Duration::from_millis(u64::from(open.requested_lifetime)),
                };
                let response = OpenSecureChannelResponse {
                    response_header: ResponseHeader::good(&open.request_header),
                    server_protocol_version: 0,
                    security_token: ChannelSecurityToken {
                        channel_id: options.channel_id,
                        token_id,
                        created_at_ms: now_ms(),
                        revised_lifetime: open.requested_lifetime,
                    },
                    server_nonce,
                };
                security.channel_id = options.channel_id;
                let body = ServiceResponse::from(response).encode()?;
                let chunks = chunker.encode(
                    &security,
                    &limits,
                    MessageType::OpenChannel,
                    message.request_id,
                    &body,
                )?;
                write_chunks(&mut stream, chunks).await?;
                match open.request_type {
                    SecurityTokenRequestType::Issue => security.install_token(token),
                    SecurityTokenRequestType::Renew => renewed = Some(token),
                }
            }
            ServiceRequest::CloseSecureChannel(_) => return Ok(()),
            other => {
                let Some(response) = handler(&other) else {
                    continue;
                };
                let body = response.encode()?;
                let chunks = chunker.encode(
                    &security,
                    &limits,
                    MessageType::Message,
                    message.request_id,
                    &body,
                )?;
                write_chunks(&mut stream, chunks).await?;
            }
        }
    }
}

/// Answers `Generic` requests by echoing them and never answers type id 0xDEAD.
pub fn echo_handler() -> Handler {
    Arc::new(|request: &ServiceRequest| match request {
        ServiceRequest::Generic(generic) if generic.type_id == 0xDEAD => None,
        ServiceRequest::Generic(generic) => Some(ServiceResponse::Generic(GenericResponse {
            response_header: ResponseHeader::good(&generic.request_header),
            type_id: generic.type_id,
            body: generic.body.clone(),
        })),
        other => Some(ServiceResponse::fault(
            other.request_header(),
            StatusCode::BAD_SERVICE_UNSUPPORTED,
        )),
    })
}

/// Echo plus the session services a client needs to come up.
pub fn session_handler() -> Handler {
    let echo = echo_handler();
    Arc::new(move |request: &ServiceRequest| match request {
        ServiceRequest::CreateSession(create) => {
            Some(ServiceResponse::CreateSession(CreateSessionResponse {
                response_header: ResponseHeader::good(&create.request_header),
                session_id: Uuid::new_v4(),
                authentication_token: Uuid::new_v4(),
                revised_session_timeout_ms: create.requested_session_timeout_ms,
                server_nonce: vec![0u8; 32],
            }))
        }
        ServiceRequest::ActivateSession(activate) => {
            let response_header = if activate.request_header.authentication_token.is_some() {
                ResponseHeader::good(&activate.request_header)
            } else {
                ResponseHeader::with_status(
                    &activate.request_header,
                    StatusCode::BAD_SESSION_ID_INVALID,
                )
            };
            Some(ServiceResponse::ActivateSession(ActivateSessionResponse {
                response_header,
                server_nonce: vec![0u8; 32],
            }))
        }
        ServiceRequest::CloseSession(close) => {
            Some(ServiceResponse::CloseSession(CloseSessionResponse {
                response_header: ResponseHeader::good(&close.request_header),
            }))
        }
        other => echo(other),
    })
}

pub fn generic(type_id: u32, body: &[u8]) -> ServiceRequest {
    ServiceRequest::Generic(GenericRequest {
        request_header: RequestHeader::default(),
        type_id,
        body: body.to_vec(),
    })
}

// ---------------------------------------------------------------------------------------
// Scripted service-level doubles for session, engine and reconnection scenarios.
// ---------------------------------------------------------------------------------------

struct Parked {
    channel_id: u32,
    request: PublishRequest,
    reply: oneshot::Sender<Result<ServiceResponse, UaError>>,
}

#[derive(Default)]
pub struct FakeState {
    /// Authentication tokens of sessions the server still knows.
    pub sessions: HashSet<Uuid>,
    pub next_subscription_id: u32,
    pub transfer_failures: HashSet<u32>,
    pub transfer_unsupported: bool,
    /// Notifications kept for republish, by (subscription id, sequence number).
    pub retained: BTreeMap<(u32, u32), NotificationMessage>,
    pub requests: Vec<(u32, ServiceRequest)>,
    parked: VecDeque<Parked>,
}

pub struct FakeServer {
    state: Mutex<FakeState>,
}

impl FakeServer {
    pub fn new(first_subscription_id: u32) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState {
                next_subscription_id: first_subscription_id,
                ..FakeState::default()
            }),
        })
    }

    pub fn update(&self, f: impl FnOnce(&mut FakeState)) {
        f(&mut self.state.lock());
    }

    pub fn requests(&self) -> Vec<(u32, ServiceRequest)> {
        self.state.lock().requests.clone()
    }

    pub fn parked_count(&self) -> usize {
        self.state
            .lock()
            .parked
            .iter()
            .filter(|p| !p.reply.is_closed())
            .count()
    }

    pub fn parked_on(&self, channel_id: u32) -> Vec<PublishRequest> {
        self.state
            .lock()
            .parked
            .iter()
            .filter(|p| p.channel_id == channel_id && !p.reply.is_closed())
            .map(|p| p.request.clone())
            .collect()
    }

    /// Answers the oldest live publish request with `message`; returns the request.
    pub fn answer_publish(
        &self,
        subscription_id: u32,
        message: NotificationMessage,
    ) -> Option<PublishRequest> {
        let mut state = self.state.lock();
        while let Some(parked) = state.parked.pop_front() {
            if parked.reply.is_closed() {
                continue;
            }
            let response = ServiceResponse::Publish(publish_response(subscription_id, message));
            let _ = parked.reply.send(Ok(response));
            return Some(parked.request);
        }
        None
    }

    fn park(
        &self,
        channel_id: u32,
        request: PublishRequest,
    ) -> oneshot::Receiver<Result<ServiceResponse, UaError>> {
        let (reply, rx) = oneshot::channel();
        self.state.lock().parked.push_back(Parked {
            channel_id,
            request,
            reply,
        });
        rx
    }

    fn record(&self, channel_id: u32, request: &ServiceRequest) {
        self.state.lock().requests.push((channel_id, request.clone()));
    }

    fn handle(&self, request: &ServiceRequest) -> ServiceResponse {
        let mut state = self.state.lock();
        let header = request.request_header();
        match request {
            ServiceRequest::CreateSession(create) => {
                let token = Uuid::new_v4();
                state.sessions.insert(token);
                ServiceResponse::CreateSession(CreateSessionResponse {
                    response_header: ResponseHeader::good(header),
                    session_id: Uuid::new_v4(),
                    authentication_token: token,
                    revised_session_timeout_ms: create.requested_session_timeout_ms,
                    server_nonce: vec![1u8; 32],
                })
            }
            ServiceRequest::ActivateSession(_) => {
                let known = header
                    .authentication_token
                    .map(|t| state.sessions.contains(&t))
                    .unwrap_or(false);
                if !known {
                    return ServiceResponse::fault(header, StatusCode::BAD_SESSION_ID_INVALID);
                }
                ServiceResponse::ActivateSession(ActivateSessionResponse {
                    response_header: ResponseHeader::good(header),
                    server_nonce: vec![2u8; 32],
                })
            }
            ServiceRequest::CloseSession(_) => {
                if let Some(token) = header.authentication_token {
                    state.sessions.remove(&token);
                }
                ServiceResponse::CloseSession(CloseSessionResponse {
                    response_header: ResponseHeader::good(header),
                })
            }
            ServiceRequest::CreateSubscription(create) => {
                let subscription_id = state.next_subscription_id;
                state.next_subscription_id += 1;
                ServiceResponse::CreateSubscription(CreateSubscriptionResponse {
                    response_header: ResponseHeader::good(header),
                    subscription_id,
                    revised_publishing_interval_ms: create.parameters.publishing_interval_ms,
                    revised_lifetime_count: create.parameters.lifetime_count,
                    revised_max_keep_alive_count: create.parameters.max_keep_alive_count,
                })
            }
            ServiceRequest::CreateMonitoredItems(create) => {
                ServiceResponse::CreateMonitoredItems(CreateMonitoredItemsResponse {
                    response_header: ResponseHeader::good(header),
                    results: create
                        .items_to_create
                        .iter()
                        .map(|item| MonitoredItemCreateResult {
                            status_code: StatusCode::GOOD,
                            monitored_item_id: 100 + item.requested_parameters.client_handle,
                            revised_sampling_interval_ms: item
                                .requested_parameters
                                .sampling_interval_ms,
                            revised_queue_size: item.requested_parameters.queue_size,
                        })
                        .collect(),
                })
            }
            ServiceRequest::TransferSubscriptions(transfer) => {
                if state.transfer_unsupported {
                    return ServiceResponse::fault(header, StatusCode::BAD_SERVICE_UNSUPPORTED);
                }
                ServiceResponse::TransferSubscriptions(TransferSubscriptionsResponse {
                    response_header: ResponseHeader::good(header),
                    results: transfer
                        .subscription_ids
                        .iter()
                        .map(|id| TransferResult {
                            status_code: if state.transfer_failures.contains(id) {
                                StatusCode::BAD_SUBSCRIPTION_ID_INVALID
                            } else {
                                StatusCode::GOOD
                            },
                            available_sequence_numbers: Vec::new(),
                        })
                        .collect(),
                })
            }
            ServiceRequest::Republish(republish) => {
                let key = (
                    republish.subscription_id,
                    republish.retransmit_sequence_number,
                );
                match state.retained.get(&key) {
                    Some(message) => ServiceResponse::Republish(RepublishResponse {
                        response_header: ResponseHeader::good(header),
                        notification_message: message.clone(),
                    }),
                    None => ServiceResponse::fault(header, StatusCode::BAD_MESSAGE_NOT_AVAILABLE),
                }
            }
            ServiceRequest::DeleteSubscriptions(delete) => {
                ServiceResponse::DeleteSubscriptions(DeleteSubscriptionsResponse {
                    response_header: ResponseHeader::good(header),
                    results: vec![StatusCode::GOOD; delete.subscription_ids.len()],
                })
            }
            ServiceRequest::Generic(generic) => ServiceResponse::Generic(GenericResponse {
                response_header: ResponseHeader::good(header),
                type_id: generic.type_id,
                body: generic.body.clone(),
            }),
            _ => ServiceResponse::fault(header, StatusCode::BAD_SERVICE_UNSUPPORTED),
        }
    }
}

pub struct ScriptedChannel {
    id: u32,
    server: Arc<FakeServer>,
    broken: watch::Sender<Option<UaError>>,
}

impl ScriptedChannel {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn break_with(&self, status: StatusCode) {
        self.broken
            .send_replace(Some(UaError::transport(status, "scripted break")));
    }
}

#[async_trait]
impl ServiceChannel for ScriptedChannel {
    fn channel_id(&self) -> u32 {
        self.id
    }

    fn is_valid(&self) -> bool {
        self.broken.borrow().is_none()
    }

    async fn perform_transaction(
        &self,
        request: ServiceRequest,
    ) -> Result<ServiceResponse, UaError> {
        let broken = self.broken.borrow().clone();
        if let Some(err) = broken {
            return Err(if err.is_closed() {
                err
            } else {
                UaError::transport(
                    StatusCode::BAD_SECURE_CHANNEL_CLOSED,
                    "scripted channel broken",
                )
            });
        }
        self.server.record(self.id, &request);
        match request {
            ServiceRequest::Publish(publish) => {
                let reply = self.server.park(self.id, publish);
                tokio::select! {
                    result = reply => result.unwrap_or_else(|_| Err(UaError::closed("reply dropped"))),
                    err = self.wait_broken() => Err(err),
                }
            }
            other => Ok(self.server.handle(&other)),
        }
    }

    async fn wait_broken(&self) -> UaError {
        let mut rx = self.broken.subscribe();
        loop {
            if let Some(err) = rx.borrow_and_update().clone() {
                return err;
            }
            if rx.changed().await.is_err() {
                return UaError::closed("scripted channel dropped");
            }
        }
    }

    async fn close(&self) {
        if self.broken.borrow().is_none() {
            self.broken
                .send_replace(Some(UaError::closed("scripted channel closed")));
        }
    }
}

pub struct ScriptedConnector {
    server: Arc<FakeServer>,
    channels: Mutex<Vec<Arc<ScriptedChannel>>>,
    connects: AtomicU32,
    failures_remaining: AtomicU32,
    always_fail: AtomicBool,
}

impl ScriptedConnector {
    pub fn new(server: Arc<FakeServer>) -> Arc<Self> {
        Arc::new(Self {
            server,
            channels: Mutex::new(Vec::new()),
            connects: AtomicU32::new(0),
            failures_remaining: AtomicU32::new(0),
            always_fail: AtomicBool::new(false),
        })
    }

    pub fn latest(&self) -> Arc<ScriptedChannel> {
        self.channels.lock().last().cloned().expect("no channel yet")
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    pub fn set_always_fail(&self, fail: bool) {
        self.always_fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChannelConnector for ScriptedConnector {
    fn endpoint_url(&self) -> &str {
        "opc.tcp://scripted:4840"
    }

    async fn connect(&self) -> Result<Arc<dyn ServiceChannel>, UaError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let scheduled_failure = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if self.always_fail.load(Ordering::SeqCst) || scheduled_failure {
            return Err(UaError::transport(
                StatusCode::BAD_NOT_CONNECTED,
                "scripted connect failure",
            ));
        }
        let mut channels = self.channels.lock();
        let (broken, _) = watch::channel(None);
        let channel = Arc::new(ScriptedChannel {
            id: channels.len() as u32 + 1,
            server: self.server.clone(),
            broken,
        });
        channels.push(channel.clone());
        Ok(channel)
    }
}

/// Publish transport whose requests are answered by the test through the returned queue.
pub struct ScriptedPublisher {
    valid: AtomicBool,
    requests: mpsc::UnboundedSender<(PublishRequest, PublishReply)>,
}

pub type PublishReply = oneshot::Sender<Result<PublishResponse, UaError>>;

impl ScriptedPublisher {
    pub fn new() -> (
        Arc<Self>,
        mpsc::UnboundedReceiver<(PublishRequest, PublishReply)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                valid: AtomicBool::new(true),
                requests: tx,
            }),
            rx,
        )
    }

    pub fn set_valid(&self, valid: bool) {
        self.valid.store(valid, Ordering::SeqCst);
    }
}

#[async_trait]
impl PublishTransport for ScriptedPublisher {
    async fn publish(&self, request: PublishRequest) -> Result<PublishResponse, UaError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send((request, tx))
            .map_err(|_| UaError::closed("test finished"))?;
        rx.await
            .unwrap_or_else(|_| Err(UaError::closed("reply dropped")))
    }

    fn is_channel_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------------------
// Builders and waiting helpers.
// ---------------------------------------------------------------------------------------

pub fn parameters(interval_ms: f64, keep_alive: u32) -> SubscriptionParameters {
    SubscriptionParameters {
        publishing_interval_ms: interval_ms,
        max_keep_alive_count: keep_alive,
        ..SubscriptionParameters::default()
    }
}

pub fn created(subscription_id: u32, interval_ms: f64, keep_alive: u32) -> CreateSubscriptionResponse {
    CreateSubscriptionResponse {
        response_header: ResponseHeader::default(),
        subscription_id,
        revised_publishing_interval_ms: interval_ms,
        revised_lifetime_count: keep_alive * 3,
        revised_max_keep_alive_count: keep_alive,
    }
}

pub fn item(client_handle: u32) -> MonitoredItem {
    MonitoredItem::new(
        ReadValueId {
            node_id: format!("ns=2;i={}", 1000 + client_handle),
            attribute_id: 13,
        },
        MonitoringMode::Reporting,
        MonitoringParameters {
            client_handle,
            sampling_interval_ms: 100.0,
            queue_size: 1,
            discard_oldest: true,
        },
    )
}

pub fn data(sequence_number: u32) -> NotificationMessage {
    NotificationMessage {
        sequence_number,
        publish_time_ms: u64::from(sequence_number) * 1000,
        notification_data: vec![NotificationData::DataChange(vec![DataChangeItem {
            client_handle: 1,
            value: sequence_number.to_le_bytes().to_vec(),
            status: StatusCode::GOOD,
        }])],
    }
}

pub fn keep_alive(sequence_number: u32) -> NotificationMessage {
    NotificationMessage {
        sequence_number,
        publish_time_ms: 0,
        notification_data: Vec::new(),
    }
}

pub fn publish_response(subscription_id: u32, message: NotificationMessage) -> PublishResponse {
    PublishResponse {
        response_header: ResponseHeader::default(),
        subscription_id,
        available_sequence_numbers: Vec::new(),
        more_notifications: false,
        notification_message: message,
        results: Vec::new(),
    }
}

/// Polls `condition` on the (usually paused) clock until it holds.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition never held: {}", what);
}

pub async fn wait_for_event(
    events: &mut broadcast::Receiver<SessionEvent>,
    matches: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(60), wait)
        .await
        .expect("event not raised")
}
