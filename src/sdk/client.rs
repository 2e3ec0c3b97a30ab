use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::channel::{ChannelConnector, SecurityConfig, TcpChannelConnector};
use crate::config::{ClientConfig, ConfigError};
use crate::error::UaError;
use crate::messages::{
    expect_response, CreateMonitoredItemsRequest, CreateSubscriptionRequest,
    DeleteSubscriptionsRequest, MonitoredItemCreateResult, RequestHeader, ServiceRequest,
    ServiceResponse, SubscriptionParameters, UserIdentity,
};
use crate::reconnect::ReconnectionController;
use crate::session::{Session, SessionEvent, SessionState};
use crate::status::StatusCode;
use crate::subscription::{MonitoredItem, PublishEngine, Subscription, SubscriptionEvent};

/// Errors raised while bringing a client up.
///
/// Once connected, every operation reports [`UaError`] directly.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    /// The configuration failed validation before any connection was attempted.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    /// Channel, session or service failure while connecting.
    #[error(transparent)]
    Connect(#[from] UaError),
}

/// High-level client that wires a session, its publish engine and its reconnection
/// controller together.
///
/// # Guarantees
/// * Requests issued while the session is being repaired are deferred and replayed in order.
/// * Subscriptions survive channel loss: they are transferred, or recreated from the cached
///   monitored items, and missed notifications are republished without gaps.
/// * `close()` stops reconnection, the publish loop and the channel; nothing keeps running
///   afterwards.
pub struct UaClient {
    session: Arc<Session>,
    engine: Arc<PublishEngine>,
    controller: Arc<ReconnectionController>,
    next_client_handle: AtomicU32,
}

impl fmt::Debug for UaClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UaClient")
            .field("session", &self.session)
            .field("engine", &self.engine)
            .field("controller", &self.controller)
            .finish()
    }
}

impl UaClient {
    /// Connects to `endpoint_url` over TCP with an anonymous user.
    ///
    /// # Behavior
    /// * Validates `config` first.
    /// * Runs HEL/ACK, opens the secure channel, then creates and activates the session.
    /// * Starts token renewal and the reconnection controller.
    ///
    /// # Errors
    /// Returns `ClientError::Config` for an invalid configuration and `ClientError::Connect`
    /// for any failure on the wire.
    pub async fn connect(
        endpoint_url: &str,
        config: ClientConfig,
        security: SecurityConfig,
    ) -> Result<Self, ClientError> {
        config.validate()?;
        let connector = Arc::new(TcpChannelConnector::new(
            endpoint_url,
            config.transport.clone(),
            config.channel.clone(),
            security,
        ));
        Self::connect_with(connector, config, UserIdentity::Anonymous).await
    }

    /// Connects through any [`ChannelConnector`].
    ///
    /// # Errors
    /// Same as [`connect`](Self::connect).
    pub async fn connect_with(
        connector: Arc<dyn ChannelConnector>,
        config: ClientConfig,
        user_identity: UserIdentity,
    ) -> Result<Self, ClientError> {
        config.validate()?;
        let session = Session::new(connector, &config, user_identity);
        session.connect().await?;
        let engine = PublishEngine::new(session.clone(), config.publish.clone());
        let controller =
            ReconnectionController::attach(session.clone(), engine.clone(), config.reconnect);
        Ok(Self {
            session,
            engine,
            controller,
            next_client_handle: AtomicU32::new(1),
        })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn publish_engine(&self) -> &Arc<PublishEngine> {
        &self.engine
    }

    pub fn reconnection(&self) -> &Arc<ReconnectionController> {
        &self.controller
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.session.subscribe_events()
    }

    /// Unique client handle for a new monitored item.
    pub fn next_client_handle(&self) -> u32 {
        self.next_client_handle.fetch_add(1, Ordering::Relaxed)
    }

    /// Performs one service call on the session.
    ///
    /// # Errors
    /// Bad service results come back as [`UaError::ServiceFault`]; a call made after
    /// `close()` fails with [`UaError::Closed`].
    pub async fn call(
        &self,
        request: impl Into<ServiceRequest>,
    ) -> Result<ServiceResponse, UaError> {
        self.session.call(request.into()).await
    }

    /// Creates a subscription and starts publishing for it.
    ///
    /// Returns the server's subscription id and the stream of events for it. The id can
    /// change after a repair; a [`SubscriptionEvent::Remapped`] reports the new one.
    pub async fn create_subscription(
        &self,
        parameters: SubscriptionParameters,
    ) -> Result<(u32, mpsc::UnboundedReceiver<SubscriptionEvent>), UaError> {
        let response = self
            .call(CreateSubscriptionRequest {
                request_header: RequestHeader::default(),
                parameters: parameters.clone(),
            })
            .await?;
        let created = expect_response!(response, CreateSubscription)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = Subscription::from_response(parameters, &created, tx);
        let subscription_id = subscription.id();
        info!(
            subscription_id,
            interval_ms = created.revised_publishing_interval_ms,
            "subscription created"
        );
        self.engine.register(subscription);
        Ok((subscription_id, rx))
    }

    /// Creates monitored items and caches the accepted ones for recreation.
    ///
    /// # Errors
    /// Fails with a protocol error when the server returns a different number of results
    /// than items requested.
    pub async fn create_monitored_items(
        &self,
        subscription_id: u32,
        mut items: Vec<MonitoredItem>,
    ) -> Result<Vec<MonitoredItemCreateResult>, UaError> {
        let response = self
            .call(CreateMonitoredItemsRequest {
                request_header: RequestHeader::default(),
                subscription_id,
                items_to_create: items.iter().map(MonitoredItem::create_request).collect(),
            })
            .await?;
        let results = expect_response!(response, CreateMonitoredItems)?.results;
        if results.len() != items.len() {
            return Err(UaError::protocol(
                StatusCode::BAD_UNEXPECTED_ERROR,
                format!("{} results for {} monitored items", results.len(), items.len()),
            ));
        }
        for (item, result) in items.iter_mut().zip(results.iter()) {
            item.apply_result(result);
        }
        items.retain(|item| item.status.is_good());
        if !self.engine.add_items(subscription_id, items) {
            warn!(subscription_id, "monitored items created for unknown subscription");
        }
        Ok(results)
    }

    /// Stops publishing for a subscription and deletes it on the server.
    pub async fn delete_subscription(&self, subscription_id: u32) -> Result<(), UaError> {
        self.engine.unregister(subscription_id);
        let response = self
            .call(DeleteSubscriptionsRequest {
                request_header: RequestHeader::default(),
                subscription_ids: vec![subscription_id],
            })
            .await?;
        let results = expect_response!(response, DeleteSubscriptions)?.results;
        match results.first() {
            Some(status) if status.is_bad() => Err(UaError::ServiceFault(*status)),
            _ => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.session.state() == SessionState::Closed
    }

    /// Gracefully closes the client.
    ///
    /// # Behavior
    /// * Aborts any repair in progress; deferred requests fail with "closed".
    /// * Stops the publish loop, closes the session and then the channel.
    pub async fn close(&self) {
        self.controller.close();
        self.engine.shutdown();
        self.session.close().await;
    }
}
