//! Repairs a session after its channel breaks: new channel, session reactivation (or
//! recreation), subscription transfer (or recreation) and republish of missed notifications.
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::ServiceChannel;
use crate::config::ReconnectConfig;
use crate::error::UaError;
use crate::messages::{
    expect_response, CreateMonitoredItemsRequest, CreateSubscriptionRequest, RepublishRequest,
    RequestHeader, ServiceRequest, TransferSubscriptionsRequest,
};
use crate::session::{ReconnectTrigger, Session, SessionEvent, SessionState};
use crate::status::StatusCode;
use crate::subscription::{MonitoredItem, PublishEngine, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectState {
    Stable,
    Detecting,
    Reactivating,
    TransferringSubscriptions,
    Republishing,
    RetryWithDelay,
}

#[derive(Debug, Error)]
pub enum ReconnectStateError {
    #[error("invalid reconnection transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: ReconnectState,
        to: ReconnectState,
    },
}

impl From<ReconnectStateError> for UaError {
    fn from(err: ReconnectStateError) -> Self {
        UaError::protocol(StatusCode::BAD_INVALID_STATE, err.to_string())
    }
}

impl ReconnectState {
    pub fn transition(self, next: ReconnectState) -> Result<ReconnectState, ReconnectStateError> {
        use ReconnectState::*;
        let allowed = match (self, next) {
            (Stable, Detecting) => true,
            (Detecting, Reactivating) | (RetryWithDelay, Reactivating) => true,
            (Reactivating, TransferringSubscriptions) => true,
            (TransferringSubscriptions, Republishing) => true,
            (Stable, _) => false,
            (RetryWithDelay, RetryWithDelay) => false,
            (_, RetryWithDelay) | (_, Stable) => true,
            _ => false,
        };
        if allowed {
            Ok(next)
        } else {
            Err(ReconnectStateError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    pub fn is_idle(self) -> bool {
        self == ReconnectState::Stable
    }
}

type Waiter = oneshot::Sender<Result<(), UaError>>;

struct ControllerState {
    state: ReconnectState,
    waiters: Vec<Waiter>,
    attempts: u32,
    task: Option<JoinHandle<()>>,
}

/// Drives one repair at a time for a [`Session`] and its [`PublishEngine`].
///
/// Triggers arriving while a repair is running are folded into it, and everyone waiting
/// on [`reconnect`](Self::reconnect) is resolved once with its outcome. A failed attempt is
/// retried after `retry_delay`; [`close`](Self::close) stops the controller at the next step.
pub struct ReconnectionController {
    session: Arc<Session>,
    engine: Arc<PublishEngine>,
    config: ReconnectConfig,
    inner: Mutex<ControllerState>,
    closed: watch::Sender<bool>,
    listener: Mutex<Option<JoinHandle<()>>>,
    this: Weak<ReconnectionController>,
}

impl std::fmt::Debug for ReconnectionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectionController")
            .field("state", &self.state())
            .field("attempts", &self.attempts())
            .finish()
    }
}

impl ReconnectionController {
    /// Attaches a controller to `session`. Channel breaks and session-invalidating failures
    /// the session observes start a repair from then on.
    pub fn attach(
        session: Arc<Session>,
        engine: Arc<PublishEngine>,
        config: ReconnectConfig,
    ) -> Arc<Self> {
        let (trigger, mut triggers) = mpsc::unbounded_channel::<ReconnectTrigger>();
        let (closed, _) = watch::channel(false);
        let controller = Arc::new_cyclic(|this| Self {
            session: session.clone(),
            engine,
            config,
            inner: Mutex::new(ControllerState {
                state: ReconnectState::Stable,
                waiters: Vec::new(),
                attempts: 0,
                task: None,
            }),
            closed,
            listener: Mutex::new(None),
            this: this.clone(),
        });
        session.set_reconnect_trigger(trigger);
        let weak = Arc::downgrade(&controller);
        let listener = tokio::spawn(async move {
            while let Some(trigger) = triggers.recv().await {
                let Some(controller) = weak.upgrade() else {
                    return;
                };
                // A failure queued by a channel the last repair already replaced.
                if controller.session.is_stale_trigger(&trigger) {
                    debug!(
                        error = %trigger.reason,
                        generation = ?trigger.channel_generation,
                        "stale reconnect trigger dropped"
                    );
                    continue;
                }
                controller.trigger(trigger.reason);
            }
        });
        *controller.listener.lock() = Some(listener);
        controller
    }

    pub fn state(&self) -> ReconnectState {
        self.inner.lock().state
    }

    /// Attempts made by the repair in progress (0 when stable).
    pub fn attempts(&self) -> u32 {
        self.inner.lock().attempts
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Starts a repair (or joins the running one) and waits for its outcome.
    pub async fn reconnect(&self, reason: UaError) -> Result<(), UaError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock();
            if self.is_closed() {
                return Err(UaError::closed("reconnection controller closed"));
            }
            inner.waiters.push(tx);
        }
        self.trigger(reason);
        rx.await
            .unwrap_or_else(|_| Err(UaError::closed("reconnection abandoned")))
    }

    /// Starts a repair unless one is already running.
    pub fn trigger(&self, reason: UaError) {
        if self.is_closed() {
            return;
        }
        let mut inner = self.inner.lock();
        if !inner.state.is_idle() {
            debug!(error = %reason, state = ?inner.state, "reconnect trigger coalesced");
            return;
        }
        inner.state = ReconnectState::Detecting;
        inner.attempts = 0;
        let Some(controller) = self.this.upgrade() else {
            return;
        };
        inner.task = Some(tokio::spawn(async move {
            controller.run(reason).await;
        }));
    }

    /// Stops any repair in progress. Waiters and deferred transactions fail with "closed".
    pub fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
        let (task, waiters) = {
            let mut inner = self.inner.lock();
            inner.state = ReconnectState::Stable;
            (inner.task.take(), std::mem::take(&mut inner.waiters))
        };
        if let Some(task) = task {
            task.abort();
        }
        for waiter in waiters {
            let _ = waiter.send(Err(UaError::closed("reconnection controller closed")));
        }
        // Nobody repairs the session from here on; stop deferring before failing the queue.
        self.session.leave_reconnecting(SessionState::Disconnected);
        self.session
            .fail_deferred(UaError::closed("session closed during reconnection"));
        info!("reconnection controller closed");
    }

    async fn run(self: Arc<Self>, reason: UaError) {
        warn!(error = %reason, "connection break detected");
        if let Err(err) = self.session.transition(SessionState::Reconnecting) {
            self.finish(Err(err));
            return;
        }
        self.engine.suspend();
        self.session.emit(SessionEvent::ConnectionBreak {
            status: reason.status(),
        });

        let mut closed = self.closed.subscribe();
        loop {
            let attempt = {
                let mut inner = self.inner.lock();
                inner.attempts += 1;
                inner.attempts
            };
            info!(attempt, "session repair attempt");
            let err = match self.repair().await {
                Ok(()) => {
                    info!(attempt, "session repaired");
                    self.session.emit(SessionEvent::SessionRepaired);
                    self.finish(Ok(()));
                    return;
                }
                Err(err) => err,
            };
            if self.ensure_usable().is_err() {
                self.finish(Err(UaError::closed("session closed during reconnection")));
                return;
            }
            warn!(attempt, error = %err, "session repair failed");
            self.session.emit(SessionEvent::SessionRepairFailed {
                reason: err.to_string(),
            });
            if self.config.max_attempts != 0 && attempt >= self.config.max_attempts {
                self.give_up(err);
                return;
            }
            if let Err(err) = self.set_state(ReconnectState::RetryWithDelay) {
                self.finish(Err(err));
                return;
            }
            let delay = self.config.retry_delay();
            self.session.emit(SessionEvent::Backoff { attempt, delay });
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = closed.changed() => {
                    self.finish(Err(UaError::closed("session closed during reconnection")));
                    return;
                }
            }
        }
    }

    async fn repair(&self) -> Result<(), UaError> {
        self.set_state(ReconnectState::Reactivating)?;
        if let Some(stale) = self.session.take_channel() {
            stale.close().await;
        }
        self.ensure_usable()?;

        let channel = self.session.connector().connect().await?;
        let prepared: Result<(), UaError> = async {
            self.ensure_usable()?;
            self.reactivate(channel.as_ref()).await?;
            self.ensure_usable()
        }
        .await;
        if let Err(err) = prepared {
            channel.close().await;
            return Err(err);
        }
        self.session.install_channel(channel.clone());

        self.set_state(ReconnectState::TransferringSubscriptions)?;
        let kept = self.transfer(channel.as_ref()).await?;

        self.set_state(ReconnectState::Republishing)?;
        for subscription_id in kept {
            self.republish(channel.as_ref(), subscription_id).await?;
        }

        self.ensure_usable()?;
        if !channel.is_valid() {
            return Err(UaError::transport(
                StatusCode::BAD_NOT_CONNECTED,
                "channel lost during repair",
            ));
        }
        self.engine.resume();
        self.session.drain_deferred().await;
        self.ensure_usable()
    }

    async fn reactivate(&self, channel: &dyn ServiceChannel) -> Result<(), UaError> {
        let err = match self.session.activate_on(channel).await {
            Ok(()) => return Ok(()),
            Err(err) if err.is_channel_fatal() || err.is_closed() => return Err(err),
            Err(err) => err,
        };
        info!(error = %err, "session not reactivated, creating a new one");
        let stale = self.session.identity();
        self.session.create_on(channel).await?;
        self.ensure_usable()?;
        self.session.activate_on(channel).await?;
        if let Some(stale) = stale {
            self.session.close_stale(channel, stale).await;
        }
        Ok(())
    }

    /// Moves every subscription to the repaired session. Returns the ids that survived and
    /// need a republish; the rest were recreated from the cache.
    async fn transfer(&self, channel: &dyn ServiceChannel) -> Result<Vec<u32>, UaError> {
        let subscriptions = self.engine.snapshot();
        if subscriptions.is_empty() {
            return Ok(Vec::new());
        }
        let request = ServiceRequest::from(TransferSubscriptionsRequest {
            request_header: RequestHeader::default(),
            subscription_ids: subscriptions.iter().map(Subscription::id).collect(),
            send_initial_values: true,
        });
        let results = match self.session.perform_on(channel, request).await {
            Ok(response) => expect_response!(response, TransferSubscriptions)?.results,
            Err(UaError::ServiceFault(status)) => {
                info!(%status, "subscription transfer unavailable, recreating all");
                Vec::new()
            }
            Err(err) => return Err(err),
        };
        self.ensure_usable()?;

        let mut kept = Vec::new();
        for (index, subscription) in subscriptions.iter().enumerate() {
            let status = results
                .get(index)
                .map(|result| result.status_code)
                .unwrap_or(StatusCode::BAD_SUBSCRIPTION_ID_INVALID);
            if status.is_good() {
                debug!(subscription_id = subscription.id(), "subscription transferred");
                kept.push(subscription.id());
            } else {
                info!(subscription_id = subscription.id(), %status, "recreating subscription");
                self.recreate(channel, subscription).await?;
                self.ensure_usable()?;
            }
        }
        Ok(kept)
    }

    async fn recreate(
        &self,
        channel: &dyn ServiceChannel,
        subscription: &Subscription,
    ) -> Result<(), UaError> {
        let request = ServiceRequest::from(CreateSubscriptionRequest {
            request_header: RequestHeader::default(),
            parameters: subscription.parameters().clone(),
        });
        let created = expect_response!(
            self.session.perform_on(channel, request).await?,
            CreateSubscription
        )?;
        self.ensure_usable()?;

        let mut items: Vec<MonitoredItem> = subscription.items().cloned().collect();
        if !items.is_empty() {
            let request = ServiceRequest::from(CreateMonitoredItemsRequest {
                request_header: RequestHeader::default(),
                subscription_id: created.subscription_id,
                items_to_create: items.iter().map(MonitoredItem::create_request).collect(),
            });
            let response = expect_response!(
                self.session.perform_on(channel, request).await?,
                CreateMonitoredItems
            )?;
            if response.results.len() != items.len() {
                return Err(UaError::protocol(
                    StatusCode::BAD_UNEXPECTED_ERROR,
                    format!(
                        "{} monitored item results for {} items",
                        response.results.len(),
                        items.len()
                    ),
                ));
            }
            for (item, result) in items.iter_mut().zip(response.results.iter()) {
                item.apply_result(result);
            }
        }
        self.engine.remap(subscription.id(), &created, items);
        Ok(())
    }

    async fn republish(
        &self,
        channel: &dyn ServiceChannel,
        subscription_id: u32,
    ) -> Result<(), UaError> {
        let Some(last) = self.engine.last_sequence_number(subscription_id) else {
            return Ok(());
        };
        let mut next = next_sequence(last);
        let mut recovered = 0u32;
        loop {
            let request = ServiceRequest::from(RepublishRequest {
                request_header: RequestHeader::default(),
                subscription_id,
                retransmit_sequence_number: next,
            });
            match self.session.perform_on(channel, request).await {
                Ok(response) => {
                    let message = expect_response!(response, Republish)?.notification_message;
                    self.engine.deliver(subscription_id, message);
                    recovered += 1;
                    next = next_sequence(next);
                }
                Err(err) if err.is_service_fault(StatusCode::BAD_MESSAGE_NOT_AVAILABLE) => break,
                Err(err) => return Err(err),
            }
            self.ensure_usable()?;
        }
        debug!(subscription_id, recovered, "republish complete");
        Ok(())
    }

    fn give_up(&self, err: UaError) {
        warn!(error = %err, "reconnection attempts exhausted");
        if let Some(channel) = self.session.take_channel() {
            tokio::spawn(async move { channel.close().await });
        }
        self.session.leave_reconnecting(SessionState::Disconnected);
        self.session.fail_deferred(err.clone());
        self.engine.terminate_all(err.status());
        self.finish(Err(err));
    }

    fn ensure_usable(&self) -> Result<(), UaError> {
        if self.is_closed() || self.session.state() == SessionState::Closed {
            return Err(UaError::closed("session closed during reconnection"));
        }
        Ok(())
    }

    fn set_state(&self, next: ReconnectState) -> Result<(), UaError> {
        self.ensure_usable()?;
        let mut inner = self.inner.lock();
        inner.state = inner.state.transition(next)?;
        debug!(state = ?next, "reconnection state");
        Ok(())
    }

    fn finish(&self, result: Result<(), UaError>) {
        let waiters = {
            let mut inner = self.inner.lock();
            inner.state = ReconnectState::Stable;
            inner.attempts = 0;
            inner.task = None;
            std::mem::take(&mut inner.waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
        // A break that raced with the end of the repair was coalesced away.
        if result.is_ok() && !self.session.is_channel_valid() {
            self.trigger(UaError::transport(
                StatusCode::BAD_NOT_CONNECTED,
                "channel lost after repair",
            ));
        }
    }
}

impl Drop for ReconnectionController {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
    }
}

fn next_sequence(last: u32) -> u32 {
    match last.wrapping_add(1) {
        0 => 1,
        next => next,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        use ReconnectState::*;
        let mut state = Stable;
        for next in [
            Detecting,
            Reactivating,
            TransferringSubscriptions,
            Republishing,
            Stable,
        ] {
            state = state.transition(next).unwrap();
        }
        assert!(state.is_idle());
    }

    #[test]
    fn failures_go_through_retry() {
        use ReconnectState::*;
        let state = TransferringSubscriptions.transition(RetryWithDelay).unwrap();
        assert_eq!(state.transition(Reactivating).unwrap(), Reactivating);
        assert!(Stable.transition(RetryWithDelay).is_err());
        assert!(Stable.transition(Reactivating).is_err());
        assert!(RetryWithDelay.transition(Republishing).is_err());
    }

    #[test]
    fn sequence_numbers_skip_zero() {
        assert_eq!(next_sequence(4), 5);
        assert_eq!(next_sequence(u32::MAX), 1);
    }
}
