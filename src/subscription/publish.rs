use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{MonitoredItem, Subscription, SubscriptionEvent};
use crate::config::PublishConfig;
use crate::error::UaError;
use crate::messages::{
    CreateSubscriptionResponse, NotificationMessage, PublishRequest, PublishResponse,
    RequestHeader, SubscriptionAcknowledgement,
};
use crate::status::StatusCode;

/// Where publish requests go. Implemented by the session; tests script it directly.
#[async_trait]
pub trait PublishTransport: Send + Sync {
    async fn publish(&self, request: PublishRequest) -> Result<PublishResponse, UaError>;

    fn is_channel_valid(&self) -> bool;
}

struct InFlight {
    subscription_id: u32,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct EngineState {
    subscriptions: BTreeMap<u32, Subscription>,
    total_outstanding: u32,
    lowered_ceiling: Option<u32>,
    pending_acks: VecDeque<SubscriptionAcknowledgement>,
    suspended: bool,
    shut_down: bool,
    next_ticket: u64,
    in_flight: HashMap<u64, InFlight>,
    poller: Option<JoinHandle<()>>,
}

/// Keeps publish requests outstanding for every registered subscription and routes the
/// notifications they return.
///
/// * Each subscription holds at most `pipeline_depth` requests; the engine as a whole holds
///   at most `min(pipeline_depth x subscriptions, max_publish_requests)`, lowered when the
///   server reports too many publish requests.
/// * Every subscription keeps at least one request outstanding. A subscription registered
///   while the ceiling is already reached gets its first request anyway; the surplus
///   drains because requests are only replaced while the total is under the ceiling, and
///   free slots go to the subscription with the fewest outstanding.
/// * The timeout hint of a request is the subscription's publish timeout multiplied by the
///   number of requests outstanding for it, so queued requests do not expire in order.
/// * A notification is handed to the owner before its acknowledgement is queued; the next
///   request carries it.
/// * Nothing is dispatched while suspended or while the channel is invalid. A starved
///   engine polls channel validity and refills on its own.
pub struct PublishEngine {
    transport: Arc<dyn PublishTransport>,
    config: PublishConfig,
    state: Mutex<EngineState>,
    this: Weak<PublishEngine>,
}

impl std::fmt::Debug for PublishEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PublishEngine")
            .field("subscriptions", &state.subscriptions.len())
            .field("outstanding", &state.total_outstanding)
            .field("suspended", &state.suspended)
            .finish()
    }
}

impl PublishEngine {
    pub fn new(transport: Arc<dyn PublishTransport>, config: PublishConfig) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            transport,
            config,
            state: Mutex::new(EngineState::default()),
            this: this.clone(),
        })
    }

    pub fn register(&self, subscription: Subscription) {
        let mut state = self.state.lock();
        info!(subscription_id = subscription.id(), "subscription registered");
        state.subscriptions.insert(subscription.id(), subscription);
        self.top_up(&mut state);
    }

    /// Stops publishing for `subscription_id`. Requests already in flight are allowed to
    /// complete but are not replaced on its behalf.
    pub fn unregister(&self, subscription_id: u32) -> Option<Subscription> {
        let mut state = self.state.lock();
        let removed = state.subscriptions.remove(&subscription_id);
        state
            .pending_acks
            .retain(|ack| ack.subscription_id != subscription_id);
        if removed.is_some() {
            info!(subscription_id, "subscription unregistered");
        }
        removed
    }

    pub fn add_items(&self, subscription_id: u32, items: Vec<MonitoredItem>) -> bool {
        let mut state = self.state.lock();
        match state.subscriptions.get_mut(&subscription_id) {
            Some(sub) => {
                sub.insert_items(items);
                true
            }
            None => false,
        }
    }

    pub fn remove_item(&self, subscription_id: u32, client_handle: u32) -> Option<MonitoredItem> {
        let mut state = self.state.lock();
        state
            .subscriptions
            .get_mut(&subscription_id)
            .and_then(|sub| sub.remove_item(client_handle))
    }

    pub fn subscription_ids(&self) -> Vec<u32> {
        self.state.lock().subscriptions.keys().copied().collect()
    }

    /// Copies of every registered subscription, in id order.
    pub fn snapshot(&self) -> Vec<Subscription> {
        self.state.lock().subscriptions.values().cloned().collect()
    }

    pub fn last_sequence_number(&self, subscription_id: u32) -> Option<u32> {
        self.state
            .lock()
            .subscriptions
            .get(&subscription_id)
            .map(|sub| sub.last_sequence_number())
    }

    pub fn outstanding(&self) -> u32 {
        self.state.lock().total_outstanding
    }

    pub fn outstanding_for(&self, subscription_id: u32) -> u32 {
        self.state
            .lock()
            .subscriptions
            .get(&subscription_id)
            .map(|sub| sub.outstanding)
            .unwrap_or(0)
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling_locked(&self.state.lock())
    }

    pub fn is_suspended(&self) -> bool {
        self.state.lock().suspended
    }

    pub fn suspend(&self) {
        let mut state = self.state.lock();
        if !state.suspended {
            debug!(outstanding = state.total_outstanding, "publish engine suspended");
        }
        state.suspended = true;
    }

    pub fn resume(&self) {
        let mut state = self.state.lock();
        state.suspended = false;
        debug!("publish engine resumed");
        self.top_up(&mut state);
    }

    /// Routes a message obtained outside the publish loop (republish) through the normal
    /// notification path.
    pub fn deliver(&self, subscription_id: u32, message: NotificationMessage) -> bool {
        let mut state = self.state.lock();
        Self::deliver_locked(&mut state, subscription_id, message)
    }

    /// Moves the subscription registered as `old_id` to the server's recreated subscription
    /// while keeping its owner and cached items.
    pub fn remap(
        &self,
        old_id: u32,
        response: &CreateSubscriptionResponse,
        items: Vec<MonitoredItem>,
    ) -> bool {
        let mut state = self.state.lock();
        let Some(mut sub) = state.subscriptions.remove(&old_id) else {
            return false;
        };
        let new_id = response.subscription_id;
        sub.adopt(response);
        sub.insert_items(items);
        sub.notify(SubscriptionEvent::Remapped { old_id, new_id });
        state.subscriptions.insert(new_id, sub);
        for entry in state.in_flight.values_mut() {
            if entry.subscription_id == old_id {
                entry.subscription_id = new_id;
            }
        }
        state.pending_acks.retain(|ack| ack.subscription_id != old_id);
        info!(old_id, new_id, "subscription remapped");
        true
    }

    /// Tells every owner its subscription is gone and forgets all subscriptions.
    pub fn terminate_all(&self, cause: StatusCode) {
        let mut state = self.state.lock();
        let subscriptions = std::mem::take(&mut state.subscriptions);
        state.pending_acks.clear();
        for (subscription_id, sub) in subscriptions {
            warn!(subscription_id, %cause, "subscription terminated");
            sub.notify(SubscriptionEvent::Terminated {
                subscription_id,
                cause,
            });
        }
    }

    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shut_down = true;
        for (_, entry) in state.in_flight.drain() {
            entry.handle.abort();
        }
        if let Some(poller) = state.poller.take() {
            poller.abort();
        }
        state.total_outstanding = 0;
        for sub in state.subscriptions.values_mut() {
            sub.outstanding = 0;
        }
    }

    fn ceiling_locked(&self, state: &EngineState) -> u32 {
        let active = state.subscriptions.len() as u32;
        let natural = self
            .config
            .pipeline_depth
            .saturating_mul(active)
            .min(self.config.max_publish_requests);
        match state.lowered_ceiling {
            Some(lowered) => natural.min(lowered),
            None => natural,
        }
    }

    fn top_up(&self, state: &mut EngineState) {
        if state.suspended || state.shut_down || state.subscriptions.is_empty() {
            return;
        }
        if !self.transport.is_channel_valid() {
            self.start_poller(state);
            return;
        }
        let ceiling = self.ceiling_locked(state);
        let depth = self.config.pipeline_depth;

        let starved: Vec<u32> = state
            .subscriptions
            .iter()
            .filter(|(_, sub)| sub.outstanding == 0)
            .map(|(id, _)| *id)
            .collect();
        for id in starved {
            self.issue(state, id, depth);
        }

        while state.total_outstanding < ceiling {
            let next = state
                .subscriptions
                .iter()
                .filter(|(_, sub)| sub.outstanding < depth)
                .min_by_key(|(id, sub)| (sub.outstanding, **id))
                .map(|(id, _)| *id);
            match next {
                Some(id) => self.issue(state, id, depth),
                None => return,
            }
        }
    }

    fn issue(&self, state: &mut EngineState, subscription_id: u32, depth: u32) {
        let Some(sub) = state.subscriptions.get_mut(&subscription_id) else {
            return;
        };
        sub.outstanding += 1;
        let multiplier = sub.outstanding.min(depth);
        let timeout = sub.publish_timeout() * multiplier;
        state.total_outstanding += 1;
        self.dispatch(state, subscription_id, timeout);
    }

    fn dispatch(&self, state: &mut EngineState, subscription_id: u32, timeout: Duration) {
        let acks: Vec<SubscriptionAcknowledgement> = state.pending_acks.drain(..).collect();
        let timeout_hint = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        let request = PublishRequest {
            request_header: RequestHeader::with_timeout(timeout_hint),
            subscription_acknowledgements: acks.clone(),
        };
        debug!(
            subscription_id,
            timeout_hint,
            acks = acks.len(),
            "publish request dispatched"
        );

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        let transport = self.transport.clone();
        let engine = self.this.clone();
        let handle = tokio::spawn(async move {
            let result = transport.publish(request).await;
            if let Some(engine) = engine.upgrade() {
                engine.complete(ticket, acks, result);
            }
        });
        state.in_flight.insert(
            ticket,
            InFlight {
                subscription_id,
                handle,
            },
        );
    }

    fn complete(
        &self,
        ticket: u64,
        acks: Vec<SubscriptionAcknowledgement>,
        result: Result<PublishResponse, UaError>,
    ) {
        let mut state = self.state.lock();
        let Some(entry) = state.in_flight.remove(&ticket) else {
            return;
        };
        state.total_outstanding = state.total_outstanding.saturating_sub(1);
        if let Some(sub) = state.subscriptions.get_mut(&entry.subscription_id) {
            sub.outstanding = sub.outstanding.saturating_sub(1);
        }

        let replace = match result {
            Ok(response) => {
                for (ack, status) in acks.iter().zip(response.results.iter()) {
                    if status.is_bad() {
                        debug!(
                            subscription_id = ack.subscription_id,
                            sequence_number = ack.sequence_number,
                            %status,
                            "acknowledgement rejected"
                        );
                    }
                }
                Self::deliver_locked(
                    &mut state,
                    response.subscription_id,
                    response.notification_message,
                );
                true
            }
            Err(err) if err.is_service_fault(StatusCode::BAD_TOO_MANY_PUBLISH_REQUESTS) => {
                let lowered = state.total_outstanding.max(1);
                warn!(ceiling = lowered, "server limits outstanding publish requests");
                state.lowered_ceiling = Some(lowered);
                requeue(&mut state, acks);
                false
            }
            Err(err) if err.is_service_fault(StatusCode::BAD_NO_SUBSCRIPTION) => {
                debug!("server has no subscription to publish for");
                requeue(&mut state, acks);
                false
            }
            Err(err) if err.needs_reconnect() || err.is_closed() => {
                // Refilled once the engine is resumed on a working channel.
                debug!(error = %err, "publish request lost with its channel");
                requeue(&mut state, acks);
                true
            }
            Err(err) => {
                warn!(error = %err, "publish request failed");
                requeue(&mut state, acks);
                true
            }
        };
        if replace {
            self.top_up(&mut state);
        }
    }

    fn deliver_locked(
        state: &mut EngineState,
        subscription_id: u32,
        message: NotificationMessage,
    ) -> bool {
        let Some(sub) = state.subscriptions.get_mut(&subscription_id) else {
            debug!(subscription_id, "notification for unknown subscription");
            return false;
        };
        if let Some(sequence_number) = sub.deliver(message) {
            state.pending_acks.push_back(SubscriptionAcknowledgement {
                subscription_id,
                sequence_number,
            });
        }
        true
    }

    fn start_poller(&self, state: &mut EngineState) {
        if state.poller.is_some() {
            return;
        }
        debug!("channel invalid, publish engine waiting");
        let interval = Duration::from_millis(self.config.channel_poll_interval_ms.max(1));
        let engine = self.this.clone();
        state.poller = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(engine) = engine.upgrade() else {
                    return;
                };
                let mut state = engine.state.lock();
                if state.suspended || state.shut_down || state.subscriptions.is_empty() {
                    state.poller = None;
                    return;
                }
                if engine.transport.is_channel_valid() {
                    state.poller = None;
                    engine.top_up(&mut state);
                    return;
                }
            }
        }));
    }
}

fn requeue(state: &mut EngineState, acks: Vec<SubscriptionAcknowledgement>) {
    for ack in acks.into_iter().rev() {
        if state.subscriptions.contains_key(&ack.subscription_id) {
            state.pending_acks.push_front(ack);
        }
    }
}
