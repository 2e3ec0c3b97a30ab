//! Client-side subscription cache and the publish engine that feeds it.
use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::messages::{
    CreateSubscriptionResponse, MonitoredItemCreateRequest, MonitoredItemCreateResult,
    MonitoringMode, MonitoringParameters, NotificationMessage, ReadValueId,
    SubscriptionParameters,
};
use crate::status::StatusCode;

pub mod publish;

pub use publish::{PublishEngine, PublishTransport};

/// What a subscription owner receives.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    Notification {
        subscription_id: u32,
        message: NotificationMessage,
    },
    KeepAlive {
        subscription_id: u32,
        sequence_number: u32,
    },
    /// The subscription was recreated on the server under a new id.
    Remapped { old_id: u32, new_id: u32 },
    Terminated {
        subscription_id: u32,
        cause: StatusCode,
    },
}

/// Cached monitored item, replayed when a subscription has to be recreated.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredItem {
    pub item_to_monitor: ReadValueId,
    pub monitoring_mode: MonitoringMode,
    pub requested: MonitoringParameters,
    pub server_item_id: u32,
    pub revised_sampling_interval_ms: f64,
    pub revised_queue_size: u32,
    pub status: StatusCode,
}

impl MonitoredItem {
    pub fn new(
        item_to_monitor: ReadValueId,
        monitoring_mode: MonitoringMode,
        requested: MonitoringParameters,
    ) -> Self {
        Self {
            item_to_monitor,
            monitoring_mode,
            revised_sampling_interval_ms: requested.sampling_interval_ms,
            revised_queue_size: requested.queue_size,
            requested,
            server_item_id: 0,
            status: StatusCode::GOOD,
        }
    }

    pub fn client_handle(&self) -> u32 {
        self.requested.client_handle
    }

    pub fn create_request(&self) -> MonitoredItemCreateRequest {
        MonitoredItemCreateRequest {
            item_to_monitor: self.item_to_monitor.clone(),
            monitoring_mode: self.monitoring_mode,
            requested_parameters: self.requested.clone(),
        }
    }

    pub fn apply_result(&mut self, result: &MonitoredItemCreateResult) {
        self.status = result.status_code;
        if result.status_code.is_good() {
            self.server_item_id = result.monitored_item_id;
            self.revised_sampling_interval_ms = result.revised_sampling_interval_ms;
            self.revised_queue_size = result.revised_queue_size;
        }
    }
}

/// A server subscription as the client tracks it.
#[derive(Debug, Clone)]
pub struct Subscription {
    id: u32,
    parameters: SubscriptionParameters,
    revised_publishing_interval_ms: f64,
    revised_lifetime_count: u32,
    revised_max_keep_alive_count: u32,
    last_sequence_number: u32,
    items: BTreeMap<u32, MonitoredItem>,
    handler: mpsc::UnboundedSender<SubscriptionEvent>,
    pub(crate) outstanding: u32,
}

impl Subscription {
    pub fn from_response(
        parameters: SubscriptionParameters,
        response: &CreateSubscriptionResponse,
        handler: mpsc::UnboundedSender<SubscriptionEvent>,
    ) -> Self {
        Self {
            id: response.subscription_id,
            parameters,
            revised_publishing_interval_ms: response.revised_publishing_interval_ms,
            revised_lifetime_count: response.revised_lifetime_count,
            revised_max_keep_alive_count: response.revised_max_keep_alive_count,
            last_sequence_number: 0,
            items: BTreeMap::new(),
            handler,
            outstanding: 0,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn parameters(&self) -> &SubscriptionParameters {
        &self.parameters
    }

    pub fn revised_publishing_interval(&self) -> Duration {
        Duration::from_secs_f64(self.revised_publishing_interval_ms.max(0.0) / 1000.0)
    }

    pub fn revised_lifetime_count(&self) -> u32 {
        self.revised_lifetime_count
    }

    pub fn revised_max_keep_alive_count(&self) -> u32 {
        self.revised_max_keep_alive_count
    }

    /// Last data notification handed to the owner (0 before the first one).
    pub fn last_sequence_number(&self) -> u32 {
        self.last_sequence_number
    }

    pub fn items(&self) -> impl Iterator<Item = &MonitoredItem> {
        self.items.values()
    }

    pub fn item(&self, client_handle: u32) -> Option<&MonitoredItem> {
        self.items.get(&client_handle)
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    /// Base timeout for one publish request: the longest the server may stay silent
    /// before it owes a keep-alive.
    pub fn publish_timeout(&self) -> Duration {
        let keep_alive = f64::from(self.revised_max_keep_alive_count.max(1));
        Duration::from_secs_f64(self.revised_publishing_interval_ms.max(0.0) * keep_alive / 1000.0)
    }

    pub(crate) fn insert_items(&mut self, items: impl IntoIterator<Item = MonitoredItem>) {
        for item in items {
            self.items.insert(item.client_handle(), item);
        }
    }

    pub(crate) fn remove_item(&mut self, client_handle: u32) -> Option<MonitoredItem> {
        self.items.remove(&client_handle)
    }

    /// Adopts the identity of a recreated server subscription.
    pub(crate) fn adopt(&mut self, response: &CreateSubscriptionResponse) {
        self.id = response.subscription_id;
        self.revised_publishing_interval_ms = response.revised_publishing_interval_ms;
        self.revised_lifetime_count = response.revised_lifetime_count;
        self.revised_max_keep_alive_count = response.revised_max_keep_alive_count;
        self.last_sequence_number = 0;
    }

    /// Routes one message to the owner. Returns the sequence number to acknowledge, if any.
    pub(crate) fn deliver(&mut self, message: NotificationMessage) -> Option<u32> {
        if message.is_keep_alive() {
            self.notify(SubscriptionEvent::KeepAlive {
                subscription_id: self.id,
                sequence_number: message.sequence_number,
            });
            return None;
        }
        let sequence_number = message.sequence_number;
        if self.last_sequence_number != 0 && !is_newer(sequence_number, self.last_sequence_number)
        {
            tracing::debug!(
                subscription_id = self.id,
                sequence_number,
                last = self.last_sequence_number,
                "duplicate notification dropped"
            );
            return None;
        }
        self.last_sequence_number = sequence_number;
        self.notify(SubscriptionEvent::Notification {
            subscription_id: self.id,
            message,
        });
        Some(sequence_number)
    }

    pub(crate) fn notify(&self, event: SubscriptionEvent) {
        // A dropped receiver only means the owner stopped listening.
        let _ = self.handler.send(event);
    }
}

/// Serial-number comparison for notification sequence numbers, which wrap past u32::MAX.
pub(crate) fn is_newer(candidate: u32, last: u32) -> bool {
    let delta = candidate.wrapping_sub(last);
    delta != 0 && delta < u32::MAX / 2
}
