//! Service request/response bodies carried inside MSG and OPN chunks.
//!
//! Field-level schemas of application services are opaque to this crate: they travel as
//! [`GenericRequest`]/[`GenericResponse`] with a caller-supplied type id. The services the
//! channel, session and publish machinery need themselves are typed below. Bodies are CBOR.
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::MessageSecurityMode;
use crate::error::UaError;
use crate::status::StatusCode;

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestHeader {
    pub authentication_token: Option<Uuid>,
    pub timestamp_ms: u64,
    /// Correlation field echoed by the server in the response header.
    pub request_handle: u32,
    /// Milliseconds; zero means "use the channel default".
    pub timeout_hint: u32,
}

impl RequestHeader {
    pub fn with_timeout(timeout_hint: u32) -> Self {
        Self {
            timeout_hint,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseHeader {
    pub timestamp_ms: u64,
    pub request_handle: u32,
    pub service_result: StatusCode,
}

impl ResponseHeader {
    pub fn good(request: &RequestHeader) -> Self {
        Self::with_status(request, StatusCode::GOOD)
    }

    pub fn with_status(request: &RequestHeader, service_result: StatusCode) -> Self {
        Self {
            timestamp_ms: now_ms(),
            request_handle: request.request_handle,
            service_result,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityTokenRequestType {
    Issue,
    Renew,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenSecureChannelRequest {
    pub request_header: RequestHeader,
    pub client_protocol_version: u32,
    pub request_type: SecurityTokenRequestType,
    pub security_mode: MessageSecurityMode,
    pub client_nonce: Vec<u8>,
    pub requested_lifetime: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSecurityToken {
    pub channel_id: u32,
    pub token_id: u32,
    pub created_at_ms: u64,
    pub revised_lifetime: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenSecureChannelResponse {
    pub response_header: ResponseHeader,
    pub server_protocol_version: u32,
    pub security_token: ChannelSecurityToken,
    pub server_nonce: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseSecureChannelRequest {
    pub request_header: RequestHeader,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub request_header: RequestHeader,
    pub client_application_uri: String,
    pub endpoint_url: String,
    pub session_name: String,
    pub client_nonce: Vec<u8>,
    pub requested_session_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub response_header: ResponseHeader,
    pub session_id: Uuid,
    pub authentication_token: Uuid,
    pub revised_session_timeout_ms: u64,
    pub server_nonce: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UserIdentity {
    Anonymous,
    UserName { user: String, password: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivateSessionRequest {
    pub request_header: RequestHeader,
    pub user_identity: UserIdentity,
    pub locale_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivateSessionResponse {
    pub response_header: ResponseHeader,
    pub server_nonce: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseSessionRequest {
    pub request_header: RequestHeader,
    pub delete_subscriptions: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseSessionResponse {
    pub response_header: ResponseHeader,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionParameters {
    pub publishing_interval_ms: f64,
    pub lifetime_count: u32,
    pub max_keep_alive_count: u32,
    pub max_notifications_per_publish: u32,
    pub publishing_enabled: bool,
    pub priority: u8,
}

impl Default for SubscriptionParameters {
    fn default() -> Self {
        Self {
            publishing_interval_ms: 1_000.0,
            lifetime_count: 60,
            max_keep_alive_count: 10,
            max_notifications_per_publish: 0,
            publishing_enabled: true,
            priority: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateSubscriptionRequest {
    pub request_header: RequestHeader,
    pub parameters: SubscriptionParameters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateSubscriptionResponse {
    pub response_header: ResponseHeader,
    pub subscription_id: u32,
    pub revised_publishing_interval_ms: f64,
    pub revised_lifetime_count: u32,
    pub revised_max_keep_alive_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteSubscriptionsRequest {
    pub request_header: RequestHeader,
    pub subscription_ids: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteSubscriptionsResponse {
    pub response_header: ResponseHeader,
    pub results: Vec<StatusCode>,
}

/// What a monitored item samples: a node and one of its attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadValueId {
    pub node_id: String,
    pub attribute_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitoringMode {
    Disabled,
    Sampling,
    Reporting,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringParameters {
    pub client_handle: u32,
    pub sampling_interval_ms: f64,
    pub queue_size: u32,
    pub discard_oldest: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredItemCreateRequest {
    pub item_to_monitor: ReadValueId,
    pub monitoring_mode: MonitoringMode,
    pub requested_parameters: MonitoringParameters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredItemCreateResult {
    pub status_code: StatusCode,
    pub monitored_item_id: u32,
    pub revised_sampling_interval_ms: f64,
    pub revised_queue_size: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateMonitoredItemsRequest {
    pub request_header: RequestHeader,
    pub subscription_id: u32,
    pub items_to_create: Vec<MonitoredItemCreateRequest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateMonitoredItemsResponse {
    pub response_header: ResponseHeader,
    pub results: Vec<MonitoredItemCreateResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferSubscriptionsRequest {
    pub request_header: RequestHeader,
    pub subscription_ids: Vec<u32>,
    pub send_initial_values: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferResult {
    pub status_code: StatusCode,
    pub available_sequence_numbers: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferSubscriptionsResponse {
    pub response_header: ResponseHeader,
    pub results: Vec<TransferResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionAcknowledgement {
    pub subscription_id: u32,
    pub sequence_number: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishRequest {
    pub request_header: RequestHeader,
    pub subscription_acknowledgements: Vec<SubscriptionAcknowledgement>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataChangeItem {
    pub client_handle: u32,
    pub value: Vec<u8>,
    pub status: StatusCode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NotificationData {
    DataChange(Vec<DataChangeItem>),
    Event { client_handle: u32, fields: Vec<Vec<u8>> },
    StatusChange(StatusCode),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub sequence_number: u32,
    pub publish_time_ms: u64,
    pub notification_data: Vec<NotificationData>,
}

impl NotificationMessage {
    /// A keep-alive carries no data; its sequence number is the next one to be used.
    pub fn is_keep_alive(&self) -> bool {
        self.notification_data.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishResponse {
    pub response_header: ResponseHeader,
    pub subscription_id: u32,
    pub available_sequence_numbers: Vec<u32>,
    pub more_notifications: bool,
    pub notification_message: NotificationMessage,
    pub results: Vec<StatusCode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepublishRequest {
    pub request_header: RequestHeader,
    pub subscription_id: u32,
    pub retransmit_sequence_number: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepublishResponse {
    pub response_header: ResponseHeader,
    pub notification_message: NotificationMessage,
}

/// Application service with a caller-encoded body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenericRequest {
    pub request_header: RequestHeader,
    pub type_id: u32,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenericResponse {
    pub response_header: ResponseHeader,
    pub type_id: u32,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceFault {
    pub response_header: ResponseHeader,
}

macro_rules! service_enum {
    ($enum_name:ident, $header:ident, $header_ty:ty, { $($variant:ident($inner:ty),)* }) => {
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        pub enum $enum_name {
            $($variant($inner),)*
        }

        impl $enum_name {
            pub fn $header(&self) -> &$header_ty {
                match self {
                    $($enum_name::$variant(m) => &m.$header,)*
                }
            }

            pub fn type_name(&self) -> &'static str {
                match self {
                    $($enum_name::$variant(_) => stringify!($variant),)*
                }
            }
        }

        $(
            impl From<$inner> for $enum_name {
                fn from(message: $inner) -> Self {
                    $enum_name::$variant(message)
                }
            }
        )*
    };
}

service_enum!(ServiceRequest, request_header, RequestHeader, {
    OpenSecureChannel(OpenSecureChannelRequest),
    CloseSecureChannel(CloseSecureChannelRequest),
    CreateSession(CreateSessionRequest),
    ActivateSession(ActivateSessionRequest),
    CloseSession(CloseSessionRequest),
    CreateSubscription(CreateSubscriptionRequest),
    DeleteSubscriptions(DeleteSubscriptionsRequest),
    CreateMonitoredItems(CreateMonitoredItemsRequest),
    TransferSubscriptions(TransferSubscriptionsRequest),
    Publish(PublishRequest),
    Republish(RepublishRequest),
    Generic(GenericRequest),
});

service_enum!(ServiceResponse, response_header, ResponseHeader, {
    OpenSecureChannel(OpenSecureChannelResponse),
    CreateSession(CreateSessionResponse),
    ActivateSession(ActivateSessionResponse),
    CloseSession(CloseSessionResponse),
    CreateSubscription(CreateSubscriptionResponse),
    DeleteSubscriptions(DeleteSubscriptionsResponse),
    CreateMonitoredItems(CreateMonitoredItemsResponse),
    TransferSubscriptions(TransferSubscriptionsResponse),
    Publish(PublishResponse),
    Republish(RepublishResponse),
    Generic(GenericResponse),
    Fault(ServiceFault),
});

impl ServiceRequest {
    pub fn request_header_mut(&mut self) -> &mut RequestHeader {
        match self {
            ServiceRequest::OpenSecureChannel(m) => &mut m.request_header,
            ServiceRequest::CloseSecureChannel(m) => &mut m.request_header,
            ServiceRequest::CreateSession(m) => &mut m.request_header,
            ServiceRequest::ActivateSession(m) => &mut m.request_header,
            ServiceRequest::CloseSession(m) => &mut m.request_header,
            ServiceRequest::CreateSubscription(m) => &mut m.request_header,
            ServiceRequest::DeleteSubscriptions(m) => &mut m.request_header,
            ServiceRequest::CreateMonitoredItems(m) => &mut m.request_header,
            ServiceRequest::TransferSubscriptions(m) => &mut m.request_header,
            ServiceRequest::Publish(m) => &mut m.request_header,
            ServiceRequest::Republish(m) => &mut m.request_header,
            ServiceRequest::Generic(m) => &mut m.request_header,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, UaError> {
        serde_cbor::to_vec(self).map_err(|e| {
            UaError::protocol(StatusCode::BAD_ENCODING_ERROR, format!("request: {}", e))
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, UaError> {
        Ok(serde_cbor::from_slice(bytes)?)
    }
}

impl ServiceResponse {
    pub fn encode(&self) -> Result<Vec<u8>, UaError> {
        serde_cbor::to_vec(self).map_err(|e| {
            UaError::protocol(StatusCode::BAD_ENCODING_ERROR, format!("response: {}", e))
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, UaError> {
        Ok(serde_cbor::from_slice(bytes)?)
    }

    pub fn fault(request: &RequestHeader, status: StatusCode) -> Self {
        ServiceResponse::Fault(ServiceFault {
            response_header: ResponseHeader::with_status(request, status),
        })
    }

    /// Turns a fault or a bad service result into [`UaError::ServiceFault`].
    pub fn into_result(self) -> Result<Self, UaError> {
        let status = self.response_header().service_result;
        if status.is_bad() {
            return Err(UaError::ServiceFault(status));
        }
        Ok(self)
    }
}

/// Extracts the expected typed response or reports which one arrived instead.
macro_rules! expect_response {
    ($response:expr, $variant:ident) => {
        match $response {
            $crate::messages::ServiceResponse::$variant(inner) => Ok(inner),
            other => Err($crate::error::UaError::protocol(
                $crate::status::StatusCode::BAD_UNEXPECTED_ERROR,
                format!(
                    "expected {} response, got {}",
                    stringify!($variant),
                    other.type_name()
                ),
            )),
        }
    };
}
pub(crate) use expect_response;
