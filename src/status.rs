use std::fmt;

use serde::{Deserialize, Serialize};

/// Protocol status code. The top two bits carry the severity (`00` good, `01` uncertain,
/// `10` bad); the remaining bits identify the condition.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct StatusCode(pub u32);

macro_rules! status_codes {
    ($($name:ident = $value:literal;)*) => {
        impl StatusCode {
            $(pub const $name: StatusCode = StatusCode($value);)*

            /// Symbolic name of a known code.
            pub fn name(&self) -> Option<&'static str> {
                match self.0 {
                    $($value => Some(stringify!($name)),)*
                    _ => None,
                }
            }
        }
    };
}

status_codes! {
    GOOD = 0x0000_0000;
    BAD_UNEXPECTED_ERROR = 0x8001_0000;
    BAD_INTERNAL_ERROR = 0x8002_0000;
    BAD_COMMUNICATION_ERROR = 0x8005_0000;
    BAD_ENCODING_ERROR = 0x8006_0000;
    BAD_DECODING_ERROR = 0x8007_0000;
    BAD_TIMEOUT = 0x800A_0000;
    BAD_SERVICE_UNSUPPORTED = 0x800B_0000;
    BAD_SHUTDOWN = 0x800C_0000;
    BAD_SERVER_NOT_CONNECTED = 0x800D_0000;
    BAD_NOTHING_TO_DO = 0x800F_0000;
    BAD_CERTIFICATE_INVALID = 0x8012_0000;
    BAD_SECURITY_CHECKS_FAILED = 0x8013_0000;
    BAD_SECURE_CHANNEL_ID_INVALID = 0x8022_0000;
    BAD_NONCE_INVALID = 0x8024_0000;
    BAD_SESSION_ID_INVALID = 0x8025_0000;
    BAD_SESSION_CLOSED = 0x8026_0000;
    BAD_SESSION_NOT_ACTIVATED = 0x8027_0000;
    BAD_SUBSCRIPTION_ID_INVALID = 0x8028_0000;
    BAD_REQUEST_HEADER_INVALID = 0x802A_0000;
    BAD_SECURITY_POLICY_REJECTED = 0x8055_0000;
    BAD_TOO_MANY_PUBLISH_REQUESTS = 0x8078_0000;
    BAD_NO_SUBSCRIPTION = 0x8079_0000;
    BAD_SEQUENCE_NUMBER_UNKNOWN = 0x807A_0000;
    BAD_MESSAGE_NOT_AVAILABLE = 0x807B_0000;
    BAD_TCP_MESSAGE_TYPE_INVALID = 0x807E_0000;
    BAD_TCP_SECURE_CHANNEL_UNKNOWN = 0x807F_0000;
    BAD_TCP_MESSAGE_TOO_LARGE = 0x8080_0000;
    BAD_TCP_NOT_ENOUGH_RESOURCES = 0x8081_0000;
    BAD_TCP_INTERNAL_ERROR = 0x8082_0000;
    BAD_TCP_ENDPOINT_URL_INVALID = 0x8083_0000;
    BAD_REQUEST_INTERRUPTED = 0x8084_0000;
    BAD_REQUEST_TIMEOUT = 0x8085_0000;
    BAD_SECURE_CHANNEL_CLOSED = 0x8086_0000;
    BAD_SECURE_CHANNEL_TOKEN_UNKNOWN = 0x8087_0000;
    BAD_SEQUENCE_NUMBER_INVALID = 0x8088_0000;
    BAD_NOT_CONNECTED = 0x808A_0000;
    BAD_CONNECTION_CLOSED = 0x80AE_0000;
    BAD_INVALID_STATE = 0x80AF_0000;
    BAD_PROTOCOL_VERSION_UNSUPPORTED = 0x80BE_0000;
}

impl StatusCode {
    pub fn is_good(&self) -> bool {
        self.0 & 0xC000_0000 == 0
    }

    pub fn is_uncertain(&self) -> bool {
        self.0 & 0xC000_0000 == 0x4000_0000
    }

    pub fn is_bad(&self) -> bool {
        self.0 & 0x8000_0000 != 0
    }

    /// Codes meaning the session or channel the request travelled on is no longer usable.
    pub fn invalidates_session(&self) -> bool {
        matches!(
            *self,
            StatusCode::BAD_SESSION_ID_INVALID
                | StatusCode::BAD_SESSION_CLOSED
                | StatusCode::BAD_SESSION_NOT_ACTIVATED
                | StatusCode::BAD_SECURE_CHANNEL_ID_INVALID
                | StatusCode::BAD_SECURE_CHANNEL_CLOSED
                | StatusCode::BAD_SECURE_CHANNEL_TOKEN_UNKNOWN
                | StatusCode::BAD_TCP_SECURE_CHANNEL_UNKNOWN
                | StatusCode::BAD_CONNECTION_CLOSED
                | StatusCode::BAD_NOT_CONNECTED
        )
    }
}

impl fmt::Debug for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} (0x{:08X})", name, self.0),
            None => write!(f, "0x{:08X}", self.0),
        }
    }
}

impl From<u32> for StatusCode {
    fn from(value: u32) -> Self {
        StatusCode(value)
    }
}
