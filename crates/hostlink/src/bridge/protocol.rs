//! Wire protocol types for host-worker communication.
//!
//! Every frame carries a request kind which selects the content schema for both
//! directions. The catalogue below is the single source of truth: it generates
//! [`RequestKind`], [`RequestBody`] and [`ResponseBody`] so that dispatch over the
//! kinds is an exhaustive `match` checked at compile time.

use serde::{Deserialize, Serialize};

use crate::resource::Token;

/// Correlates a response with the request it answers. Unique per session and direction.
pub type RequestId = u32;

/// Identifies one logical byte stream multiplexed over a session.
pub type StreamId = u32;

/// Whether a frame is a request or a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Request = 0,
    Response = 1,
}

impl MessageKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Request),
            1 => Some(Self::Response),
            _ => None,
        }
    }
}

/// Result code carried on every response frame. Requests always carry `Ok`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum ResultCode {
    Ok = 0,
    ClientError = 1,
    Cancelled = 2,
    ConnectionReset = 3,
    Timeout = 4,
    NotImplemented = 5,
    InternalError = 6,
}

impl ResultCode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::Ok),
            1 => Some(Self::ClientError),
            2 => Some(Self::Cancelled),
            3 => Some(Self::ConnectionReset),
            4 => Some(Self::Timeout),
            5 => Some(Self::NotImplemented),
            6 => Some(Self::InternalError),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::ClientError => "CLIENT_ERROR",
            Self::Cancelled => "CANCELLED",
            Self::ConnectionReset => "CONNECTION_RESET",
            Self::Timeout => "TIMEOUT",
            Self::NotImplemented => "NOT_IMPLEMENTED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

macro_rules! request_kinds {
    ($( $(#[$doc:meta])* $variant:ident = $code:literal => $req:ty, $resp:ty; )*) => {
        /// Selects the content schema and dispatch target of a frame.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u16)]
        pub enum RequestKind {
            $( $(#[$doc])* $variant = $code, )*
        }

        impl RequestKind {
            pub const ALL: &'static [RequestKind] = &[$( RequestKind::$variant, )*];

            pub fn from_u16(value: u16) -> Option<Self> {
                match value {
                    $( $code => Some(Self::$variant), )*
                    _ => None,
                }
            }

            pub fn as_str(&self) -> &'static str {
                match self {
                    $( Self::$variant => stringify!($variant), )*
                }
            }
        }

        /// Content of a request frame.
        #[derive(Debug, Clone, PartialEq)]
        pub enum RequestBody {
            $( $variant($req), )*
        }

        impl RequestBody {
            pub fn kind(&self) -> RequestKind {
                match self {
                    $( Self::$variant(_) => RequestKind::$variant, )*
                }
            }

            pub(crate) fn encode(&self) -> Result<Vec<u8>, postcard::Error> {
                match self {
                    $( Self::$variant(body) => postcard::to_allocvec(body), )*
                }
            }

            pub(crate) fn decode(kind: RequestKind, content: &[u8]) -> Result<Self, postcard::Error> {
                match kind {
                    $( RequestKind::$variant => postcard::from_bytes(content).map(Self::$variant), )*
                }
            }
        }

        /// Content of a successful (`Ok`) response frame.
        #[derive(Debug, Clone, PartialEq)]
        pub enum ResponseBody {
            $( $variant($resp), )*
        }

        impl ResponseBody {
            pub fn kind(&self) -> RequestKind {
                match self {
                    $( Self::$variant(_) => RequestKind::$variant, )*
                }
            }

            pub(crate) fn encode(&self) -> Result<Vec<u8>, postcard::Error> {
                match self {
                    $( Self::$variant(body) => postcard::to_allocvec(body), )*
                }
            }

            pub(crate) fn decode(kind: RequestKind, content: &[u8]) -> Result<Self, postcard::Error> {
                match kind {
                    $( RequestKind::$variant => postcard::from_bytes(content).map(Self::$variant), )*
                }
            }
        }
    };
}

request_kinds! {
    /// Worker to host. Must be the first call on a session.
    Credentials = 1 => CredentialsRequest, Empty;
    /// Host to worker invocation.
    Trigger = 2 => TriggerRequest, TriggerResponse;
    /// Worker to host: allocate an inbound stream on the host.
    StreamOpen = 3 => Empty, StreamOpenResponse;
    /// Either direction: one chunk of a byte stream.
    StreamPush = 4 => StreamPushRequest, Empty;
    CollectMetrics = 5 => Empty, CollectMetricsResponse;
    /// Host to worker: a queued resource token was granted.
    ResourceNotification = 6 => ResourceNotificationRequest, Empty;
    ResourcePut = 7 => ResourcePutRequest, ResourcePutResponse;
    Fetch = 8 => FetchRequest, FetchResponse;
    FetchAbort = 9 => FetchAbortRequest, Empty;
    RemoteInvoke = 10 => RemoteInvokeRequest, AdaptorResponse;
    RemoteBinding = 11 => BindingRequest, AdaptorResponse;
    SideChannel = 12 => BindingRequest, AdaptorResponse;
    InspectorStart = 13 => Empty, Empty;
    InspectorStartSession = 14 => Empty, Empty;
    InspectorCommand = 15 => InspectorCommandRequest, InspectorCommandResponse;
    TracingStart = 16 => TracingStartRequest, Empty;
    TracingStop = 17 => Empty, Empty;
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content of kinds that carry no fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty;

/// Payload of every non-`Ok` response, replacing the kind's normal schema.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    pub stack: Option<String>,
}

/// Decoded frame content.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Request(RequestBody),
    Response(ResponseBody),
    Error {
        kind: RequestKind,
        code: ResultCode,
        error: ErrorPayload,
    },
}

/// One framed protocol message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub request_id: RequestId,
    pub payload: Payload,
}

impl Message {
    pub fn request(request_id: RequestId, body: RequestBody) -> Self {
        Self {
            request_id,
            payload: Payload::Request(body),
        }
    }

    pub fn response(request_id: RequestId, body: ResponseBody) -> Self {
        Self {
            request_id,
            payload: Payload::Response(body),
        }
    }

    pub fn error(
        request_id: RequestId,
        kind: RequestKind,
        code: ResultCode,
        error: ErrorPayload,
    ) -> Self {
        Self {
            request_id,
            payload: Payload::Error { kind, code, error },
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self.payload {
            Payload::Request(_) => MessageKind::Request,
            Payload::Response(_) | Payload::Error { .. } => MessageKind::Response,
        }
    }

    pub fn request_kind(&self) -> RequestKind {
        match &self.payload {
            Payload::Request(body) => body.kind(),
            Payload::Response(body) => body.kind(),
            Payload::Error { kind, .. } => *kind,
        }
    }

    pub fn result_code(&self) -> ResultCode {
        match &self.payload {
            Payload::Request(_) | Payload::Response(_) => ResultCode::Ok,
            Payload::Error { code, .. } => *code,
        }
    }
}

pub type KeyValues = Vec<(String, String)>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialsRequest {
    pub credential: String,
    /// Attach as the diagnostic session of an already-bound credential.
    pub diagnostic: bool,
}

/// Request metadata of an invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerMetadata {
    pub url: Option<String>,
    pub method: Option<String>,
    pub headers: KeyValues,
    pub baggage: KeyValues,
    pub request_id: Option<String>,
    pub timeout_ms: Option<u64>,
}

impl TriggerMetadata {
    /// HTTP methods that never carry a request body.
    pub fn is_bodiless(&self) -> bool {
        matches!(
            self.method.as_deref().map(str::to_ascii_uppercase).as_deref(),
            Some("GET") | Some("HEAD")
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerRequest {
    pub method: String,
    pub metadata: TriggerMetadata,
    pub has_input_data: bool,
    pub has_output_data: bool,
    /// Present iff the call carries an input or an output body.
    pub stream_id: Option<StreamId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub headers: KeyValues,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerResponse {
    pub status: u16,
    pub metadata: ResponseMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamOpenResponse {
    pub stream_id: StreamId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamPushRequest {
    pub stream_id: StreamId,
    pub is_eos: bool,
    pub is_error: bool,
    pub data: Vec<u8>,
}

impl StreamPushRequest {
    pub fn chunk(stream_id: StreamId, data: impl Into<Vec<u8>>) -> Self {
        Self {
            stream_id,
            is_eos: false,
            is_error: false,
            data: data.into(),
        }
    }

    pub fn end(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            is_eos: true,
            is_error: false,
            data: Vec::new(),
        }
    }

    pub fn error(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            is_eos: false,
            is_error: true,
            data: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegerRecord {
    pub name: String,
    pub value: i64,
    pub labels: KeyValues,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectMetricsResponse {
    pub integer_records: Vec<IntegerRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceNotificationRequest {
    pub resource_id: String,
    pub token: Token,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceAction {
    AcquireShared,
    AcquireExclusive,
    Release,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePutRequest {
    pub resource_id: String,
    pub action: ResourceAction,
    /// Required for `Release`, ignored otherwise.
    pub token: Option<Token>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePutResponse {
    pub acquired_or_released: bool,
    pub token: Token,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    /// Caller-chosen id used by `FetchAbort`.
    pub request_id: u32,
    pub url: String,
    pub method: String,
    pub headers: KeyValues,
    /// Inbound stream (opened with `StreamOpen`) carrying the request body.
    pub stream_id: Option<StreamId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressFamily {
    IPv4,
    IPv6,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    pub address: String,
    pub family: AddressFamily,
    pub port: u16,
}

impl From<std::net::SocketAddr> for PeerAddress {
    fn from(addr: std::net::SocketAddr) -> Self {
        let family = if addr.is_ipv4() {
            AddressFamily::IPv4
        } else {
            AddressFamily::IPv6
        };
        Self {
            address: addr.ip().to_string(),
            family,
            port: addr.port(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: KeyValues,
    pub peer: Option<PeerAddress>,
    /// Stream carrying the response body, host to worker.
    pub stream_id: StreamId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchAbortRequest {
    pub request_id: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteInvokeRequest {
    pub app_id: String,
    pub method_name: String,
    pub data: Vec<u8>,
}

/// Request of both remote bindings and side-channel adaptors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingRequest {
    pub name: String,
    pub metadata: String,
    pub operation: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdaptorResponse {
    pub status: i32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InspectorCommandRequest {
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InspectorCommandResponse {
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TracingStartRequest {
    pub categories: Vec<String>,
}
