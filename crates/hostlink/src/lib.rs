//! hostlink: invocation protocol between a compute host and its sandboxed workers.

pub mod bridge;
pub mod config;
pub mod connection;
pub mod host;
pub mod invocation;
pub mod metering;
pub mod resource;
pub mod session;
pub mod stream;
pub mod telemetry;
pub mod worker;

pub use bridge::protocol::{ResultCode, StreamId, TriggerMetadata};
pub use config::{HostConfig, Timeouts, WorkerConfig};
pub use connection::{ConnectionRecord, ConnectionRegistry, RegisterOptions, WorkerState};
pub use host::{HostError, HostEvent, HostServer, TriggerResult};
pub use invocation::InvocationController;
pub use invocation::adaptor::{AdaptorError, RemoteAdaptor, SideChannelAdaptor};
pub use metering::{Meter, NoopMeter, TracingMeter};
pub use resource::{AcquireOutcome, ResourceArbiter, ResourceEvent, ResourceStub, Token};
pub use session::{RequestHandler, ResponseError, Session, SessionError, SessionId};
pub use stream::{BodySource, ByteStream, StreamError, StreamSink};
pub use telemetry::init_tracing;
pub use worker::{
    FetchResult, FetchSpec, TriggerContext, TriggerReply, WorkerClient, WorkerError,
    WorkerHandler,
};
