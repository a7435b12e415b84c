//! Session - one multiplexed duplex connection between the host and a worker.
//!
//! A session owns:
//! - a writer, serialised behind an async mutex (the transport's own backpressure)
//! - a reader task decoding frames and routing them
//! - a pending-request map correlating responses by request id
//! - a stream-id counter independent from the request-id space
//!
//! Responses may complete out of order. A response whose request already settled
//! (timed out, cancelled) is dropped. Inbound requests are dispatched to a
//! [`RequestHandler`] on their own task; a handler error or panic becomes a non-OK
//! response instead of taking the process down.

use std::collections::HashMap;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::FrameCodec;
use crate::bridge::protocol::{
    ErrorPayload, Message, Payload, RequestBody, RequestId, RequestKind, ResponseBody,
    ResultCode, StreamId,
};

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// How long a closing session keeps trying to flush and shut down its writer.
const WRITER_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Host-assigned identifier of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Why an outbound request failed, or why a session closed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("request timed out")]
    Timeout,
    #[error("connection reset")]
    ConnectionReset,
    #[error("session cancelled")]
    Cancelled,
    #[error("{code}: {message}")]
    Remote {
        code: ResultCode,
        message: String,
        stack: Option<String>,
    },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("failed to encode frame: {0}")]
    Encode(String),
    #[error("unexpected {got} response to {expected} request")]
    UnexpectedResponse {
        expected: RequestKind,
        got: RequestKind,
    },
}

impl SessionError {
    pub fn code(&self) -> ResultCode {
        match self {
            Self::Timeout => ResultCode::Timeout,
            Self::ConnectionReset | Self::Transport(_) => ResultCode::ConnectionReset,
            Self::Cancelled => ResultCode::Cancelled,
            Self::Remote { code, .. } => *code,
            Self::Encode(_) | Self::UnexpectedResponse { .. } => ResultCode::InternalError,
        }
    }
}

/// Error returned by a [`RequestHandler`]; written back as a non-OK response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ResponseError {
    pub code: ResultCode,
    pub message: String,
    pub stack: Option<String>,
    /// Close the session once this response has been written.
    pub close_session: bool,
}

impl ResponseError {
    pub fn new(code: ResultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            stack: None,
            close_session: false,
        }
    }

    pub fn client_error(message: impl Into<String>) -> Self {
        Self::new(ResultCode::ClientError, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ResultCode::InternalError, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ResultCode::Cancelled, message)
    }

    pub fn not_implemented(kind: RequestKind) -> Self {
        Self::new(ResultCode::NotImplemented, format!("{kind} is not implemented"))
    }

    pub fn closing(mut self) -> Self {
        self.close_session = true;
        self
    }
}

impl From<SessionError> for ResponseError {
    fn from(e: SessionError) -> Self {
        let code = e.code();
        match e {
            SessionError::Remote { message, stack, .. } => Self {
                code,
                message,
                stack,
                close_session: false,
            },
            other => Self::new(code, other.to_string()),
        }
    }
}

/// Serves inbound requests of a session.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        session: &Session,
        request: RequestBody,
    ) -> Result<ResponseBody, ResponseError>;
}

/// Unwrap the expected variant of a [`ResponseBody`].
macro_rules! expect_response {
    ($response:expr, $variant:ident) => {
        match $response {
            $crate::bridge::protocol::ResponseBody::$variant(body) => Ok(body),
            other => Err($crate::session::SessionError::UnexpectedResponse {
                expected: $crate::bridge::protocol::RequestKind::$variant,
                got: other.kind(),
            }),
        }
    };
}
pub(crate) use expect_response;

struct PendingRequest {
    kind: RequestKind,
    tx: oneshot::Sender<Result<ResponseBody, SessionError>>,
}

#[derive(Default)]
struct SessionState {
    pending: HashMap<RequestId, PendingRequest>,
    closed: Option<SessionError>,
}

struct SessionInner {
    id: SessionId,
    writer: tokio::sync::Mutex<FramedWrite<BoxWriter, FrameCodec>>,
    state: StdMutex<SessionState>,
    next_request_id: AtomicU32,
    next_stream_id: AtomicU32,
    shutdown: CancellationToken,
}

/// Cheaply cloneable handle to a running session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Removes a pending entry however the request future ends (settled, timed out, dropped).
struct PendingGuard<'a> {
    session: &'a Session,
    request_id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.session.state().pending.remove(&self.request_id);
    }
}

fn next_nonzero(counter: &AtomicU32) -> u32 {
    loop {
        let id = counter.fetch_add(1, Ordering::Relaxed);
        if id != 0 {
            return id;
        }
    }
}

impl Session {
    /// Wrap a duplex channel and start its reader task.
    pub fn spawn<T>(id: SessionId, io: T, handler: Arc<dyn RequestHandler>) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let reader: BoxReader = Box::new(read_half);
        let writer: BoxWriter = Box::new(write_half);

        let session = Self {
            inner: Arc::new(SessionInner {
                id,
                writer: tokio::sync::Mutex::new(FramedWrite::new(writer, FrameCodec::new())),
                state: StdMutex::new(SessionState::default()),
                next_request_id: AtomicU32::new(1),
                next_stream_id: AtomicU32::new(1),
                shutdown: CancellationToken::new(),
            }),
        };

        let reader = FramedRead::new(reader, FrameCodec::new());
        tokio::spawn(read_loop(session.clone(), reader, handler));
        tracing::debug!(session = %id, "Session started");
        session
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        // Critical sections never panic midway; recover rather than wedge the session.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Allocate a stream id. Wraps around, skipping 0.
    pub fn next_stream_id(&self) -> StreamId {
        next_nonzero(&self.inner.next_stream_id)
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed.is_some()
    }

    pub fn close_reason(&self) -> Option<SessionError> {
        self.state().closed.clone()
    }

    /// Resolves once the session has closed, with the reason.
    pub async fn closed(&self) -> SessionError {
        self.inner.shutdown.cancelled().await;
        self.close_reason().unwrap_or(SessionError::Cancelled)
    }

    /// Send a request and wait for its response, a timeout, or session closure.
    pub async fn request(
        &self,
        body: RequestBody,
        timeout: Duration,
    ) -> Result<ResponseBody, SessionError> {
        let kind = body.kind();
        let request_id = next_nonzero(&self.inner.next_request_id);
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state();
            if let Some(reason) = &state.closed {
                return Err(reason.clone());
            }
            state.pending.insert(request_id, PendingRequest { kind, tx });
        }
        let _guard = PendingGuard {
            session: self,
            request_id,
        };

        let exchange = async {
            self.write(Message::request(request_id, body)).await?;
            rx.await.unwrap_or(Err(SessionError::Cancelled))
        };
        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!(session = %self.id(), request_id, %kind, ?timeout, "Request timed out");
                Err(SessionError::Timeout)
            }
        }
    }

    pub(crate) async fn write(&self, msg: Message) -> Result<(), SessionError> {
        if let Some(reason) = self.close_reason() {
            return Err(reason);
        }

        let result = tokio::select! {
            biased;
            _ = self.inner.shutdown.cancelled() => {
                return Err(self.close_reason().unwrap_or(SessionError::Cancelled));
            }
            result = async {
                let mut writer = self.inner.writer.lock().await;
                writer.send(msg).await
            } => result,
        };

        match result {
            Ok(()) => Ok(()),
            // Encoding failed before anything reached the buffer.
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                Err(SessionError::Encode(e.to_string()))
            }
            Err(e) => {
                let reason = SessionError::Transport(e.to_string());
                self.terminate(reason.clone());
                Err(reason)
            }
        }
    }

    /// Tear the session down: every pending request fails with `reason`, the reader
    /// stops, and the writer is shut down. Idempotent; the first reason wins.
    pub fn terminate(&self, reason: SessionError) {
        let pending = {
            let mut state = self.state();
            if state.closed.is_some() {
                return;
            }
            state.closed = Some(reason.clone());
            std::mem::take(&mut state.pending)
        };

        tracing::debug!(
            session = %self.id(),
            %reason,
            pending = pending.len(),
            "Session closed"
        );
        for (_, request) in pending {
            let _ = request.tx.send(Err(reason.clone()));
        }
        self.inner.shutdown.cancel();

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut writer = inner.writer.lock().await;
            match tokio::time::timeout(WRITER_SHUTDOWN_GRACE, writer.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::trace!(session = %inner.id, error = %e, "Writer shutdown failed"),
                Err(_) => tracing::trace!(session = %inner.id, "Writer shutdown timed out"),
            }
        });
    }

    /// Locally initiated close; local callers observe `CANCELLED`.
    pub fn close(&self) {
        self.terminate(SessionError::Cancelled);
    }

    fn route(&self, msg: Message, handler: &Arc<dyn RequestHandler>) {
        let request_id = msg.request_id;
        let kind = msg.request_kind();
        let result = match msg.payload {
            Payload::Request(body) => {
                self.dispatch(request_id, body, Arc::clone(handler));
                return;
            }
            Payload::Response(body) => Ok(body),
            Payload::Error { code, error, .. } => Err(SessionError::Remote {
                code,
                message: error.message,
                stack: error.stack,
            }),
        };

        let Some(pending) = self.state().pending.remove(&request_id) else {
            tracing::debug!(
                session = %self.id(),
                request_id,
                %kind,
                "Dropping response for unknown or settled request"
            );
            return;
        };

        let result = if pending.kind == kind {
            result
        } else {
            Err(SessionError::UnexpectedResponse {
                expected: pending.kind,
                got: kind,
            })
        };
        let _ = pending.tx.send(result);
    }

    fn dispatch(&self, request_id: RequestId, body: RequestBody, handler: Arc<dyn RequestHandler>) {
        let session = self.clone();
        tokio::spawn(async move {
            let kind = body.kind();
            let outcome = AssertUnwindSafe(handler.handle(&session, body))
                .catch_unwind()
                .await;

            let mut close_after = false;
            let message = match outcome {
                Ok(Ok(response)) if response.kind() == kind => {
                    Message::response(request_id, response)
                }
                Ok(Ok(response)) => {
                    tracing::error!(
                        session = %session.id(),
                        %kind,
                        got = %response.kind(),
                        "Handler answered with the wrong response kind"
                    );
                    error_message(
                        request_id,
                        kind,
                        ResponseError::internal(format!(
                            "handler answered {kind} with {}",
                            response.kind()
                        )),
                    )
                }
                Ok(Err(err)) => {
                    close_after = err.close_session;
                    error_message(request_id, kind, err)
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    tracing::error!(session = %session.id(), %kind, %message, "Request handler panicked");
                    error_message(request_id, kind, ResponseError::internal(message))
                }
            };

            if let Err(e) = session.write(message).await {
                tracing::debug!(session = %session.id(), request_id, %kind, error = %e, "Failed to write response");
            }
            if close_after {
                session.close();
            }
        });
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.state().pending.len()
    }
}

fn error_message(request_id: RequestId, kind: RequestKind, err: ResponseError) -> Message {
    let code = match err.code {
        // An OK code would make the peer decode the error payload as the kind's schema.
        ResultCode::Ok => ResultCode::InternalError,
        code => code,
    };
    Message::error(
        request_id,
        kind,
        code,
        ErrorPayload {
            message: err.message,
            stack: err.stack,
        },
    )
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "request handler panicked".to_string()
    }
}

async fn read_loop(
    session: Session,
    mut reader: FramedRead<BoxReader, FrameCodec>,
    handler: Arc<dyn RequestHandler>,
) {
    let reason = loop {
        let frame = tokio::select! {
            biased;
            _ = session.inner.shutdown.cancelled() => break None,
            frame = reader.next() => frame,
        };
        match frame {
            Some(Ok(msg)) => session.route(msg, &handler),
            Some(Err(e)) => {
                tracing::warn!(session = %session.id(), error = %e, "Session read failed, closing");
                break Some(SessionError::Transport(e.to_string()));
            }
            None => break Some(SessionError::ConnectionReset),
        }
    };

    if let Some(reason) = reason {
        session.terminate(reason);
    }
    tracing::trace!(session = %session.id(), "Session reader exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{
        Empty, InspectorCommandRequest, InspectorCommandResponse, MessageKind,
    };
    use futures::future::join_all;
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio_util::codec::Framed;

    struct TestHandler;

    #[async_trait]
    impl RequestHandler for TestHandler {
        async fn handle(
            &self,
            _session: &Session,
            request: RequestBody,
        ) -> Result<ResponseBody, ResponseError> {
            match request {
                RequestBody::InspectorCommand(req) => {
                    Ok(ResponseBody::InspectorCommand(InspectorCommandResponse {
                        message: Some(req.message),
                    }))
                }
                RequestBody::TracingStop(_) => panic!("tracing exploded"),
                RequestBody::TracingStart(_) => {
                    Err(ResponseError::client_error("go away").closing())
                }
                other => Err(ResponseError::not_implemented(other.kind())),
            }
        }
    }

    fn pair() -> (Session, Framed<DuplexStream, FrameCodec>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let session = Session::spawn(SessionId::new(1), a, Arc::new(TestHandler));
        (session, Framed::new(b, FrameCodec::new()))
    }

    fn command(message: &str) -> RequestBody {
        RequestBody::InspectorCommand(InspectorCommandRequest {
            message: message.to_string(),
        })
    }

    #[tokio::test]
    async fn correlates_responses_answered_in_reverse_order() {
        let (session, mut peer) = pair();

        let requests = (0..8).map(|i| {
            let session = session.clone();
            async move {
                let response = session
                    .request(command(&format!("call-{i}")), Duration::from_secs(5))
                    .await
                    .unwrap();
                (i, expect_response!(response, InspectorCommand).unwrap())
            }
        });

        let peer_task = async {
            let mut received = Vec::new();
            for _ in 0..8 {
                let msg = peer.next().await.unwrap().unwrap();
                let Payload::Request(RequestBody::InspectorCommand(req)) = msg.payload else {
                    panic!("unexpected frame");
                };
                received.push((msg.request_id, req.message));
            }
            for (request_id, message) in received.into_iter().rev() {
                peer.send(Message::response(
                    request_id,
                    ResponseBody::InspectorCommand(InspectorCommandResponse {
                        message: Some(message),
                    }),
                ))
                .await
                .unwrap();
            }
        };

        let (results, ()) = tokio::join!(join_all(requests), peer_task);
        for (i, response) in results {
            assert_eq!(response.message, Some(format!("call-{i}")));
        }
        assert_eq!(session.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_rejects_and_late_response_is_dropped() {
        let (session, mut peer) = pair();

        let started = tokio::time::Instant::now();
        let call = tokio::spawn({
            let session = session.clone();
            async move {
                session
                    .request(command("slow"), Duration::from_millis(100))
                    .await
            }
        });

        let first = peer.next().await.unwrap().unwrap();
        assert_eq!(call.await.unwrap(), Err(SessionError::Timeout));
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(session.pending_len(), 0);

        // The late answer must not disturb the next request.
        peer.send(Message::response(
            first.request_id,
            ResponseBody::InspectorCommand(InspectorCommandResponse {
                message: Some("late".to_string()),
            }),
        ))
        .await
        .unwrap();

        let call = tokio::spawn({
            let session = session.clone();
            async move { session.request(command("fast"), Duration::from_secs(5)).await }
        });
        let second = peer.next().await.unwrap().unwrap();
        assert_ne!(second.request_id, first.request_id);
        peer.send(Message::response(
            second.request_id,
            ResponseBody::InspectorCommand(InspectorCommandResponse {
                message: Some("fast".to_string()),
            }),
        ))
        .await
        .unwrap();

        let response = call.await.unwrap().unwrap();
        assert_eq!(
            expect_response!(response, InspectorCommand).unwrap().message,
            Some("fast".to_string())
        );
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn handler_panic_becomes_internal_error() {
        let (_session, mut peer) = pair();

        peer.send(Message::request(11, RequestBody::TracingStop(Empty)))
            .await
            .unwrap();
        let reply = peer.next().await.unwrap().unwrap();

        assert_eq!(reply.request_id, 11);
        assert_eq!(reply.kind(), MessageKind::Response);
        assert_eq!(reply.result_code(), ResultCode::InternalError);
        let Payload::Error { error, .. } = reply.payload else {
            panic!("expected error payload");
        };
        assert_eq!(error.message, "tracing exploded");
    }

    #[tokio::test]
    async fn unhandled_kind_is_not_implemented() {
        let (_session, mut peer) = pair();

        peer.send(Message::request(3, RequestBody::InspectorStart(Empty)))
            .await
            .unwrap();
        let reply = peer.next().await.unwrap().unwrap();
        assert_eq!(reply.result_code(), ResultCode::NotImplemented);
    }

    #[tokio::test]
    async fn closing_error_closes_after_responding() {
        let (session, mut peer) = pair();

        peer.send(Message::request(
            4,
            RequestBody::TracingStart(Default::default()),
        ))
        .await
        .unwrap();
        let reply = peer.next().await.unwrap().unwrap();
        assert_eq!(reply.result_code(), ResultCode::ClientError);

        assert_eq!(session.closed().await, SessionError::Cancelled);
        assert!(peer.next().await.is_none());
    }

    #[tokio::test]
    async fn peer_disconnect_fails_pending_with_connection_reset() {
        let (session, mut peer) = pair();

        let call = tokio::spawn({
            let session = session.clone();
            async move { session.request(command("x"), Duration::from_secs(30)).await }
        });
        peer.next().await.unwrap().unwrap();
        drop(peer);

        assert_eq!(call.await.unwrap(), Err(SessionError::ConnectionReset));
        assert_eq!(session.closed().await, SessionError::ConnectionReset);
    }

    #[tokio::test]
    async fn local_close_cancels_pending_and_later_requests() {
        let (session, mut peer) = pair();

        let call = tokio::spawn({
            let session = session.clone();
            async move { session.request(command("x"), Duration::from_secs(30)).await }
        });
        peer.next().await.unwrap().unwrap();
        session.close();

        assert_eq!(call.await.unwrap(), Err(SessionError::Cancelled));
        assert_eq!(
            session.request(command("y"), Duration::from_secs(1)).await,
            Err(SessionError::Cancelled)
        );
        assert!(peer.next().await.is_none());
    }

    #[tokio::test]
    async fn malformed_frame_destroys_session() {
        let (session, peer) = pair();
        let mut raw = peer.into_inner();

        let call = tokio::spawn({
            let session = session.clone();
            async move { session.request(command("x"), Duration::from_secs(30)).await }
        });
        raw.write_all(&[7u8; 13]).await.unwrap();

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::Transport(_)));
        assert_eq!(err.code(), ResultCode::ConnectionReset);
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn stream_ids_are_independent_of_request_ids() {
        let (session, mut peer) = pair();

        assert_eq!(session.next_stream_id(), 1);
        assert_eq!(session.next_stream_id(), 2);

        let call = tokio::spawn({
            let session = session.clone();
            async move { session.request(command("x"), Duration::from_secs(5)).await }
        });
        let msg = peer.next().await.unwrap().unwrap();
        assert_eq!(msg.request_id, 1);
        session.close();
        let _ = call.await;
    }

    #[test]
    fn counters_skip_zero_on_wrap() {
        let counter = AtomicU32::new(u32::MAX);
        assert_eq!(next_nonzero(&counter), u32::MAX);
        assert_eq!(next_nonzero(&counter), 1);
    }

    #[test]
    fn remote_error_text() {
        let err = SessionError::Remote {
            code: ResultCode::ClientError,
            message: "credential not registered".to_string(),
            stack: None,
        };
        insta::assert_snapshot!(err.to_string(), @"CLIENT_ERROR: credential not registered");
        assert_eq!(ResponseError::from(err).code, ResultCode::ClientError);
    }
}
