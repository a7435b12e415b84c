//! Worker side of the link.
//!
//! A worker makes one connection to the host, presents its credential, and from
//! then on both calls into host capabilities (fetch, adaptors, resources) and
//! serves the host's invocations through a [`WorkerHandler`].
//!
//! Every handler method defaults to `NOT_IMPLEMENTED`, so a worker only overrides
//! what it actually supports.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::{
    AdaptorResponse, BindingRequest, CollectMetricsResponse, CredentialsRequest, Empty,
    FetchAbortRequest, FetchRequest, InspectorCommandResponse, IntegerRecord, KeyValues,
    PeerAddress, RemoteInvokeRequest, RequestBody, RequestKind, ResourceAction,
    ResourcePutRequest, ResourcePutResponse, ResponseBody, ResponseMetadata, StreamId,
    StreamPushRequest, TriggerMetadata, TriggerRequest, TriggerResponse,
};
use crate::bridge::transport;
use crate::config::WorkerConfig;
use crate::resource::Token;
use crate::session::{
    RequestHandler, ResponseError, Session, SessionError, SessionId, expect_response,
};
use crate::stream::{BodySource, ByteStream, InboundStreams, StreamError, StreamSink, pipe};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to connect to host socket {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("host rejected credentials: {0}")]
    Handshake(#[source] SessionError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// An invocation from the host.
#[derive(Debug)]
pub struct TriggerContext {
    pub method: String,
    pub metadata: TriggerMetadata,
    /// Request body; already ended when the host sent none.
    pub body: ByteStream,
}

/// Response to a host invocation.
pub struct TriggerReply {
    pub status: u16,
    pub metadata: ResponseMetadata,
    /// Response body; ignored when the host expects none.
    pub body: Option<BodySource>,
}

impl TriggerReply {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            metadata: ResponseMetadata::default(),
            body: None,
        }
    }

    pub fn with_body(mut self, body: BodySource) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.headers.push((name.into(), value.into()));
        self
    }
}

/// Serves the host's calls into this worker.
#[async_trait]
pub trait WorkerHandler: Send + Sync + 'static {
    async fn trigger(&self, ctx: TriggerContext) -> Result<TriggerReply, ResponseError> {
        let _ = ctx;
        Err(ResponseError::not_implemented(RequestKind::Trigger))
    }

    async fn collect_metrics(&self) -> Result<Vec<IntegerRecord>, ResponseError> {
        Err(ResponseError::not_implemented(RequestKind::CollectMetrics))
    }

    async fn inspector_start(&self) -> Result<(), ResponseError> {
        Err(ResponseError::not_implemented(RequestKind::InspectorStart))
    }

    async fn inspector_start_session(&self) -> Result<(), ResponseError> {
        Err(ResponseError::not_implemented(
            RequestKind::InspectorStartSession,
        ))
    }

    /// Returns the inspector's reply or event, if any.
    async fn inspector_command(&self, message: String) -> Result<Option<String>, ResponseError> {
        let _ = message;
        Err(ResponseError::not_implemented(RequestKind::InspectorCommand))
    }

    async fn tracing_start(&self, categories: Vec<String>) -> Result<(), ResponseError> {
        let _ = categories;
        Err(ResponseError::not_implemented(RequestKind::TracingStart))
    }

    async fn tracing_stop(&self) -> Result<(), ResponseError> {
        Err(ResponseError::not_implemented(RequestKind::TracingStop))
    }
}

#[derive(Default)]
struct Grants {
    waiters: HashMap<Token, oneshot::Sender<()>>,
    /// Grants that arrived before anyone waited for them.
    early: HashSet<Token>,
    closed: bool,
}

struct WorkerShared {
    /// Streams from the host: trigger inputs and fetch response bodies. Chunks may
    /// race ahead of the frame announcing their stream.
    inbound: InboundStreams,
    grants: StdMutex<Grants>,
    shutdown: CancellationToken,
}

impl WorkerShared {
    fn grants(&self) -> MutexGuard<'_, Grants> {
        self.grants.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn grant(&self, token: Token) {
        let mut grants = self.grants();
        match grants.waiters.remove(&token) {
            Some(tx) => {
                let _ = tx.send(());
            }
            None => {
                grants.early.insert(token);
            }
        }
    }

    /// Resolves once `token` is granted; fails if the session closes first.
    fn wait_grant(&self, token: &Token) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let mut grants = self.grants();
        if grants.early.remove(token) {
            let _ = tx.send(());
        } else if !grants.closed {
            grants.waiters.insert(token.clone(), tx);
        }
        rx
    }

    /// Drop any pending or early grant of a token being released.
    fn forget(&self, token: &Token) {
        let mut grants = self.grants();
        grants.waiters.remove(token);
        grants.early.remove(token);
    }

    fn close(&self) {
        self.shutdown.cancel();
        self.inbound.close(StreamError::PeerClosed);
        let mut grants = self.grants();
        grants.closed = true;
        grants.waiters.clear();
        grants.early.clear();
    }
}

struct WorkerDispatch {
    handler: Arc<dyn WorkerHandler>,
    shared: Arc<WorkerShared>,
    stream_timeout: std::time::Duration,
}

impl WorkerDispatch {
    async fn trigger(
        &self,
        session: &Session,
        request: TriggerRequest,
    ) -> Result<TriggerResponse, ResponseError> {
        let body = match request.stream_id {
            Some(stream_id) if request.has_input_data => self.shared.inbound.register(stream_id)?,
            _ => ByteStream::empty(),
        };
        let reply = self
            .handler
            .trigger(TriggerContext {
                method: request.method,
                metadata: request.metadata,
                body,
            })
            .await?;

        match request.stream_id {
            Some(stream_id) if request.has_output_data => {
                let source = reply
                    .body
                    .unwrap_or_else(|| ByteStream::empty().into_source());
                let sink = StreamSink::new(session.clone(), stream_id, self.stream_timeout);
                let cancel = self.shared.shutdown.child_token();
                tokio::spawn(async move {
                    if let Err(e) = pipe(source, sink, cancel).await
                        && !e.is_peer_closed()
                    {
                        tracing::debug!(stream_id, error = %e, "Trigger output stream failed");
                    }
                });
            }
            _ if reply.body.is_some() => {
                tracing::debug!("Dropping response body of a bodiless trigger");
            }
            _ => {}
        }

        Ok(TriggerResponse {
            status: reply.status,
            metadata: reply.metadata,
        })
    }
}

#[async_trait]
impl RequestHandler for WorkerDispatch {
    async fn handle(
        &self,
        session: &Session,
        request: RequestBody,
    ) -> Result<ResponseBody, ResponseError> {
        let kind = request.kind();
        match request {
            RequestBody::Trigger(request) => self
                .trigger(session, request)
                .await
                .map(ResponseBody::Trigger),
            RequestBody::StreamPush(push) => {
                self.shared.inbound.push(push).await?;
                Ok(ResponseBody::StreamPush(Empty))
            }
            RequestBody::CollectMetrics(Empty) => {
                let integer_records = self.handler.collect_metrics().await?;
                Ok(ResponseBody::CollectMetrics(CollectMetricsResponse {
                    integer_records,
                }))
            }
            RequestBody::ResourceNotification(notification) => {
                tracing::debug!(
                    resource_id = %notification.resource_id,
                    token = %notification.token,
                    "Resource granted"
                );
                self.shared.grant(notification.token);
                Ok(ResponseBody::ResourceNotification(Empty))
            }
            RequestBody::InspectorStart(Empty) => {
                self.handler.inspector_start().await?;
                Ok(ResponseBody::InspectorStart(Empty))
            }
            RequestBody::InspectorStartSession(Empty) => {
                self.handler.inspector_start_session().await?;
                Ok(ResponseBody::InspectorStartSession(Empty))
            }
            RequestBody::InspectorCommand(command) => {
                let message = self.handler.inspector_command(command.message).await?;
                Ok(ResponseBody::InspectorCommand(InspectorCommandResponse {
                    message,
                }))
            }
            RequestBody::TracingStart(start) => {
                self.handler.tracing_start(start.categories).await?;
                Ok(ResponseBody::TracingStart(Empty))
            }
            RequestBody::TracingStop(Empty) => {
                self.handler.tracing_stop().await?;
                Ok(ResponseBody::TracingStop(Empty))
            }
            // Worker-to-host kinds.
            RequestBody::Credentials(_)
            | RequestBody::StreamOpen(_)
            | RequestBody::ResourcePut(_)
            | RequestBody::Fetch(_)
            | RequestBody::FetchAbort(_)
            | RequestBody::RemoteInvoke(_)
            | RequestBody::RemoteBinding(_)
            | RequestBody::SideChannel(_) => Err(ResponseError::not_implemented(kind)),
        }
    }
}

/// Outbound HTTP request proxied through the host.
#[derive(Debug, Clone, Default)]
pub struct FetchSpec {
    pub url: String,
    pub method: String,
    pub headers: KeyValues,
}

impl FetchSpec {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: method.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug)]
pub struct FetchResult {
    /// Id to pass to [`WorkerClient::fetch_abort`].
    pub fetch_id: u32,
    pub status: u16,
    pub headers: KeyValues,
    pub peer: Option<PeerAddress>,
    pub body: ByteStream,
}

/// Connection from a worker to its host.
#[derive(Clone)]
pub struct WorkerClient {
    session: Session,
    shared: Arc<WorkerShared>,
    config: Arc<WorkerConfig>,
    next_fetch_id: Arc<AtomicU32>,
}

impl std::fmt::Debug for WorkerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerClient")
            .field("credential", &self.config.credential)
            .field("session", &self.session)
            .finish()
    }
}

impl WorkerClient {
    /// Connect to the host and complete the credential handshake.
    pub async fn connect(
        config: WorkerConfig,
        handler: Arc<dyn WorkerHandler>,
    ) -> Result<Self, WorkerError> {
        let stream = transport::connect(
            &config.socket_path,
            config.connect_retries,
            config.connect_retry_delay,
        )
        .await
        .map_err(|source| WorkerError::Connect {
            path: config.socket_path.clone(),
            source,
        })?;

        let shared = Arc::new(WorkerShared {
            inbound: InboundStreams::lazy(),
            grants: StdMutex::new(Grants::default()),
            shutdown: CancellationToken::new(),
        });
        let dispatch = Arc::new(WorkerDispatch {
            handler,
            shared: Arc::clone(&shared),
            stream_timeout: config.timeouts.stream,
        });
        let session = Session::spawn(SessionId::new(0), stream, dispatch);

        let handshake = session
            .request(
                RequestBody::Credentials(CredentialsRequest {
                    credential: config.credential.clone(),
                    diagnostic: config.diagnostic,
                }),
                config.timeouts.handshake,
            )
            .await
            .and_then(|response| expect_response!(response, Credentials));
        if let Err(e) = handshake {
            tracing::warn!(credential = %config.credential, error = %e, "Credential handshake failed");
            session.close();
            return Err(WorkerError::Handshake(e));
        }
        tracing::info!(
            credential = %config.credential,
            diagnostic = config.diagnostic,
            "Connected to host"
        );

        tokio::spawn({
            let session = session.clone();
            let shared = Arc::clone(&shared);
            async move {
                let reason = session.closed().await;
                tracing::debug!(%reason, "Host connection closed");
                shared.close();
            }
        });

        Ok(Self {
            session,
            shared,
            config: Arc::new(config),
            next_fetch_id: Arc::new(AtomicU32::new(1)),
        })
    }

    pub fn credential(&self) -> &str {
        &self.config.credential
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    /// Resolves once the host connection is gone.
    pub async fn closed(&self) -> SessionError {
        self.session.closed().await
    }

    pub fn close(&self) {
        self.session.close();
    }

    /// Allocate an inbound stream on the host.
    pub async fn stream_open(&self) -> Result<StreamId, WorkerError> {
        let response = self
            .session
            .request(RequestBody::StreamOpen(Empty), self.config.timeouts.stream)
            .await?;
        Ok(expect_response!(response, StreamOpen)?.stream_id)
    }

    pub async fn stream_push(&self, push: StreamPushRequest) -> Result<(), WorkerError> {
        let response = self
            .session
            .request(RequestBody::StreamPush(push), self.config.timeouts.stream)
            .await?;
        expect_response!(response, StreamPush)?;
        Ok(())
    }

    /// Proxy an HTTP request through the host, streaming `body` as its request body.
    pub async fn fetch(
        &self,
        spec: FetchSpec,
        body: Option<BodySource>,
    ) -> Result<FetchResult, WorkerError> {
        let fetch_id = loop {
            let id = self.next_fetch_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                break id;
            }
        };

        let (stream_id, upload) = match body {
            Some(body) => {
                let stream_id = self.stream_open().await?;
                let sink = StreamSink::new(
                    self.session.clone(),
                    stream_id,
                    self.config.timeouts.stream,
                );
                let cancel = self.shared.shutdown.child_token();
                // Runs alongside the fetch call: the host drains it as upstream reads it.
                tokio::spawn({
                    let cancel = cancel.clone();
                    async move {
                        if let Err(e) = pipe(body, sink, cancel).await
                            && !e.is_peer_closed()
                        {
                            tracing::debug!(fetch_id, stream_id, error = %e, "Fetch upload failed");
                        }
                    }
                });
                (Some(stream_id), Some(cancel))
            }
            None => (None, None),
        };

        let response = self
            .session
            .request(
                RequestBody::Fetch(FetchRequest {
                    request_id: fetch_id,
                    url: spec.url,
                    method: spec.method,
                    headers: spec.headers,
                    stream_id,
                }),
                self.config.timeouts.fetch,
            )
            .await
            .and_then(|response| expect_response!(response, Fetch));
        let head = match response {
            Ok(head) => head,
            Err(e) => {
                if let Some(cancel) = upload {
                    cancel.cancel();
                }
                return Err(e.into());
            }
        };

        let body = self
            .shared
            .inbound
            .register(head.stream_id)
            .map_err(|_| StreamError::PeerClosed)?;
        Ok(FetchResult {
            fetch_id,
            status: head.status,
            headers: head.headers,
            peer: head.peer,
            body,
        })
    }

    /// Abort an in-flight fetch. A fetch that already finished is left alone.
    pub async fn fetch_abort(&self, fetch_id: u32) -> Result<(), WorkerError> {
        let response = self
            .session
            .request(
                RequestBody::FetchAbort(FetchAbortRequest {
                    request_id: fetch_id,
                }),
                self.config.timeouts.fetch,
            )
            .await?;
        expect_response!(response, FetchAbort)?;
        Ok(())
    }

    pub async fn remote_invoke(
        &self,
        request: RemoteInvokeRequest,
    ) -> Result<AdaptorResponse, WorkerError> {
        let response = self
            .session
            .request(
                RequestBody::RemoteInvoke(request),
                self.config.timeouts.fetch,
            )
            .await?;
        Ok(expect_response!(response, RemoteInvoke)?)
    }

    pub async fn remote_binding(
        &self,
        request: BindingRequest,
    ) -> Result<AdaptorResponse, WorkerError> {
        let response = self
            .session
            .request(
                RequestBody::RemoteBinding(request),
                self.config.timeouts.fetch,
            )
            .await?;
        Ok(expect_response!(response, RemoteBinding)?)
    }

    pub async fn side_channel(
        &self,
        request: BindingRequest,
    ) -> Result<AdaptorResponse, WorkerError> {
        let response = self
            .session
            .request(
                RequestBody::SideChannel(request),
                self.config.timeouts.side_channel,
            )
            .await?;
        Ok(expect_response!(response, SideChannel)?)
    }

    pub async fn resource_put(
        &self,
        request: ResourcePutRequest,
    ) -> Result<ResourcePutResponse, WorkerError> {
        let response = self
            .session
            .request(
                RequestBody::ResourcePut(request),
                self.config.timeouts.fetch,
            )
            .await?;
        Ok(expect_response!(response, ResourcePut)?)
    }

    /// Acquire a resource, waiting in line if it is contended.
    pub async fn acquire_resource(
        &self,
        resource_id: &str,
        exclusive: bool,
    ) -> Result<Token, WorkerError> {
        let action = if exclusive {
            ResourceAction::AcquireExclusive
        } else {
            ResourceAction::AcquireShared
        };
        let put = self
            .resource_put(ResourcePutRequest {
                resource_id: resource_id.to_string(),
                action,
                token: None,
            })
            .await?;
        if put.acquired_or_released {
            return Ok(put.token);
        }

        tracing::debug!(resource_id, token = %put.token, "Waiting for resource grant");
        let granted = self.shared.wait_grant(&put.token);
        granted.await.map_err(|_| {
            WorkerError::Session(self.session.close_reason().unwrap_or(SessionError::Cancelled))
        })?;
        Ok(put.token)
    }

    /// Release a held or queued token. Returns false if the host no longer knew it.
    pub async fn release_resource(
        &self,
        resource_id: &str,
        token: Token,
    ) -> Result<bool, WorkerError> {
        self.shared.forget(&token);
        let put = self
            .resource_put(ResourcePutRequest {
                resource_id: resource_id.to_string(),
                action: ResourceAction::Release,
                token: Some(token),
            })
            .await?;
        Ok(put.acquired_or_released)
    }
}
