//! Host side of the link: accepts worker connections and calls into them.
//!
//! Every accepted connection becomes a [`Session`] keyed by a host-assigned
//! [`SessionId`]. A session must present a registered credential before anything
//! else; once bound, its requests are served by the [`InvocationController`] and
//! the host can trigger it by credential. Sessions that never complete the
//! handshake are reaped after the handshake timeout.
//!
//! Resource namespaces are process-scoped: every namespace has one
//! [`ResourceArbiter`] and one task turning its events into grant notifications.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::net::UnixStream;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::{
    CredentialsRequest, Empty, InspectorCommandRequest, IntegerRecord, RequestBody,
    ResourceNotificationRequest, ResponseBody, StreamPushRequest, TracingStartRequest,
    TriggerMetadata,
};
use crate::bridge::transport::HostListener;
use crate::config::{HostConfig, Timeouts};
use crate::connection::{ConnectionRecord, ConnectionRegistry, RegisterOptions, Unbound};
use crate::invocation::InvocationController;
pub use crate::invocation::TriggerResult;
use crate::resource::{ResourceArbiter, ResourceEvent, Token};
use crate::session::{
    RequestHandler, ResponseError, Session, SessionError, SessionId, expect_response,
};
use crate::stream::BodySource;

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("failed to bind host socket {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("listener failed: {0}")]
    Listener(#[source] io::Error),
    #[error("failed to build fetch client: {0}")]
    Client(#[from] reqwest::Error),
    #[error("credential {0} is not connected")]
    NotConnected(String),
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Worker arrivals and departures, for the process managing worker lifecycles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Bound {
        credential: String,
        session: SessionId,
        diagnostic: bool,
    },
    Disconnected {
        credential: String,
        session: SessionId,
    },
}

struct HostShared {
    timeouts: Timeouts,
    controller: InvocationController,
    sessions: DashMap<SessionId, Session>,
    registry: ConnectionRegistry,
    namespaces: StdMutex<HashMap<String, ResourceArbiter>>,
    next_session_id: AtomicU64,
    events: mpsc::UnboundedSender<HostEvent>,
    keep_alive: AtomicBool,
    listening: AtomicBool,
    listener_error: StdMutex<Option<HostError>>,
    /// Signalled whenever a session goes away or the listener stops.
    changed: Notify,
    shutdown: CancellationToken,
}

impl HostShared {
    fn emit(&self, event: HostEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    fn namespaces(&self) -> MutexGuard<'_, HashMap<String, ResourceArbiter>> {
        self.namespaces.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Arbiter of `name`, created with its event pump on first use.
    fn namespace(self: &Arc<Self>, name: &str) -> ResourceArbiter {
        let mut namespaces = self.namespaces();
        if let Some(arbiter) = namespaces.get(name) {
            return arbiter.clone();
        }
        let (arbiter, events) = ResourceArbiter::new(name, self.timeouts.acquisition);
        tokio::spawn(resource_event_pump(
            Arc::downgrade(self),
            name.to_string(),
            events,
        ));
        namespaces.insert(name.to_string(), arbiter.clone());
        tracing::debug!(namespace = name, "Created resource namespace");
        arbiter
    }

    fn adopt(self: &Arc<Self>, stream: UnixStream) {
        let id = SessionId::new(self.next_session_id.fetch_add(1, Ordering::Relaxed));
        let handler = Arc::new(SessionHandler {
            shared: Arc::downgrade(self),
            binding: OnceLock::new(),
        });
        let session = Session::spawn(id, stream, Arc::clone(&handler) as Arc<dyn RequestHandler>);
        self.sessions.insert(id, session.clone());
        tracing::debug!(session = %id, "Accepted worker connection");
        tokio::spawn(watch_session(
            Arc::downgrade(self),
            session,
            handler,
            self.timeouts.handshake,
        ));
    }

    fn handshake(
        self: &Arc<Self>,
        session: &Session,
        request: CredentialsRequest,
    ) -> Result<Bound, ResponseError> {
        let CredentialsRequest {
            credential,
            diagnostic,
        } = request;
        let binding = self
            .registry
            .bind(&credential, session.clone(), diagnostic, |namespace| {
                self.namespace(namespace)
            })
            .inspect_err(|e| {
                tracing::warn!(session = %session.id(), %credential, error = %e, "Rejected handshake");
            })?;

        if let Some(evicted) = binding.evicted {
            tracing::info!(
                %credential,
                evicted = %evicted.session_id(),
                session = %session.id(),
                "Preempting previous connection"
            );
            self.sessions.remove(&evicted.session_id());
            self.disconnect(&evicted, SessionError::Cancelled);
        }

        tracing::info!(%credential, session = %session.id(), diagnostic, "Worker bound");
        self.emit(HostEvent::Bound {
            credential,
            session: session.id(),
            diagnostic,
        });
        Ok(Bound {
            record: binding.record,
            diagnostic,
        })
    }

    /// Tell the owner of `token` that it was granted. Grants whose owner is no
    /// longer connected are handed straight back.
    fn notify_grant(&self, arbiter: &ResourceArbiter, resource_id: &str, token: Token) {
        let Some(record) = self.registry.record(token.credential()) else {
            tracing::debug!(resource_id, %token, "Granted token has no owner, releasing");
            arbiter.release(resource_id, &token);
            return;
        };
        let session = record.session().clone();
        let timeout = self.timeouts.resource_notification;
        let resource_id = resource_id.to_string();
        tokio::spawn(async move {
            let notification = RequestBody::ResourceNotification(ResourceNotificationRequest {
                resource_id: resource_id.clone(),
                token: token.clone(),
            });
            let result = session
                .request(notification, timeout)
                .await
                .and_then(|response| expect_response!(response, ResourceNotification));
            if let Err(e) = result {
                tracing::warn!(session = %session.id(), %resource_id, %token, error = %e, "Failed to deliver resource grant");
            }
        });
    }

    /// Drop a bound session's record and report it gone.
    fn disconnect(&self, record: &ConnectionRecord, reason: SessionError) {
        if let Some(summary) = record.close(reason) {
            tracing::info!(
                credential = %record.credential(),
                session = %record.session_id(),
                ?summary,
                "Worker disconnected"
            );
            self.emit(HostEvent::Disconnected {
                credential: record.credential().to_string(),
                session: record.session_id(),
            });
        }
    }

    fn is_idle(&self) -> bool {
        !self.listening.load(Ordering::Acquire)
            && (!self.keep_alive.load(Ordering::Acquire) || self.sessions.is_empty())
    }
}

async fn resource_event_pump(
    shared: Weak<HostShared>,
    namespace: String,
    mut events: mpsc::UnboundedReceiver<ResourceEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        match event {
            ResourceEvent::Granted { resource_id, grants } => {
                let Some(arbiter) = shared.namespaces().get(&namespace).cloned() else {
                    break;
                };
                for token in grants {
                    shared.notify_grant(&arbiter, &resource_id, token);
                }
            }
            ResourceEvent::TimedOut {
                resource_id,
                released,
            } => {
                for token in &released {
                    if let Some(record) = shared.registry.record(token.credential()) {
                        record.state().remove_token(token);
                    }
                }
                tracing::debug!(%namespace, %resource_id, released = released.len(), "Forgot force-released tokens");
            }
            ResourceEvent::Idle { resource_id } => {
                tracing::trace!(%namespace, %resource_id, "Resource idle");
            }
        }
    }
}

/// Lives until the session closes, then unbinds it.
async fn watch_session(
    shared: Weak<HostShared>,
    session: Session,
    handler: Arc<SessionHandler>,
    handshake_timeout: Duration,
) {
    tokio::select! {
        _ = session.closed() => {}
        _ = tokio::time::sleep(handshake_timeout) => {
            if handler.binding.get().is_none() {
                tracing::warn!(session = %session.id(), ?handshake_timeout, "No credentials presented, closing session");
                session.terminate(SessionError::Timeout);
            }
        }
    }
    let reason = session.closed().await;

    let Some(shared) = shared.upgrade() else {
        return;
    };
    shared.sessions.remove(&session.id());
    match shared.registry.unbind_session(session.id()) {
        Some(Unbound::Primary(record)) => shared.disconnect(&record, reason),
        Some(Unbound::Diagnostic { credential }) => {
            tracing::debug!(%credential, session = %session.id(), "Diagnostic session detached");
        }
        None => tracing::debug!(session = %session.id(), %reason, "Session closed"),
    }
    shared.changed.notify_waiters();
}

struct Bound {
    record: Arc<ConnectionRecord>,
    diagnostic: bool,
}

/// Serves one accepted session: the handshake first, the controller after.
struct SessionHandler {
    shared: Weak<HostShared>,
    binding: OnceLock<Bound>,
}

#[async_trait]
impl RequestHandler for SessionHandler {
    async fn handle(
        &self,
        session: &Session,
        request: RequestBody,
    ) -> Result<ResponseBody, ResponseError> {
        let Some(shared) = self.shared.upgrade() else {
            return Err(ResponseError::cancelled("host is shutting down").closing());
        };

        if let Some(bound) = self.binding.get() {
            return match request {
                RequestBody::Credentials(_) if bound.diagnostic => Err(ResponseError::client_error(
                    format!("session is already bound to {}", bound.record.credential()),
                )),
                // Diagnostic sessions only receive calls.
                other if bound.diagnostic => Err(ResponseError::not_implemented(other.kind())),
                other => shared.controller.dispatch(&bound.record, other).await,
            };
        }

        let kind = request.kind();
        let RequestBody::Credentials(credentials) = request else {
            return Err(ResponseError::client_error(format!(
                "{kind} before credentials handshake"
            )));
        };
        let bound = shared.handshake(session, credentials)?;
        if self.binding.set(bound).is_err() {
            return Err(ResponseError::client_error("session is already bound"));
        }
        Ok(ResponseBody::Credentials(Empty))
    }
}

/// Listens for workers and invokes them.
pub struct HostServer {
    shared: Arc<HostShared>,
    socket_path: PathBuf,
    events: StdMutex<Option<mpsc::UnboundedReceiver<HostEvent>>>,
    accept: StdMutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for HostServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostServer")
            .field("socket_path", &self.socket_path)
            .field("sessions", &self.shared.sessions.len())
            .field("bound", &self.shared.registry.len())
            .finish()
    }
}

impl HostServer {
    /// Bind the listener and start accepting. Must be called inside a tokio runtime.
    pub fn bind(config: HostConfig) -> Result<Self, HostError> {
        let controller = InvocationController::new(&config)?;
        let listener = HostListener::bind(&config.socket_path).map_err(|source| HostError::Bind {
            path: config.socket_path.clone(),
            source,
        })?;
        let socket_path = listener.path().to_path_buf();

        let (events, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(HostShared {
            timeouts: config.timeouts,
            controller,
            sessions: DashMap::new(),
            registry: ConnectionRegistry::new(),
            namespaces: StdMutex::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
            events,
            keep_alive: AtomicBool::new(config.keep_alive),
            listening: AtomicBool::new(true),
            listener_error: StdMutex::new(None),
            changed: Notify::new(),
            shutdown: CancellationToken::new(),
        });
        let accept = tokio::spawn(accept_loop(
            Arc::downgrade(&shared),
            listener,
            shared.shutdown.clone(),
        ));
        tracing::info!(path = %socket_path.display(), "Host listening");

        Ok(Self {
            shared,
            socket_path,
            events: StdMutex::new(Some(events_rx)),
            accept: StdMutex::new(Some(accept)),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Take the event receiver. Events are buffered from bind on; only the first
    /// call gets the receiver.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<HostEvent>> {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).take()
    }

    pub fn register_credential(&self, credential: impl Into<String>, options: RegisterOptions) {
        let credential = credential.into();
        tracing::debug!(%credential, ?options, "Registered credential");
        self.shared.registry.register(credential, options);
    }

    /// Forget a credential, closing its connection if it has one.
    pub fn unregister_credential(&self, credential: &str) -> bool {
        match self.shared.registry.unregister(credential) {
            Some(record) => {
                self.shared.sessions.remove(&record.session_id());
                self.shared.disconnect(&record, SessionError::Cancelled);
                true
            }
            None => false,
        }
    }

    /// Primary session bound to `credential`.
    pub fn session_for(&self, credential: &str) -> Option<SessionId> {
        self.shared
            .registry
            .record(credential)
            .map(|record| record.session_id())
    }

    pub fn diagnostic_session_for(&self, credential: &str) -> Option<SessionId> {
        self.shared
            .registry
            .record(credential)?
            .diagnostic_session()
            .map(|session| session.id())
    }

    pub fn session_count(&self) -> usize {
        self.shared.sessions.len()
    }

    /// Invoke `method` on the worker bound to `credential`.
    pub async fn trigger(
        &self,
        credential: &str,
        method: &str,
        data: Option<BodySource>,
        metadata: TriggerMetadata,
    ) -> Result<TriggerResult, HostError> {
        let record = self
            .shared
            .registry
            .record(credential)
            .ok_or_else(|| HostError::NotConnected(credential.to_string()))?;
        Ok(self
            .shared
            .controller
            .trigger(&record, method, data, metadata)
            .await?)
    }

    fn session(&self, id: SessionId) -> Result<Session, HostError> {
        self.shared
            .sessions
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(HostError::UnknownSession(id))
    }

    async fn call(
        &self,
        id: SessionId,
        body: RequestBody,
        timeout: Duration,
    ) -> Result<ResponseBody, HostError> {
        Ok(self.session(id)?.request(body, timeout).await?)
    }

    pub async fn push_stream_chunk(
        &self,
        id: SessionId,
        push: StreamPushRequest,
    ) -> Result<(), HostError> {
        let timeout = self.shared.timeouts.stream;
        let response = self.call(id, RequestBody::StreamPush(push), timeout).await?;
        expect_response!(response, StreamPush)?;
        Ok(())
    }

    pub async fn collect_metrics(&self, id: SessionId) -> Result<Vec<IntegerRecord>, HostError> {
        let timeout = self.shared.timeouts.metrics;
        let response = self
            .call(id, RequestBody::CollectMetrics(Empty), timeout)
            .await?;
        Ok(expect_response!(response, CollectMetrics)?.integer_records)
    }

    /// Push a grant notification by hand. Grants from the arbiter are delivered
    /// automatically.
    pub async fn notify_resource(
        &self,
        id: SessionId,
        resource_id: impl Into<String>,
        token: Token,
    ) -> Result<(), HostError> {
        let timeout = self.shared.timeouts.resource_notification;
        let body = RequestBody::ResourceNotification(ResourceNotificationRequest {
            resource_id: resource_id.into(),
            token,
        });
        let response = self.call(id, body, timeout).await?;
        expect_response!(response, ResourceNotification)?;
        Ok(())
    }

    pub async fn inspector_start(&self, id: SessionId) -> Result<(), HostError> {
        let timeout = self.shared.timeouts.diagnostics;
        let response = self
            .call(id, RequestBody::InspectorStart(Empty), timeout)
            .await?;
        expect_response!(response, InspectorStart)?;
        Ok(())
    }

    pub async fn inspector_start_session(&self, id: SessionId) -> Result<(), HostError> {
        let timeout = self.shared.timeouts.diagnostics;
        let response = self
            .call(id, RequestBody::InspectorStartSession(Empty), timeout)
            .await?;
        expect_response!(response, InspectorStartSession)?;
        Ok(())
    }

    pub async fn inspector_command(
        &self,
        id: SessionId,
        message: impl Into<String>,
    ) -> Result<Option<String>, HostError> {
        let timeout = self.shared.timeouts.diagnostics;
        let body = RequestBody::InspectorCommand(InspectorCommandRequest {
            message: message.into(),
        });
        let response = self.call(id, body, timeout).await?;
        Ok(expect_response!(response, InspectorCommand)?.message)
    }

    pub async fn tracing_start(
        &self,
        id: SessionId,
        categories: Vec<String>,
    ) -> Result<(), HostError> {
        let timeout = self.shared.timeouts.diagnostics;
        let body = RequestBody::TracingStart(TracingStartRequest { categories });
        let response = self.call(id, body, timeout).await?;
        expect_response!(response, TracingStart)?;
        Ok(())
    }

    pub async fn tracing_stop(&self, id: SessionId) -> Result<(), HostError> {
        let timeout = self.shared.timeouts.diagnostics;
        let response = self
            .call(id, RequestBody::TracingStop(Empty), timeout)
            .await?;
        expect_response!(response, TracingStop)?;
        Ok(())
    }

    /// Forcibly tear a session down. Its record is cleaned up as for a disconnect.
    pub fn terminate_session(&self, id: SessionId) -> bool {
        match self.shared.sessions.get(&id) {
            Some(entry) => {
                entry.value().close();
                true
            }
            None => false,
        }
    }

    /// Whether live sessions keep [`HostServer::wait`] pending.
    pub fn set_ref(&self, keep_alive: bool) {
        self.shared.keep_alive.store(keep_alive, Ordering::Release);
        self.shared.changed.notify_waiters();
    }

    /// Resolves once the listener has stopped and, while referenced, every session
    /// has ended. Returns the listener failure if that is what stopped it.
    pub async fn wait(&self) -> Result<(), HostError> {
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(e) = self
                .shared
                .listener_error
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .take()
            {
                return Err(e);
            }
            if self.shared.is_idle() {
                return Ok(());
            }
            notified.await;
        }
    }

    /// Stop accepting, close every connection, and remove the socket.
    pub async fn close(&self) {
        self.shared.shutdown.cancel();
        let accept = self.accept.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(accept) = accept
            && let Err(e) = accept.await
        {
            tracing::warn!(error = %e, "Accept task failed");
        }

        for record in self.shared.registry.drain() {
            self.shared.disconnect(&record, SessionError::Cancelled);
        }
        let sessions: Vec<Session> = self
            .shared
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for session in sessions {
            session.close();
        }
        tracing::info!(path = %self.socket_path.display(), "Host closed");
        self.shared.changed.notify_waiters();
    }
}

impl Drop for HostServer {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
        for entry in self.shared.sessions.iter() {
            entry.value().close();
        }
    }
}

async fn accept_loop(
    shared: Weak<HostShared>,
    listener: HostListener,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let Some(shared) = shared.upgrade() else {
            break;
        };
        match accepted {
            Ok(stream) => shared.adopt(stream),
            Err(e) => {
                tracing::error!(path = %listener.path().display(), error = %e, "Listener failed");
                *shared
                    .listener_error
                    .lock()
                    .unwrap_or_else(|p| p.into_inner()) = Some(HostError::Listener(e));
                break;
            }
        }
    }

    drop(listener);
    if let Some(shared) = shared.upgrade() {
        shared.listening.store(false, Ordering::Release);
        shared.changed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{AddressFamily, ResultCode};
    use crate::config::WorkerConfig;
    use crate::worker::{FetchSpec, TriggerContext, TriggerReply, WorkerClient, WorkerError, WorkerHandler};
    use futures::StreamExt;
    use tokio_util::bytes::Bytes;
    use wiremock::matchers::{body_string, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Replies `<method>:<request body>`; answers metrics and inspector commands.
    struct Echo;

    #[async_trait]
    impl WorkerHandler for Echo {
        async fn trigger(&self, ctx: TriggerContext) -> Result<TriggerReply, ResponseError> {
            let input = ctx
                .body
                .read_to_end()
                .await
                .map_err(|e| ResponseError::internal(e.to_string()))?;
            let mut body = format!("{}:", ctx.method).into_bytes();
            body.extend_from_slice(&input);
            Ok(TriggerReply::new(200)
                .with_header("x-echo", "1")
                .with_body(futures::stream::iter([Ok(Bytes::from(body))]).boxed()))
        }

        async fn collect_metrics(&self) -> Result<Vec<IntegerRecord>, ResponseError> {
            Ok(vec![IntegerRecord {
                name: "requests".to_string(),
                value: 3,
                labels: vec![("route".to_string(), "/".to_string())],
            }])
        }

        async fn inspector_command(&self, message: String) -> Result<Option<String>, ResponseError> {
            Ok(Some(format!("ack {message}")))
        }
    }

    fn host_with(config: impl FnOnce(HostConfig) -> HostConfig) -> (tempfile::TempDir, HostServer) {
        let dir = tempfile::tempdir().unwrap();
        let host = HostServer::bind(config(HostConfig::new(dir.path().join("host.sock")))).unwrap();
        (dir, host)
    }

    fn host() -> (tempfile::TempDir, HostServer) {
        host_with(|config| config)
    }

    async fn connect(host: &HostServer, credential: &str) -> Result<WorkerClient, WorkerError> {
        WorkerClient::connect(WorkerConfig::new(host.socket_path(), credential), Arc::new(Echo)).await
    }

    fn body(data: &'static str) -> BodySource {
        futures::stream::iter([Ok(Bytes::from(data))]).boxed()
    }

    #[tokio::test]
    async fn trigger_streams_both_ways() {
        let (_dir, host) = host();
        let mut events = host.events().unwrap();
        host.register_credential("w1", RegisterOptions::default());
        let _worker = connect(&host, "w1").await.unwrap();

        let session = host.session_for("w1").unwrap();
        assert_eq!(
            events.recv().await,
            Some(HostEvent::Bound {
                credential: "w1".to_string(),
                session,
                diagnostic: false,
            })
        );

        let metadata = TriggerMetadata {
            method: Some("POST".to_string()),
            ..Default::default()
        };
        let result = host
            .trigger("w1", "invoke", Some(body("ping")), metadata)
            .await
            .unwrap();
        assert_eq!(result.status, 200);
        assert_eq!(
            result.metadata.headers,
            vec![("x-echo".to_string(), "1".to_string())]
        );
        assert!(result.stream_id.is_some());
        assert_eq!(result.body.read_to_end().await.unwrap(), Bytes::from("invoke:ping"));

        // GET drops the request body.
        let metadata = TriggerMetadata {
            method: Some("GET".to_string()),
            ..Default::default()
        };
        let result = host
            .trigger("w1", "invoke", Some(body("ignored")), metadata)
            .await
            .unwrap();
        assert_eq!(result.body.read_to_end().await.unwrap(), Bytes::from("invoke:"));
    }

    #[tokio::test]
    async fn unknown_credential_is_rejected() {
        let (_dir, host) = host();
        let err = connect(&host, "ghost").await.unwrap_err();
        match err {
            WorkerError::Handshake(SessionError::Remote { code, message, .. }) => {
                assert_eq!(code, ResultCode::ClientError);
                insta::assert_snapshot!(message, @"credential ghost is not registered");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(host.session_for("ghost").is_none());
    }

    #[tokio::test]
    async fn duplicate_handshake_keeps_first_connection() {
        let (_dir, host) = host();
        host.register_credential("w1", RegisterOptions::default());
        let first = connect(&host, "w1").await.unwrap();
        let session = host.session_for("w1").unwrap();

        let err = connect(&host, "w1").await.unwrap_err();
        assert!(matches!(
            err,
            WorkerError::Handshake(SessionError::Remote { code: ResultCode::ClientError, .. })
        ));
        assert_eq!(host.session_for("w1"), Some(session));
        assert!(!first.is_closed());
    }

    #[tokio::test]
    async fn preemptive_handshake_evicts_previous_connection() {
        let (_dir, host) = host();
        let mut events = host.events().unwrap();
        host.register_credential("w1", RegisterOptions::preemptive());

        let first = connect(&host, "w1").await.unwrap();
        let old = host.session_for("w1").unwrap();
        let _second = connect(&host, "w1").await.unwrap();
        let new = host.session_for("w1").unwrap();
        assert_ne!(old, new);

        first.closed().await;
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(events.recv().await.unwrap());
        }
        assert_eq!(
            seen,
            vec![
                HostEvent::Bound {
                    credential: "w1".to_string(),
                    session: old,
                    diagnostic: false,
                },
                HostEvent::Disconnected {
                    credential: "w1".to_string(),
                    session: old,
                },
                HostEvent::Bound {
                    credential: "w1".to_string(),
                    session: new,
                    diagnostic: false,
                },
            ]
        );
    }

    #[tokio::test]
    async fn requests_before_handshake_are_client_errors() {
        struct Idle;
        #[async_trait]
        impl RequestHandler for Idle {
            async fn handle(
                &self,
                _session: &Session,
                request: RequestBody,
            ) -> Result<ResponseBody, ResponseError> {
                Err(ResponseError::not_implemented(request.kind()))
            }
        }

        let (_dir, host) = host();
        host.register_credential("w1", RegisterOptions::default());
        let stream = UnixStream::connect(host.socket_path()).await.unwrap();
        let session = Session::spawn(SessionId::new(0), stream, Arc::new(Idle));

        let err = session
            .request(RequestBody::StreamOpen(Empty), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ResultCode::ClientError);
        insta::assert_snapshot!(err.to_string(), @"CLIENT_ERROR: StreamOpen before credentials handshake");

        // The session stays usable for the handshake.
        let response = session
            .request(
                RequestBody::Credentials(CredentialsRequest {
                    credential: "w1".to_string(),
                    diagnostic: false,
                }),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(response, ResponseBody::Credentials(Empty));
    }

    #[tokio::test]
    async fn silent_connection_is_reaped() {
        let (_dir, host) = host_with(|config| {
            config.with_timeouts(Timeouts {
                handshake: Duration::from_millis(50),
                ..Timeouts::default()
            })
        });
        let mut raw = UnixStream::connect(host.socket_path()).await.unwrap();

        let mut buf = [0u8; 16];
        let read = tokio::io::AsyncReadExt::read(&mut raw, &mut buf).await.unwrap();
        assert_eq!(read, 0);
    }

    #[tokio::test]
    async fn fetch_proxies_through_host() {
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload"))
            .and(body_string("payload"))
            .respond_with(
                ResponseTemplate::new(201)
                    .insert_header("x-upstream", "yes")
                    .set_body_string("stored"),
            )
            .mount(&upstream)
            .await;
        Mock::given(method("GET"))
            .and(path("/empty"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&upstream)
            .await;

        let (_dir, host) = host();
        host.register_credential("w1", RegisterOptions::default());
        let worker = connect(&host, "w1").await.unwrap();

        let spec = FetchSpec::new("POST", format!("{}/upload", upstream.uri()));
        let result = worker.fetch(spec, Some(body("payload"))).await.unwrap();
        assert_eq!(result.status, 201);
        assert!(
            result
                .headers
                .iter()
                .any(|(name, value)| name == "x-upstream" && value == "yes")
        );
        let peer = result.peer.clone().unwrap();
        assert_eq!(peer.address, "127.0.0.1");
        assert_eq!(peer.family, AddressFamily::IPv4);
        assert_eq!(result.body.read_to_end().await.unwrap(), Bytes::from("stored"));

        let spec = FetchSpec::new("GET", format!("{}/empty", upstream.uri()));
        let result = worker.fetch(spec, None).await.unwrap();
        assert_eq!(result.status, 204);
        assert_eq!(result.body.read_to_end().await.unwrap(), Bytes::new());

        // Finished fetches are gone; aborting one is a no-op.
        worker.fetch_abort(result.fetch_id).await.unwrap();
    }

    #[tokio::test]
    async fn fetch_rejects_bad_url() {
        let (_dir, host) = host();
        host.register_credential("w1", RegisterOptions::default());
        let worker = connect(&host, "w1").await.unwrap();

        let err = worker
            .fetch(FetchSpec::new("GET", "not a url"), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WorkerError::Session(SessionError::Remote { code: ResultCode::ClientError, .. })
        ));
    }

    #[tokio::test]
    async fn disconnect_releases_resources_to_waiters() {
        let (_dir, host) = host();
        let pool = RegisterOptions::default().with_namespace("pool");
        host.register_credential("w1", pool.clone());
        host.register_credential("w2", pool);
        let w1 = connect(&host, "w1").await.unwrap();
        let w2 = connect(&host, "w2").await.unwrap();

        let held = w1.acquire_resource("gpu", true).await.unwrap();
        assert!(held.is_exclusive());

        let waiter = tokio::spawn({
            let w2 = w2.clone();
            async move { w2.acquire_resource("gpu", false).await }
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        w1.close();
        let granted = waiter.await.unwrap().unwrap();
        assert_eq!(granted.credential(), "w2");
        assert!(!granted.is_exclusive());

        assert!(w2.release_resource("gpu", granted.clone()).await.unwrap());
        assert!(!w2.release_resource("gpu", granted).await.unwrap());
    }

    #[tokio::test]
    async fn metrics_and_diagnostics() {
        let (_dir, host) = host();
        host.register_credential("w1", RegisterOptions::default());
        let _worker = connect(&host, "w1").await.unwrap();
        let session = host.session_for("w1").unwrap();

        let records = host.collect_metrics(session).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "requests");
        assert_eq!(records[0].value, 3);

        assert_eq!(
            host.inspector_command(session, "Runtime.enable").await.unwrap(),
            Some("ack Runtime.enable".to_string())
        );

        let err = host.tracing_start(session, vec!["v8".to_string()]).await.unwrap_err();
        assert!(matches!(
            err,
            HostError::Session(SessionError::Remote { code: ResultCode::NotImplemented, .. })
        ));

        let diagnostic = WorkerClient::connect(
            WorkerConfig::new(host.socket_path(), "w1").with_diagnostic(true),
            Arc::new(Echo),
        )
        .await
        .unwrap();
        let diagnostic_session = host.diagnostic_session_for("w1").unwrap();
        assert_ne!(diagnostic_session, session);
        host.inspector_start(diagnostic_session).await.unwrap_err();

        // Worker-to-host calls are refused on a diagnostic session.
        let err = diagnostic.stream_open().await.unwrap_err();
        assert!(matches!(
            err,
            WorkerError::Session(SessionError::Remote { code: ResultCode::NotImplemented, .. })
        ));

        assert!(matches!(
            host.collect_metrics(SessionId::new(999)).await,
            Err(HostError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn disconnect_unbinds_credential() {
        let (_dir, host) = host();
        let mut events = host.events().unwrap();
        host.register_credential("w1", RegisterOptions::default());
        let worker = connect(&host, "w1").await.unwrap();
        let session = host.session_for("w1").unwrap();
        assert!(matches!(events.recv().await, Some(HostEvent::Bound { .. })));

        worker.close();
        assert_eq!(
            events.recv().await,
            Some(HostEvent::Disconnected {
                credential: "w1".to_string(),
                session,
            })
        );
        let err = host
            .trigger("w1", "invoke", None, TriggerMetadata::default())
            .await
            .unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"credential w1 is not connected");

        // The credential stays registered for a reconnect.
        let _worker = connect(&host, "w1").await.unwrap();
        assert!(host.session_for("w1").is_some());
    }

    #[tokio::test]
    async fn terminate_and_unregister_close_sessions() {
        let (_dir, host) = host();
        host.register_credential("w1", RegisterOptions::default());
        host.register_credential("w2", RegisterOptions::default());
        let w1 = connect(&host, "w1").await.unwrap();
        let w2 = connect(&host, "w2").await.unwrap();

        assert!(host.terminate_session(host.session_for("w1").unwrap()));
        w1.closed().await;

        assert!(host.unregister_credential("w2"));
        w2.closed().await;
        assert!(!host.unregister_credential("w2"));
        assert!(matches!(
            connect(&host, "w2").await,
            Err(WorkerError::Handshake(_))
        ));
    }

    #[tokio::test]
    async fn close_stops_listener_and_sessions() {
        let (_dir, host) = host();
        host.register_credential("w1", RegisterOptions::default());
        let worker = connect(&host, "w1").await.unwrap();

        host.close().await;
        assert!(!host.socket_path().exists());
        worker.closed().await;
        tokio::time::timeout(Duration::from_secs(5), host.wait())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn unref_host_does_not_wait_for_sessions() {
        let (_dir, host) = host_with(|config| config.with_keep_alive(false));
        host.register_credential("w1", RegisterOptions::default());
        let _worker = connect(&host, "w1").await.unwrap();

        host.shared.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), host.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(host.session_count(), 1);
    }
}
