//! Connection lifecycle: binds a worker credential to its session and owns
//! everything that must be torn down with it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::StreamId;
use crate::resource::{ResourceArbiter, Token};
use crate::session::{ResponseError, Session, SessionError, SessionId};
use crate::stream::{ByteStream, Closing, InboundStreams, StreamError};

/// How a credential may connect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterOptions {
    /// A second handshake evicts the current connection instead of being rejected.
    pub preemptive: bool,
    /// Resource namespace; defaults to the credential itself.
    pub namespace: Option<String>,
}

impl RegisterOptions {
    pub fn preemptive() -> Self {
        Self {
            preemptive: true,
            namespace: None,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn namespace_for<'a>(&'a self, credential: &'a str) -> &'a str {
        self.namespace.as_deref().unwrap_or(credential)
    }
}

#[derive(Default)]
struct StateInner {
    closing: bool,
    outbound: HashMap<StreamId, CancellationToken>,
    fetches: HashMap<u32, CancellationToken>,
    /// Held or queued token -> resource id.
    tokens: HashMap<Token, String>,
}

/// What [`WorkerState::close`] tore down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloseSummary {
    pub inbound: usize,
    pub outbound: usize,
    pub fetches: usize,
    pub tokens: usize,
}

/// Per-connection bookkeeping of streams, fetches and resource tokens.
///
/// Once closing, nothing new can be added: every `track_*`/`add_*` call fails.
pub struct WorkerState {
    credential: String,
    inbound: InboundStreams,
    inner: StdMutex<StateInner>,
}

impl WorkerState {
    pub fn new(credential: impl Into<String>) -> Self {
        Self {
            credential: credential.into(),
            inbound: InboundStreams::strict(),
            inner: StdMutex::new(StateInner::default()),
        }
    }

    fn inner(&self) -> MutexGuard<'_, StateInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn credential(&self) -> &str {
        &self.credential
    }

    pub fn inbound(&self) -> &InboundStreams {
        &self.inbound
    }

    pub fn is_closing(&self) -> bool {
        self.inner().closing
    }

    pub fn ensure_open(&self) -> Result<(), Closing> {
        if self.is_closing() { Err(Closing) } else { Ok(()) }
    }

    pub fn open_inbound(&self, stream_id: StreamId) -> Result<ByteStream, Closing> {
        self.ensure_open()?;
        self.inbound.register(stream_id)
    }

    /// Track an outbound stream; the returned token fires when the connection closes.
    pub fn track_outbound(&self, stream_id: StreamId) -> Result<CancellationToken, Closing> {
        let mut inner = self.inner();
        if inner.closing {
            return Err(Closing);
        }
        let token = CancellationToken::new();
        inner.outbound.insert(stream_id, token.clone());
        Ok(token)
    }

    pub fn untrack_outbound(&self, stream_id: StreamId) {
        self.inner().outbound.remove(&stream_id);
    }

    /// Track an in-flight fetch by its caller-supplied id.
    pub fn track_fetch(&self, fetch_id: u32) -> Result<CancellationToken, ResponseError> {
        let mut inner = self.inner();
        if inner.closing {
            return Err(Closing.into());
        }
        if inner.fetches.contains_key(&fetch_id) {
            return Err(ResponseError::client_error(format!(
                "fetch {fetch_id} is already in flight"
            )));
        }
        let token = CancellationToken::new();
        inner.fetches.insert(fetch_id, token.clone());
        Ok(token)
    }

    pub fn untrack_fetch(&self, fetch_id: u32) {
        self.inner().fetches.remove(&fetch_id);
    }

    /// Cancel a tracked fetch. Returns false if it already finished.
    pub fn abort_fetch(&self, fetch_id: u32) -> bool {
        match self.inner().fetches.remove(&fetch_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn add_token(&self, resource_id: &str, token: Token) -> Result<(), Closing> {
        let mut inner = self.inner();
        if inner.closing {
            return Err(Closing);
        }
        inner.tokens.insert(token, resource_id.to_string());
        Ok(())
    }

    /// Forget a token; returns the resource it belonged to.
    pub fn remove_token(&self, token: &Token) -> Option<String> {
        self.inner().tokens.remove(token)
    }

    pub fn holds(&self, token: &Token) -> bool {
        self.inner().tokens.contains_key(token)
    }

    pub fn token_count(&self) -> usize {
        self.inner().tokens.len()
    }

    /// Destroy every stream and fetch with "peer closed" and release all tokens.
    pub fn close(&self, arbiter: &ResourceArbiter) -> CloseSummary {
        let (outbound, fetches, tokens) = {
            let mut inner = self.inner();
            inner.closing = true;
            (
                std::mem::take(&mut inner.outbound),
                std::mem::take(&mut inner.fetches),
                std::mem::take(&mut inner.tokens),
            )
        };

        let inbound = self.inbound.close(StreamError::PeerClosed);
        for token in outbound.values().chain(fetches.values()) {
            token.cancel();
        }

        let mut grouped: HashMap<String, Vec<Token>> = HashMap::new();
        let token_count = tokens.len();
        for (token, resource_id) in tokens {
            grouped.entry(resource_id).or_default().push(token);
        }
        arbiter.release_all(grouped);

        let summary = CloseSummary {
            inbound,
            outbound: outbound.len(),
            fetches: fetches.len(),
            tokens: token_count,
        };
        tracing::debug!(credential = %self.credential, ?summary, "Worker state closed");
        summary
    }
}

/// One bound credential: its sessions, resource namespace and worker state.
pub struct ConnectionRecord {
    credential: String,
    session: Session,
    diagnostic: StdMutex<Option<Session>>,
    preemptive: bool,
    arbiter: ResourceArbiter,
    closed: AtomicBool,
    state: WorkerState,
}

impl std::fmt::Debug for ConnectionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRecord")
            .field("credential", &self.credential)
            .field("session", &self.session.id())
            .field("preemptive", &self.preemptive)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ConnectionRecord {
    pub fn new(
        credential: impl Into<String>,
        session: Session,
        preemptive: bool,
        arbiter: ResourceArbiter,
    ) -> Self {
        let credential = credential.into();
        Self {
            state: WorkerState::new(credential.clone()),
            credential,
            session,
            diagnostic: StdMutex::new(None),
            preemptive,
            arbiter,
            closed: AtomicBool::new(false),
        }
    }

    pub fn credential(&self) -> &str {
        &self.credential
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_id(&self) -> SessionId {
        self.session.id()
    }

    pub fn is_preemptive(&self) -> bool {
        self.preemptive
    }

    pub fn arbiter(&self) -> &ResourceArbiter {
        &self.arbiter
    }

    pub fn state(&self) -> &WorkerState {
        &self.state
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn diagnostic_session(&self) -> Option<Session> {
        self.diagnostic
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Attach a diagnostic session, replacing (and closing) a previous one.
    fn attach_diagnostic(&self, session: Session) {
        let previous = self
            .diagnostic
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .replace(session);
        if let Some(previous) = previous {
            previous.close();
        }
    }

    fn detach_diagnostic(&self, session_id: SessionId) -> bool {
        let mut diagnostic = self.diagnostic.lock().unwrap_or_else(|p| p.into_inner());
        if diagnostic.as_ref().is_some_and(|s| s.id() == session_id) {
            *diagnostic = None;
            true
        } else {
            false
        }
    }

    /// Terminate the sessions with `reason`, then tear the worker state down.
    /// Only the first call has an effect.
    pub fn close(&self, reason: SessionError) -> Option<CloseSummary> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return None;
        }
        self.session.terminate(reason.clone());
        if let Some(diagnostic) = self
            .diagnostic
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            diagnostic.terminate(reason);
        }
        Some(self.state.close(&self.arbiter))
    }
}

/// Outcome of a successful handshake.
#[derive(Debug)]
pub struct Binding {
    pub record: Arc<ConnectionRecord>,
    /// Previous connection evicted by a preemptive handshake; the caller closes it.
    pub evicted: Option<Arc<ConnectionRecord>>,
    pub diagnostic: bool,
}

/// What happened when a session went away.
#[derive(Debug)]
pub enum Unbound {
    /// The primary session ended; the record is no longer bound.
    Primary(Arc<ConnectionRecord>),
    Diagnostic { credential: String },
}

#[derive(Default)]
struct RegistryInner {
    registrations: HashMap<String, RegisterOptions>,
    records: HashMap<String, Arc<ConnectionRecord>>,
    sessions: HashMap<SessionId, String>,
}

/// Known credentials and their live connections.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: StdMutex<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn register(&self, credential: impl Into<String>, options: RegisterOptions) {
        self.inner().registrations.insert(credential.into(), options);
    }

    /// Forget a credential, returning its live record for the caller to close.
    pub fn unregister(&self, credential: &str) -> Option<Arc<ConnectionRecord>> {
        let mut inner = self.inner();
        inner.registrations.remove(credential);
        let record = inner.records.remove(credential)?;
        inner.sessions.retain(|_, c| c != credential);
        Some(record)
    }

    pub fn registration(&self, credential: &str) -> Option<RegisterOptions> {
        self.inner().registrations.get(credential).cloned()
    }

    /// Bind `session` to `credential`. `namespace` resolves the arbiter of the
    /// credential's namespace. Rejections carry the closing flag: the session that
    /// presented them is not allowed to stay open.
    pub fn bind(
        &self,
        credential: &str,
        session: Session,
        diagnostic: bool,
        namespace: impl FnOnce(&str) -> ResourceArbiter,
    ) -> Result<Binding, ResponseError> {
        let mut inner = self.inner();
        let Some(options) = inner.registrations.get(credential).cloned() else {
            return Err(
                ResponseError::client_error(format!("credential {credential} is not registered"))
                    .closing(),
            );
        };

        if diagnostic {
            let Some(record) = inner.records.get(credential).cloned() else {
                return Err(ResponseError::client_error(format!(
                    "credential {credential} has no connection to attach to"
                ))
                .closing());
            };
            inner.sessions.insert(session.id(), credential.to_string());
            record.attach_diagnostic(session);
            return Ok(Binding {
                record,
                evicted: None,
                diagnostic: true,
            });
        }

        let evicted = match inner.records.get(credential) {
            Some(existing) if !existing.is_closed() && !options.preemptive => {
                return Err(ResponseError::client_error(format!(
                    "credential {credential} is already connected"
                ))
                .closing());
            }
            Some(_) => {
                let evicted = inner.records.remove(credential);
                inner.sessions.retain(|_, c| c != credential);
                evicted
            }
            None => None,
        };

        let arbiter = namespace(options.namespace_for(credential));
        let record = Arc::new(ConnectionRecord::new(
            credential,
            session.clone(),
            options.preemptive,
            arbiter,
        ));
        inner.sessions.insert(session.id(), credential.to_string());
        inner
            .records
            .insert(credential.to_string(), Arc::clone(&record));
        Ok(Binding {
            record,
            evicted,
            diagnostic: false,
        })
    }

    /// Detach a closed session. A primary session unbinds its whole record.
    pub fn unbind_session(&self, session_id: SessionId) -> Option<Unbound> {
        let mut inner = self.inner();
        let credential = inner.sessions.remove(&session_id)?;
        let record = Arc::clone(inner.records.get(&credential)?);
        if record.session_id() == session_id {
            inner.records.remove(&credential);
            inner.sessions.retain(|_, c| *c != credential);
            Some(Unbound::Primary(record))
        } else if record.detach_diagnostic(session_id) {
            Some(Unbound::Diagnostic { credential })
        } else {
            None
        }
    }

    pub fn record(&self, credential: &str) -> Option<Arc<ConnectionRecord>> {
        self.inner().records.get(credential).cloned()
    }

    pub fn record_for_session(&self, session_id: SessionId) -> Option<Arc<ConnectionRecord>> {
        let inner = self.inner();
        let credential = inner.sessions.get(&session_id)?;
        inner.records.get(credential).cloned()
    }

    /// Remove every record, for shutdown.
    pub fn drain(&self) -> Vec<Arc<ConnectionRecord>> {
        let mut inner = self.inner();
        inner.sessions.clear();
        inner.records.drain().map(|(_, record)| record).collect()
    }

    pub fn len(&self) -> usize {
        self.inner().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
