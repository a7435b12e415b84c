use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::stub::{AcquireOutcome, ResourceStub, Transition};
use super::Token;

/// Notifications produced by the arbiter, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceEvent {
    /// Waiters promoted to active. Each owner should be told about its grant.
    Granted {
        resource_id: String,
        grants: Vec<Token>,
    },
    /// The active batch outlived the acquisition timeout and was force-released.
    TimedOut {
        resource_id: String,
        released: Vec<Token>,
    },
    /// Nothing active or waiting; the stub was evicted.
    Idle { resource_id: String },
}

/// Point-in-time view of one stub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubSnapshot {
    pub exclusive: bool,
    pub active: Vec<Token>,
    pub waiting: Vec<Token>,
}

struct StubEntry {
    stub: ResourceStub,
    /// Deadline the running timer task was armed for.
    timer: Option<(Instant, JoinHandle<()>)>,
}

struct ArbiterInner {
    name: String,
    timeout: Duration,
    sequence: AtomicU64,
    stubs: StdMutex<HashMap<String, StubEntry>>,
    events: mpsc::UnboundedSender<ResourceEvent>,
}

impl Drop for ArbiterInner {
    fn drop(&mut self) {
        let stubs = self.stubs.get_mut().unwrap_or_else(|p| p.into_inner());
        for (_, handle) in stubs.values_mut().filter_map(|entry| entry.timer.take()) {
            handle.abort();
        }
    }
}

/// Registry of resource stubs for one namespace.
///
/// Stubs are created on first acquisition and evicted as soon as they go idle.
/// Every stub with an active batch has exactly one timer task, which holds only a
/// weak reference back to the arbiter.
#[derive(Clone)]
pub struct ResourceArbiter {
    inner: Arc<ArbiterInner>,
}

impl std::fmt::Debug for ResourceArbiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceArbiter")
            .field("name", &self.inner.name)
            .field("stubs", &self.len())
            .finish()
    }
}

impl ResourceArbiter {
    pub fn new(
        name: impl Into<String>,
        timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<ResourceEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let arbiter = Self {
            inner: Arc::new(ArbiterInner {
                name: name.into(),
                timeout,
                sequence: AtomicU64::new(1),
                stubs: StdMutex::new(HashMap::new()),
                events,
            }),
        };
        (arbiter, rx)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn stubs(&self) -> MutexGuard<'_, HashMap<String, StubEntry>> {
        self.inner.stubs.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn acquire(&self, resource_id: &str, exclusive: bool, credential: &str) -> AcquireOutcome {
        let sequence = self.inner.sequence.fetch_add(1, Ordering::Relaxed);
        let mut stubs = self.stubs();
        let entry = stubs
            .entry(resource_id.to_string())
            .or_insert_with(|| StubEntry {
                stub: ResourceStub::new(resource_id, self.inner.timeout),
                timer: None,
            });
        let outcome = entry
            .stub
            .acquire(exclusive, credential, sequence, Instant::now());
        self.rearm(resource_id, entry);

        tracing::debug!(
            namespace = %self.inner.name,
            resource_id,
            token = %outcome.token(),
            acquired = outcome.is_acquired(),
            "Resource acquisition"
        );
        outcome
    }

    /// Release one token. Returns whether it was active or waiting.
    pub fn release(&self, resource_id: &str, token: &Token) -> bool {
        !self
            .cleanup(resource_id, std::slice::from_ref(token))
            .is_empty()
    }

    /// Release a batch of tokens of one resource; returns those actually held.
    pub fn cleanup(&self, resource_id: &str, tokens: &[Token]) -> Vec<Token> {
        let mut stubs = self.stubs();
        let Some(entry) = stubs.get_mut(resource_id) else {
            return Vec::new();
        };
        let transition = entry.stub.release(tokens, Instant::now());
        let released = transition.released.clone();
        self.apply(&mut stubs, resource_id, transition);
        released
    }

    /// Release tokens grouped by resource, as left behind by a closed connection.
    pub fn release_all(&self, tokens: HashMap<String, Vec<Token>>) -> usize {
        tokens
            .into_iter()
            .map(|(resource_id, tokens)| self.cleanup(&resource_id, &tokens).len())
            .sum()
    }

    pub fn snapshot(&self, resource_id: &str) -> Option<StubSnapshot> {
        self.stubs().get(resource_id).map(|entry| StubSnapshot {
            exclusive: entry.stub.is_exclusive(),
            active: entry.stub.active().to_vec(),
            waiting: entry.stub.waiting().cloned().collect(),
        })
    }

    /// Number of live (non-idle) stubs.
    pub fn len(&self) -> usize {
        self.stubs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn expire(&self, resource_id: &str) {
        let mut stubs = self.stubs();
        let Some(entry) = stubs.get_mut(resource_id) else {
            return;
        };
        let Some(transition) = entry.stub.expire(Instant::now()) else {
            return;
        };
        // This runs on the timer task itself; detach it instead of aborting.
        entry.timer = None;

        if !transition.released.is_empty() {
            tracing::warn!(
                namespace = %self.inner.name,
                resource_id,
                released = transition.released.len(),
                "Acquisition timeout, force-releasing active holders"
            );
            self.emit(ResourceEvent::TimedOut {
                resource_id: resource_id.to_string(),
                released: transition.released.clone(),
            });
        }
        self.apply(&mut stubs, resource_id, transition);
    }

    fn apply(
        &self,
        stubs: &mut HashMap<String, StubEntry>,
        resource_id: &str,
        transition: Transition,
    ) {
        if !transition.granted.is_empty() {
            self.emit(ResourceEvent::Granted {
                resource_id: resource_id.to_string(),
                grants: transition.granted,
            });
        }
        if transition.idle {
            if let Some((_, handle)) = stubs.remove(resource_id).and_then(|entry| entry.timer) {
                handle.abort();
            }
            tracing::trace!(namespace = %self.inner.name, resource_id, "Evicting idle resource");
            self.emit(ResourceEvent::Idle {
                resource_id: resource_id.to_string(),
            });
        } else if let Some(entry) = stubs.get_mut(resource_id) {
            self.rearm(resource_id, entry);
        }
    }

    /// Keep the entry's timer task in line with the stub's deadline.
    fn rearm(&self, resource_id: &str, entry: &mut StubEntry) {
        let deadline = entry.stub.deadline();
        if entry.timer.as_ref().map(|(at, _)| *at) == deadline {
            return;
        }
        if let Some((_, handle)) = entry.timer.take() {
            handle.abort();
        }
        let Some(deadline) = deadline else {
            return;
        };

        let weak: Weak<ArbiterInner> = Arc::downgrade(&self.inner);
        let resource_id = resource_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = weak.upgrade() {
                ResourceArbiter { inner }.expire(&resource_id);
            }
        });
        entry.timer = Some((deadline, handle));
    }

    fn emit(&self, event: ResourceEvent) {
        if self.inner.events.send(event).is_err() {
            tracing::trace!(namespace = %self.inner.name, "Resource event receiver dropped");
        }
    }
}
