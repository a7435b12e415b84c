//! Host and worker configuration.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::invocation::adaptor::{RemoteAdaptor, SideChannelAdaptor};
use crate::metering::{Meter, NoopMeter};

/// Default per-kind request timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub handshake: Duration,
    pub invoke: Duration,
    /// Stream open and every chunk push.
    pub stream: Duration,
    pub metrics: Duration,
    pub resource_notification: Duration,
    pub side_channel: Duration,
    /// Inspector and tracing calls.
    pub diagnostics: Duration,
    /// Fetch, fetch abort, remote invoke and remote binding.
    pub fetch: Duration,
    /// How long an active resource batch may be held before it is force-released.
    pub acquisition: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            handshake: Duration::from_secs(5),
            invoke: Duration::from_secs(10),
            stream: Duration::from_secs(30),
            metrics: Duration::from_secs(2),
            resource_notification: Duration::from_secs(2),
            side_channel: Duration::from_secs(10),
            diagnostics: Duration::from_secs(60),
            fetch: Duration::from_secs(10),
            acquisition: Duration::from_secs(10),
        }
    }
}

/// Idle time after which an upstream fetch is abandoned.
pub const DEFAULT_FETCH_IDLE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct HostConfig {
    pub socket_path: PathBuf,
    pub timeouts: Timeouts,
    pub fetch_idle_timeout: Duration,
    pub meter: Arc<dyn Meter>,
    pub remote_adaptor: Option<Arc<dyn RemoteAdaptor>>,
    pub side_channels: HashMap<String, Arc<dyn SideChannelAdaptor>>,
    /// Whether live sessions keep [`crate::host::HostServer::wait`] pending.
    pub keep_alive: bool,
}

impl std::fmt::Debug for HostConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostConfig")
            .field("socket_path", &self.socket_path)
            .field("timeouts", &self.timeouts)
            .field("fetch_idle_timeout", &self.fetch_idle_timeout)
            .field("remote_adaptor", &self.remote_adaptor.is_some())
            .field("side_channels", &self.side_channels.keys().collect::<Vec<_>>())
            .field("keep_alive", &self.keep_alive)
            .finish()
    }
}

impl HostConfig {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeouts: Timeouts::default(),
            fetch_idle_timeout: DEFAULT_FETCH_IDLE_TIMEOUT,
            meter: Arc::new(NoopMeter),
            remote_adaptor: None,
            side_channels: HashMap::new(),
            keep_alive: true,
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_fetch_idle_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_idle_timeout = timeout;
        self
    }

    pub fn with_meter(mut self, meter: Arc<dyn Meter>) -> Self {
        self.meter = meter;
        self
    }

    pub fn with_remote_adaptor(mut self, adaptor: Arc<dyn RemoteAdaptor>) -> Self {
        self.remote_adaptor = Some(adaptor);
        self
    }

    pub fn with_side_channel(
        mut self,
        name: impl Into<String>,
        adaptor: Arc<dyn SideChannelAdaptor>,
    ) -> Self {
        self.side_channels.insert(name.into(), adaptor);
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub socket_path: PathBuf,
    pub credential: String,
    /// Attach as the diagnostic session of an already-connected credential.
    pub diagnostic: bool,
    pub timeouts: Timeouts,
    pub connect_retries: u32,
    pub connect_retry_delay: Duration,
}

impl WorkerConfig {
    pub fn new(socket_path: impl Into<PathBuf>, credential: impl Into<String>) -> Self {
        Self {
            socket_path: socket_path.into(),
            credential: credential.into(),
            diagnostic: false,
            timeouts: Timeouts::default(),
            connect_retries: 20,
            connect_retry_delay: Duration::from_millis(50),
        }
    }

    pub fn with_diagnostic(mut self, diagnostic: bool) -> Self {
        self.diagnostic = diagnostic;
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_connect_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.connect_retries = retries;
        self.connect_retry_delay = delay;
        self
    }
}
