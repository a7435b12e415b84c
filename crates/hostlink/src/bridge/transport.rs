//! Unix domain socket transport for host-worker IPC.
//!
//! The host binds one listener; every worker opens one duplex connection to it.
//! Framing is transport-agnostic, so sessions accept any AsyncRead + AsyncWrite.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::{UnixListener, UnixStream};

/// Host-side listener. Removes its socket file on drop.
#[derive(Debug)]
pub struct HostListener {
    path: PathBuf,
    listener: UnixListener,
}

impl HostListener {
    /// Bind at `path`, replacing a stale socket file left by a previous host.
    pub fn bind(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)?;
        }
        if path.exists() {
            std::fs::remove_file(&path)?;
        }

        let listener = UnixListener::bind(&path)?;
        tracing::debug!(path = %path.display(), "Bound host socket");
        Ok(Self { path, listener })
    }

    pub async fn accept(&self) -> io::Result<UnixStream> {
        let (stream, _) = self.listener.accept().await?;
        Ok(stream)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for HostListener {
    fn drop(&mut self) {
        if self.path.exists()
            && let Err(e) = std::fs::remove_file(&self.path)
        {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to cleanup host socket");
        }
    }
}

/// Connect from the worker side, retrying while the host listener comes up.
pub async fn connect(path: &Path, retries: u32, delay: Duration) -> io::Result<UnixStream> {
    let mut attempt = 0;
    loop {
        match UnixStream::connect(path).await {
            Ok(stream) => {
                tracing::trace!(path = %path.display(), attempt, "Connected to host socket");
                return Ok(stream);
            }
            Err(e) if attempt < retries && is_retryable(&e) => {
                attempt += 1;
                tracing::debug!(path = %path.display(), attempt, error = %e, "Host socket not ready, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn is_retryable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
    )
}
