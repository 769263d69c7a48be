//! OS signal translation for orchestrator and worker processes.
//!
//! SIGINT, SIGTERM and SIGQUIT cancel the process's shutdown token. In the
//! orchestrator role SIGCHLD additionally wakes the reap loop.

use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Which side of the process tree a handler serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Orchestrator,
    Worker,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Orchestrator => write!(f, "orchestrator"),
            Self::Worker => write!(f, "worker"),
        }
    }
}

/// Shutdown token plus child-event wakeups, optionally fed by OS signals.
pub struct SignalHandler {
    role: Role,
    shutdown: CancellationToken,
    child_event: Arc<Notify>,
    listener: Option<JoinHandle<()>>,
}

impl SignalHandler {
    /// Start listening for OS signals. Must be called inside a runtime.
    /// Registration failures are logged; the handler still works for
    /// programmatic shutdown.
    pub fn install(role: Role, shutdown: CancellationToken) -> Self {
        let mut handler = Self::detached(role, shutdown);
        let token = handler.shutdown.clone();
        let child_event = handler.child_event.clone();
        handler.listener = Some(tokio::spawn(async move {
            if let Err(e) = listen(role, token, child_event).await {
                tracing::error!(role = %role, "Signal listener failed: {}", e);
            }
        }));
        handler
    }

    /// Same surface without any OS listener.
    pub fn detached(role: Role, shutdown: CancellationToken) -> Self {
        Self {
            role,
            shutdown,
            child_event: Arc::new(Notify::new()),
            listener: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Request shutdown as if a terminate signal arrived.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Record a child state change. A wakeup is stored when nobody waits.
    pub fn notify_child_event(&self) {
        self.child_event.notify_one();
    }

    /// Resolves on the next child state change.
    pub async fn child_event(&self) {
        self.child_event.notified().await;
    }
}

impl Drop for SignalHandler {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

impl std::fmt::Debug for SignalHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalHandler")
            .field("role", &self.role)
            .field("shutdown", &self.shutdown.is_cancelled())
            .field("listening", &self.listener.is_some())
            .finish()
    }
}

#[cfg(unix)]
async fn listen(
    role: Role,
    shutdown: CancellationToken,
    child_event: Arc<Notify>,
) -> std::io::Result<()> {
    use tokio::signal::unix::{Signal, SignalKind, signal};

    async fn next_child(sigchld: &mut Option<Signal>) -> Option<()> {
        match sigchld {
            Some(s) => s.recv().await,
            None => std::future::pending().await,
        }
    }

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;
    let mut sigchld = match role {
        Role::Orchestrator => Some(signal(SignalKind::child())?),
        Role::Worker => None,
    };

    loop {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
            _ = sigquit.recv() => "SIGQUIT",
            Some(()) = next_child(&mut sigchld) => {
                tracing::debug!(role = %role, "Received SIGCHLD");
                child_event.notify_one();
                continue;
            }
        };
        if shutdown.is_cancelled() {
            tracing::debug!(role = %role, signal = name, "Shutdown already in progress");
        } else {
            tracing::info!(role = %role, signal = name, "Received terminate signal, shutting down");
            shutdown.cancel();
        }
    }
}

#[cfg(not(unix))]
async fn listen(
    role: Role,
    shutdown: CancellationToken,
    _child_event: Arc<Notify>,
) -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    tracing::info!(role = %role, "Received Ctrl-C, shutting down");
    shutdown.cancel();
    Ok(())
}
