//! ```text
//! ======================================================================
//!                                 GOALS
//! ======================================================================
//! ```
//!
//! 1. A termination signal never kills a running command abruptly
//! 2. The shutdown request reaches every holder of the lifecycle context
//! 3. Cancellation happens at most once and is never reversed
//!
//! ```text
//! ======================================================================
//!                             BUILDING BLOCKS
//! ======================================================================
//! ```
//!
//! 1. `LifecycleContext`
//! - Read-only view on the process lifecycle, cloned into every handler.
//! Handlers `select!` on `.cancelled()` or poll `.is_cancelled()`.
//!
//! 2. `CancelTrigger`
//! - The single write end. Not `Clone`, and `.cancel()` consumes it, so the
//! transition not-cancelled -> cancelled can only be requested once.
//!
//! 3. The signal bridge
//! - One background task that waits for the first SIGINT/SIGTERM, logs it and
//! fires the trigger. It does not loop: later signals are ignored.
use futures::future::BoxFuture;
use std::fmt;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{instrument, instrument::WithSubscriber};

/// Shared cancellation token handed to the dispatcher and every handler.
#[derive(Debug, Clone)]
pub struct LifecycleContext {
    token: CancellationToken,
}

/// Exclusive write end of a [`LifecycleContext`].
#[derive(Debug)]
pub struct CancelTrigger {
    token: CancellationToken,
}

impl LifecycleContext {
    /// Creates a fresh, not-cancelled context together with its only trigger.
    #[instrument(
        name = "parquet_tsdb_lifecycle_context",
        target = "helpers::shutdown",
        level = "trace"
    )]
    pub fn new() -> (Self, CancelTrigger) {
        tracing::trace!("Creating lifecycle context");
        let token = CancellationToken::new();
        (
            Self {
                token: token.clone(),
            },
            CancelTrigger { token },
        )
    }

    /// Returns `true` once shutdown has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes when shutdown has been requested. Completes immediately if it
    /// already was.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Token for APIs that speak `tokio_util` directly. Child tokens are
    /// cancelled with the context but cannot cancel it.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }
}

impl CancelTrigger {
    /// Cancels the associated context. Consumes the trigger.
    #[instrument(
        name = "parquet_tsdb_lifecycle_cancel",
        target = "helpers::shutdown",
        level = "trace",
        skip_all
    )]
    pub fn cancel(self) {
        tracing::trace!("Cancelling lifecycle context");
        self.token.cancel();
    }
}

/// Termination signals the bridge listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGINT, or Ctrl-C on non-unix targets.
    Interrupt,
    /// SIGTERM.
    Terminate,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownSignal::Interrupt => f.write_str("interrupt"),
            ShutdownSignal::Terminate => f.write_str("terminated"),
        }
    }
}

/// Future resolving to the first termination signal, or `None` when the source
/// can no longer deliver one.
pub type SignalSource = BoxFuture<'static, Option<ShutdownSignal>>;

/// Registers SIGINT and SIGTERM handlers with the OS.
///
/// Registration happens here, synchronously, so that once this returns no
/// signal can be missed even if the returned future is polled later.
#[cfg(unix)]
pub fn os_signals() -> std::io::Result<SignalSource> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    Ok(Box::pin(async move {
        tokio::select! {
            Some(()) = sigterm.recv() => Some(ShutdownSignal::Terminate),
            Some(()) = sigint.recv() => Some(ShutdownSignal::Interrupt),
            else => None,
        }
    }))
}

/// Registers the Ctrl-C handler with the OS.
#[cfg(not(unix))]
pub fn os_signals() -> std::io::Result<SignalSource> {
    Ok(Box::pin(async move {
        tokio::signal::ctrl_c()
            .await
            .ok()
            .map(|()| ShutdownSignal::Interrupt)
    }))
}

/// Signal source fed from a single-slot channel, for embedding and tests.
#[must_use]
pub fn channel_signals() -> (mpsc::Sender<ShutdownSignal>, SignalSource) {
    let (tx, mut rx) = mpsc::channel(1);
    (tx, Box::pin(async move { rx.recv().await }))
}

/// Spawns the shutdown signal bridge.
///
/// The task waits for `source` to yield, logs the signal and cancels the
/// context through `trigger`, then exits. It never waits for a second signal.
/// The join handle resolves to the signal that was acted upon.
pub fn spawn_signal_bridge(
    source: SignalSource,
    trigger: CancelTrigger,
) -> JoinHandle<Option<ShutdownSignal>> {
    tracing::debug!("Arming shutdown signal bridge");

    let bridge = async move {
        match source.await {
            Some(signal) => {
                tracing::warn!(signal = %signal, "Caught signal, canceling context");
                trigger.cancel();
                Some(signal)
            }
            None => {
                tracing::debug!("Signal source closed before any signal arrived");
                None
            }
        }
    };

    tokio::spawn(bridge.with_current_subscriber())
}
