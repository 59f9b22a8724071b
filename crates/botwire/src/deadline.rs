//! Deadline enforcement for blocking operations.
//!
//! Each connection runs one watchdog task for its whole lifetime. An
//! operation about to block arms the shared [`Deadline`] through
//! [`DeadlineHandle::arm`] and retires it once its I/O completes; the
//! watchdog holds exactly one pending wait against the current value at any
//! moment. When a wake finds the wall clock at or past an armed deadline,
//! the watchdog shuts the socket down (cancellation is connection-wide),
//! flags the connection closed and expired, and resets the deadline to
//! [`Deadline::Never`] so an idle or closed connection causes no further
//! wakeups.
//!
//! The in-flight operation observes the cancellation as an EOF or error on
//! its pending read/write and classifies the outcome by the expired flag.

use std::net::Shutdown;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{self, Instant};
use tracing::{debug, trace};

/// Absolute expiry for the operation in flight, or the sentinel for "no
/// active deadline".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Deadline {
    /// No operation is under a deadline; the watchdog stays parked.
    Never,
    /// The operation in flight expires at this instant.
    At(Instant),
}

impl Deadline {
    /// True if this deadline is armed and `now` has reached it.
    pub(crate) fn is_expired(self, now: Instant) -> bool {
        match self {
            Deadline::Never => false,
            Deadline::At(at) => now >= at,
        }
    }
}

/// Setter side of the shared deadline value.
///
/// All writes go through the watch channel, which atomically supersedes the
/// watchdog's outstanding wait: at most one wait is ever pending against the
/// deadline, and that property is owned here, not by the watchdog loop.
#[derive(Debug)]
pub(crate) struct DeadlineHandle {
    tx: Arc<watch::Sender<Deadline>>,
}

impl DeadlineHandle {
    /// Creates the shared deadline at the infinite sentinel and returns the
    /// setter together with the watchdog's receiver.
    pub(crate) fn new() -> (Self, watch::Receiver<Deadline>) {
        let (tx, rx) = watch::channel(Deadline::Never);
        (Self { tx: Arc::new(tx) }, rx)
    }

    /// Arms the deadline to `now + timeout` for the operation about to
    /// block. A timeout too large to represent is treated as unbounded.
    pub(crate) fn arm(&self, timeout: Duration) {
        let deadline = Instant::now()
            .checked_add(timeout)
            .map_or(Deadline::Never, Deadline::At);
        self.tx.send_replace(deadline);
        trace!(?timeout, "deadline armed");
    }

    /// Retires the deadline after the operation completed; the watchdog
    /// parks until the next arm.
    pub(crate) fn retire(&self) {
        self.tx.send_replace(Deadline::Never);
    }

    /// Second handle to the setter, given to the watchdog so it can reset
    /// the deadline after firing.
    pub(crate) fn sender(&self) -> Arc<watch::Sender<Deadline>> {
        Arc::clone(&self.tx)
    }
}

/// Watchdog task, spawned once per connection on the connection's runtime
/// and polled whenever a blocking call drives it.
///
/// Loop contract:
/// - Parked on the change notification while the deadline is `Never`.
/// - While armed, races the expiry sleep against a deadline change; a change
///   supersedes the wait and the loop re-arms on the new value.
/// - A wake past the deadline re-checks the current value against the wall
///   clock first, so an operation that retired the deadline after the wake
///   was scheduled is not cancelled.
pub(crate) async fn watchdog(
    mut deadline_rx: watch::Receiver<Deadline>,
    deadline_tx: Arc<watch::Sender<Deadline>>,
    expired_tx: watch::Sender<bool>,
    closed: Arc<AtomicBool>,
    socket: Arc<std::net::TcpStream>,
) {
    loop {
        let armed = *deadline_rx.borrow_and_update();
        match armed {
            Deadline::Never => {
                if deadline_rx.changed().await.is_err() {
                    return;
                }
            }
            Deadline::At(at) => {
                tokio::select! {
                    _ = time::sleep_until(at) => {
                        if deadline_rx.borrow().is_expired(Instant::now()) {
                            debug!("deadline expired; shutting connection down");
                            closed.store(true, Ordering::Release);
                            let _ = expired_tx.send(true);
                            // Both directions, so a blocked read or write
                            // completes immediately and the operation
                            // observes the expiry.
                            let _ = socket.shutdown(Shutdown::Both);
                            deadline_tx.send_replace(Deadline::Never);
                        }
                    }
                    changed = deadline_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
