//! The deadline-supervised blocking connection to a remote device.
//!
//! [`DeviceConnection`] wraps one TCP connection and gives every blocking
//! line operation a hard upper bound: the operation arms the connection's
//! deadline, issues its I/O, and drives the connection's event loop until
//! the I/O completes or the watchdog shuts the socket down (see the
//! `deadline` module).
//!
//! Architecture:
//! - Each connection owns a current-thread Tokio runtime; a blocking call
//!   enters it with `block_on`, which drives the operation future and the
//!   watchdog task on one loop.
//! - The watchdog cancels by shutting the socket down, so cancellation is
//!   connection-wide. One operation may be in flight at a time, enforced by
//!   the operation lock (`try_lock`, failing fast with [`WireError::Busy`]).
//! - A timeout, I/O, or framing failure poisons the connection: the socket
//!   is shut down and every later call fails with [`WireError::Closed`]
//!   until the caller reconnects.

use std::net::{Shutdown, SocketAddr, TcpStream as StdTcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::deadline::{self, DeadlineHandle};
use crate::diag::diag;
#[cfg(feature = "diagnostics")]
use crate::diag::SessionLog;
use crate::error::WireError;
use crate::framing::{self, LineBuffer, LINE_DELIMITER};

/// Options for establishing a [`DeviceConnection`].
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Overall budget for the whole establish, shared across all resolved
    /// endpoints. `None` leaves connecting unbounded.
    pub connect_timeout: Option<Duration>,
    /// Disable Nagle's algorithm on the device socket. Command lines are
    /// short and latency-sensitive; defaults to `true`.
    pub nodelay: bool,
    /// Capacity hint for the input buffer and the per-read scratch buffer.
    pub read_buffer_capacity: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: None,
            nodelay: true,
            read_buffer_capacity: 4096,
        }
    }
}

/// A blocking, deadline-supervised TCP connection to a remote device.
///
/// Line operations take a caller-supplied timeout enforced by the
/// connection's watchdog; [`send`](Self::send) and
/// [`receive_serial`](Self::receive_serial) are deliberately untimed, as
/// serial passthrough carries no latency contract. The connection is
/// single-flight: an operation issued while another is in flight fails with
/// [`WireError::Busy`] instead of queuing; a deadline expiry cancels the
/// whole connection, not one operation.
///
/// Methods block the calling thread and must not be called from inside an
/// async runtime. Dropping the connection closes the socket and stops the
/// watchdog.
#[derive(Debug)]
pub struct DeviceConnection {
    /// Operation lock; `try_lock` is the single-flight guard.
    inner: Mutex<Inner>,
    /// Second handle to the connection's socket so `close()` can shut it
    /// down without taking the operation lock.
    socket: Arc<StdTcpStream>,
    /// Set by `close()`, by the watchdog on expiry, or by a poisoning
    /// failure.
    closed: Arc<AtomicBool>,
    peer: SocketAddr,
}

#[derive(Debug)]
struct Inner {
    /// Per-connection event loop; drives the in-flight operation and the
    /// watchdog together.
    rt: Runtime,
    stream: Option<TcpStream>,
    buf: LineBuffer,
    scratch: Vec<u8>,
    deadline: DeadlineHandle,
    /// Latched true by the watchdog when a deadline fires; distinguishes a
    /// timeout from an ordinary I/O failure on the cancelled operation.
    expired: watch::Receiver<bool>,
    closed: Arc<AtomicBool>,
    socket: Arc<StdTcpStream>,
    #[cfg(feature = "diagnostics")]
    log: Option<SessionLog>,
}

impl DeviceConnection {
    /// Connects with [`ConnectOptions::default`]: endpoints are tried in
    /// resolver order with no connect deadline.
    ///
    /// `service` is a decimal port string; named services are not resolved.
    pub fn connect(host: &str, service: &str) -> Result<Self, WireError> {
        Self::connect_with(host, service, ConnectOptions::default())
    }

    /// Connects with explicit options.
    pub fn connect_with(
        host: &str,
        service: &str,
        options: ConnectOptions,
    ) -> Result<Self, WireError> {
        let endpoints = resolve(host, service)?;
        let std_stream = establish(host, service, &endpoints, options.connect_timeout)?;

        let peer = std_stream
            .peer_addr()
            .map_err(|e| connect_error(host, service, e))?;
        std_stream
            .set_nodelay(options.nodelay)
            .map_err(|e| connect_error(host, service, e))?;
        std_stream
            .set_nonblocking(true)
            .map_err(|e| connect_error(host, service, e))?;
        let socket = Arc::new(
            std_stream
                .try_clone()
                .map_err(|e| connect_error(host, service, e))?,
        );

        let rt = Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()
            .map_err(|e| connect_error(host, service, e))?;
        let stream = {
            let _guard = rt.enter();
            TcpStream::from_std(std_stream).map_err(|e| connect_error(host, service, e))?
        };

        let (deadline, deadline_rx) = DeadlineHandle::new();
        let (expired_tx, expired_rx) = watch::channel(false);
        let closed = Arc::new(AtomicBool::new(false));

        // Polled whenever a blocking call drives the runtime; dropped with it.
        rt.spawn(deadline::watchdog(
            deadline_rx,
            deadline.sender(),
            expired_tx,
            Arc::clone(&closed),
            Arc::clone(&socket),
        ));

        info!("device connection established to {peer}");

        #[cfg(feature = "diagnostics")]
        let log = match SessionLog::open("device-connection") {
            Ok(log) => Some(log),
            Err(e) => {
                warn!("session diagnostics unavailable: {e}");
                None
            }
        };
        diag!(log, "connected to {peer}");

        Ok(Self {
            inner: Mutex::new(Inner {
                rt,
                stream: Some(stream),
                buf: LineBuffer::with_capacity(options.read_buffer_capacity),
                scratch: vec![0u8; options.read_buffer_capacity.max(1)],
                deadline,
                expired: expired_rx,
                closed: Arc::clone(&closed),
                socket: Arc::clone(&socket),
                #[cfg(feature = "diagnostics")]
                log,
            }),
            socket,
            closed,
            peer,
        })
    }

    /// Reads one line frame, blocking for at most `timeout`.
    ///
    /// Returns the line with the delimiter stripped; bytes past the
    /// delimiter stay buffered for the next read, and a line already
    /// buffered is served without touching the socket. On deadline expiry
    /// the connection is shut down and the call fails with
    /// [`WireError::Timeout`]; partial data is discarded, never returned.
    pub fn read_line(&self, timeout: Duration) -> Result<String, WireError> {
        let mut inner = self.lock_for_op()?;
        diag!(inner.log, "read_line timeout={timeout:?}");
        inner.read_line(timeout)
    }

    /// Writes `text` followed by the line delimiter, blocking for at most
    /// `timeout` until the whole frame is handed to the socket.
    pub fn write_line(&self, text: &str, timeout: Duration) -> Result<(), WireError> {
        let mut inner = self.lock_for_op()?;
        diag!(inner.log, "write_line len={} timeout={timeout:?}", text.len());
        inner.write_line(text, timeout)
    }

    /// Writes raw bytes with a single untimed write attempt and returns the
    /// number of bytes the socket accepted.
    ///
    /// Short writes surface to the caller, which owns the retry policy; the
    /// call never loops to completion on its own.
    pub fn send(&self, bytes: &[u8]) -> Result<usize, WireError> {
        let mut inner = self.lock_for_op()?;
        diag!(inner.log, "send len={}", bytes.len());
        inner.send(bytes)
    }

    /// Reads one serial passthrough line, untimed, and returns it with every
    /// occurrence of the escape marker removed.
    pub fn receive_serial(&self) -> Result<Vec<u8>, WireError> {
        let mut inner = self.lock_for_op()?;
        diag!(inner.log, "receive_serial");
        inner.receive_serial()
    }

    /// Closes the connection. Idempotent; never fails.
    ///
    /// Does not take the operation lock, so it is callable while an
    /// operation is in flight; that operation fails with an I/O-level
    /// error. Every later operation fails with [`WireError::Closed`].
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("connection to {} closed", self.peer);
        }
        // Repeated shutdowns report NotConnected; close stays silent.
        let _ = self.socket.shutdown(Shutdown::Both);
    }

    /// True until the connection is closed by [`close`](Self::close), a
    /// deadline expiry, or a poisoning failure.
    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    /// Address of the connected device endpoint.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Single-flight guard: fails fast instead of queuing behind the
    /// operation already in flight.
    fn lock_for_op(&self) -> Result<MutexGuard<'_, Inner>, WireError> {
        match self.inner.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::WouldBlock) => Err(WireError::Busy),
            Err(TryLockError::Poisoned(_)) => Err(WireError::Closed),
        }
    }
}

impl Inner {
    fn read_line(&mut self, timeout: Duration) -> Result<String, WireError> {
        self.ensure_open()?;
        self.deadline.arm(timeout);
        let outcome = self.fill_until_delimiter();
        self.deadline.retire();

        match outcome {
            Ok(frame) => match String::from_utf8(frame) {
                Ok(line) => {
                    trace!("line received ({} bytes)", line.len());
                    Ok(line)
                }
                Err(_) => {
                    self.poison();
                    Err(WireError::Frame("line frame is not valid UTF-8".into()))
                }
            },
            Err(e) => Err(self.classify(e, Some(timeout))),
        }
    }

    fn write_line(&mut self, text: &str, timeout: Duration) -> Result<(), WireError> {
        self.ensure_open()?;
        let Some(stream) = self.stream.as_mut() else {
            return Err(WireError::Closed);
        };
        let mut frame = Vec::with_capacity(text.len() + 1);
        frame.extend_from_slice(text.as_bytes());
        frame.push(LINE_DELIMITER);

        self.deadline.arm(timeout);
        let outcome = self.rt.block_on(stream.write_all(&frame));
        self.deadline.retire();

        match outcome {
            Ok(()) => {
                trace!("line written ({} bytes)", frame.len());
                Ok(())
            }
            Err(e) => Err(self.classify(e, Some(timeout))),
        }
    }

    fn send(&mut self, bytes: &[u8]) -> Result<usize, WireError> {
        self.ensure_open()?;
        let Some(stream) = self.stream.as_mut() else {
            return Err(WireError::Closed);
        };

        match self.rt.block_on(stream.write(bytes)) {
            Ok(written) => {
                trace!("raw send accepted {written} of {} bytes", bytes.len());
                Ok(written)
            }
            Err(e) => Err(self.classify(e, None)),
        }
    }

    fn receive_serial(&mut self) -> Result<Vec<u8>, WireError> {
        self.ensure_open()?;
        match self.fill_until_delimiter() {
            Ok(mut line) => {
                framing::strip_escape_markers(&mut line);
                trace!("serial line received ({} bytes)", line.len());
                Ok(line)
            }
            Err(e) => Err(self.classify(e, None)),
        }
    }

    /// Gate at the top of every operation: a closed or poisoned connection
    /// fails before arming the deadline or touching the socket.
    fn ensure_open(&self) -> Result<(), WireError> {
        if self.closed.load(Ordering::Acquire) || self.stream.is_none() {
            return Err(WireError::Closed);
        }
        Ok(())
    }

    /// Drives the event loop until the input buffer yields one frame.
    ///
    /// Stream end before a delimiter surfaces as `UnexpectedEof`, which
    /// [`classify`](Self::classify) maps to a framing or timeout error.
    fn fill_until_delimiter(&mut self) -> Result<Vec<u8>, std::io::Error> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "connection already closed",
            ));
        };
        let buf = &mut self.buf;
        let scratch = &mut self.scratch;

        self.rt.block_on(async {
            loop {
                if let Some(frame) = buf.take_frame() {
                    return Ok(frame);
                }
                let n = stream.read(scratch.as_mut_slice()).await?;
                if n == 0 {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "stream ended before the line delimiter",
                    ));
                }
                buf.extend(&scratch[..n]);
            }
        })
    }

    /// Maps a failed drive to the public error and poisons the connection.
    ///
    /// Deadline expiry dominates: the watchdog's shutdown surfaces as an EOF
    /// or I/O error on the in-flight read or write, so the expired flag, not
    /// the error kind, decides whether this was a timeout. An EOF produced
    /// by a concurrent `close()` is an I/O failure, not a framing violation
    /// by the peer.
    fn classify(&mut self, error: std::io::Error, armed: Option<Duration>) -> WireError {
        let expired = *self.expired.borrow();
        let closed = self.closed.load(Ordering::Acquire);
        self.poison();
        match armed {
            Some(timeout) if expired => {
                debug!("operation cancelled by deadline after {timeout:?}");
                WireError::Timeout { timeout }
            }
            _ if error.kind() == std::io::ErrorKind::UnexpectedEof && closed => {
                WireError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionAborted,
                    "connection closed while the operation was in flight",
                ))
            }
            _ if error.kind() == std::io::ErrorKind::UnexpectedEof => {
                WireError::Frame(error.to_string())
            }
            _ => WireError::Io(error),
        }
    }

    /// Hard-closes after a failed operation; every later call sees
    /// [`WireError::Closed`].
    fn poison(&mut self) {
        self.closed.store(true, Ordering::Release);
        let _ = self.socket.shutdown(Shutdown::Both);
        self.stream = None;
        self.buf.clear();
    }
}

fn connect_error(host: &str, service: &str, source: std::io::Error) -> WireError {
    WireError::Connect {
        host: host.to_string(),
        service: service.to_string(),
        source,
    }
}

/// Resolves `host:service` to candidate endpoints in resolver order.
fn resolve(host: &str, service: &str) -> Result<Vec<SocketAddr>, WireError> {
    let authority = format!("{host}:{service}");
    let endpoints: Vec<SocketAddr> = authority
        .to_socket_addrs()
        .map_err(|e| connect_error(host, service, e))?
        .collect();
    if endpoints.is_empty() {
        return Err(WireError::NoAddresses {
            host: host.to_string(),
            service: service.to_string(),
        });
    }
    debug!("resolved {authority} to {} endpoint(s)", endpoints.len());
    Ok(endpoints)
}

/// Attempts each endpoint in resolver order, optionally under one shared
/// budget across all attempts. Returns the last attempt's error when every
/// endpoint fails.
fn establish(
    host: &str,
    service: &str,
    endpoints: &[SocketAddr],
    connect_timeout: Option<Duration>,
) -> Result<StdTcpStream, WireError> {
    let started = Instant::now();
    let mut last_err: Option<std::io::Error> = None;

    for addr in endpoints {
        let attempt = match connect_timeout {
            None => StdTcpStream::connect(addr),
            Some(budget) => {
                let remaining = match budget.checked_sub(started.elapsed()) {
                    Some(r) if !r.is_zero() => r,
                    _ => break,
                };
                StdTcpStream::connect_timeout(addr, remaining)
            }
        };
        match attempt {
            Ok(stream) => {
                trace!("endpoint {addr} accepted");
                return Ok(stream);
            }
            Err(e) => {
                warn!("endpoint {addr} attempt failed: {e}");
                last_err = Some(e);
            }
        }
    }

    let source = last_err.unwrap_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "connect budget exhausted before any endpoint accepted",
        )
    });
    Err(connect_error(host, service, source))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
