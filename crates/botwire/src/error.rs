//! Error types for the transport layer.
//!
//! Every fallible operation on a [`DeviceConnection`] returns [`WireError`].
//! The variants fall into four failure classes (connection establishment and
//! use-after-close, deadline expiry, transport I/O, and framing violations)
//! plus the [`WireError::Busy`] rejection issued by the single-flight guard.
//!
//! A `Timeout`, `Io`, or `Frame` failure poisons the connection: the socket
//! is shut down and every later operation fails with [`WireError::Closed`]
//! until the caller reconnects.
//!
//! [`DeviceConnection`]: crate::connection::DeviceConnection

use std::time::Duration;

use thiserror::Error;

/// Errors produced by the transport layer.
#[derive(Debug, Error)]
pub enum WireError {
    /// Resolution failed, or every candidate endpoint refused or errored.
    #[error("failed to connect to {host}:{service}: {source}")]
    Connect {
        host: String,
        service: String,
        #[source]
        source: std::io::Error,
    },

    /// Host/service resolution succeeded but produced no candidate endpoints.
    #[error("no addresses resolved for {host}:{service}")]
    NoAddresses { host: String, service: String },

    /// The connection is closed: either `close()` was called or a previous
    /// timeout, I/O, or framing failure shut it down.
    #[error("connection is closed")]
    Closed,

    /// The deadline elapsed before the operation completed. The watchdog has
    /// shut the connection down; it must be reopened with a fresh connect.
    #[error("operation timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// A read or write failed for a reason other than deadline expiry,
    /// e.g. the peer reset the connection.
    #[error("connection I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed framing: the stream ended before a line delimiter arrived,
    /// or a line frame was not valid UTF-8.
    #[error("framing error: {0}")]
    Frame(String),

    /// Another operation is already in flight on this connection. The
    /// connection itself is still usable; retry once the other call returns.
    #[error("another operation is in flight on this connection")]
    Busy,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
