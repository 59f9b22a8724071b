//! Line framing and the serial escape convention.
//!
//! The device speaks a line-oriented text protocol: frames are terminated by
//! [`LINE_DELIMITER`]. Serial passthrough lines may additionally embed the
//! two-byte [`SERIAL_ESCAPE`] marker, which is stripped before a line is
//! handed to the caller.
//!
//! [`LineBuffer`] is the connection's input buffer, shared by the line and
//! serial channels: socket reads append to it, and a frame read consumes one
//! delimiter-terminated prefix, leaving the remainder buffered for the next
//! call. Bytes pass through in arrival order, exactly once.

/// Frame delimiter for the line-oriented text protocol.
pub const LINE_DELIMITER: u8 = b'\n';

/// Escape marker embedded in serial passthrough lines: byte `0x01` followed
/// by `'U'`. Every occurrence is stripped before delivery.
pub const SERIAL_ESCAPE: [u8; 2] = [0x01, b'U'];

/// Accumulating input buffer for delimiter-terminated frames.
#[derive(Debug)]
pub struct LineBuffer {
    data: Vec<u8>,
}

impl LineBuffer {
    /// Creates an empty buffer with the given capacity hint.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    /// Appends bytes read from the socket.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Takes one complete frame off the front of the buffer, or `None` if no
    /// delimiter has arrived yet.
    ///
    /// The returned frame excludes the delimiter; the delimiter itself and
    /// everything before it are drained, and any bytes after it stay
    /// buffered in order.
    pub fn take_frame(&mut self) -> Option<Vec<u8>> {
        let pos = self.data.iter().position(|&b| b == LINE_DELIMITER)?;
        let frame = self.data[..pos].to_vec();
        self.data.drain(..=pos);
        Some(frame)
    }

    /// Number of buffered bytes not yet consumed by a frame read.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when no bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Discards all buffered bytes. Used when the connection is poisoned;
    /// partial data from a failed operation is never delivered.
    pub fn clear(&mut self) {
        self.data.clear();
    }
}

/// Removes every occurrence of [`SERIAL_ESCAPE`] from `line` in place.
///
/// Single left-to-right pass: bytes that become adjacent after a removal are
/// not rescanned, so `[0x01, 0x01, b'U', b'U']` keeps the literal
/// `[0x01, b'U']` that the removal exposes.
pub fn strip_escape_markers(line: &mut Vec<u8>) {
    let mut write = 0;
    let mut read = 0;
    while read < line.len() {
        if line[read..].starts_with(&SERIAL_ESCAPE) {
            read += SERIAL_ESCAPE.len();
            continue;
        }
        line[write] = line[read];
        write += 1;
        read += 1;
    }
    line.truncate(write);
}

// ── Tests ─────────────────────────────────────────────────────────────────────
