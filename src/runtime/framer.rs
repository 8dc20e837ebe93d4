//! Request framing on the `"42"` terminator.
//!
//! A request is every byte a client sends up to and including the first
//! `'4'` immediately followed by `'2'`. There is no length prefix, so the
//! reader keeps pulling bytes into a growable scratch buffer until the
//! terminator shows up or the peer goes away.
//!
//! ## Buffer growth
//!
//! The scratch buffer starts at `initial_capacity` bytes and doubles every
//! time a read fills it. Without a `max_frame_size` there is no upper bound:
//! a client that never sends the terminator makes the buffer grow for as
//! long as it keeps sending. Set a maximum to cap memory per request.
//!
//! ## Scanning
//!
//! Only bytes that arrived in the latest read are scanned, starting one byte
//! early so a `'4'` at the end of one read pairs with a `'2'` at the start of
//! the next.

use bytes::Bytes;
use std::collections::TryReserveError;
use std::io::{self, Read};
use tracing::{debug, trace};

/// Bytes that end a request.
pub const TERMINATOR: &[u8; 2] = b"42";

/// Default starting size of the scratch buffer.
pub const DEFAULT_INITIAL_CAPACITY: usize = 128;

/// A complete request: everything through the terminator.
///
/// The backing storage carries one trailing NUL after the terminator so the
/// bytes can be handed to C-string consumers as-is. [`len`](Self::len) does
/// not count it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedRequest {
    data: Bytes,
}

impl FramedRequest {
    /// Build from the scratch buffer, where `end` is the index of the
    /// terminator's `'2'`.
    fn from_scratch(scratch: &[u8], end: usize) -> Result<Self, TryReserveError> {
        let mut data = Vec::new();
        data.try_reserve_exact(end + 2)?;
        data.extend_from_slice(&scratch[..=end]);
        data.push(0);
        Ok(Self {
            data: Bytes::from(data),
        })
    }

    /// Request bytes, terminator included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len()]
    }

    /// Request bytes followed by the NUL terminator.
    #[allow(dead_code)]
    pub fn as_bytes_with_nul(&self) -> &[u8] {
        &self.data
    }

    /// Number of meaningful bytes (terminator included, NUL excluded).
    pub fn len(&self) -> usize {
        self.data.len() - 1
    }
}

/// Result of reading one request.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Terminator found.
    Request(FramedRequest),
    /// Peer closed the connection before sending a complete frame.
    Eof,
}

/// Framing failures. All of them abandon the connection.
#[derive(Debug)]
pub enum FrameError {
    /// `read` failed.
    Io(io::Error),
    /// The scratch buffer could not grow.
    Alloc(TryReserveError),
    /// Frame passed the configured maximum without a terminator.
    TooLarge { limit: usize },
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Io(e) => write!(f, "An error occurred while reading from socket: {e}"),
            FrameError::Alloc(e) => write!(f, "Failed to grow request buffer: {e}"),
            FrameError::TooLarge { limit } => {
                write!(f, "Request exceeds maximum frame size of {limit} bytes")
            }
        }
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FrameError::Io(e) => Some(e),
            FrameError::Alloc(e) => Some(e),
            FrameError::TooLarge { .. } => None,
        }
    }
}

/// Reads `"42"`-terminated requests.
#[derive(Debug, Clone, Copy)]
pub struct Framer {
    initial_capacity: usize,
    max_frame_size: Option<usize>,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_CAPACITY, None)
    }
}

impl Framer {
    /// Create a framer. `initial_capacity` is clamped to at least one byte.
    pub fn new(initial_capacity: usize, max_frame_size: Option<usize>) -> Self {
        Self {
            initial_capacity: initial_capacity.max(1),
            max_frame_size,
        }
    }

    pub fn max_frame_size(&self) -> Option<usize> {
        self.max_frame_size
    }

    /// Read from `conn` until the terminator is seen.
    ///
    /// Anything the peer sent after the terminator in the same read is
    /// discarded.
    pub fn read_framed_request<R: Read>(&self, conn: &mut R) -> Result<FrameOutcome, FrameError> {
        let mut capacity = self.initial_capacity;
        // Config rejects limits below the terminator length; a framer built
        // directly with one still gets room for the terminator.
        if let Some(limit) = self.max_frame_size {
            capacity = capacity.min(limit.max(TERMINATOR.len()));
        }

        let mut scratch: Vec<u8> = Vec::new();
        scratch.try_reserve_exact(capacity).map_err(FrameError::Alloc)?;
        scratch.resize(capacity, 0);
        let mut filled = 0;

        loop {
            let n = match conn.read(&mut scratch[filled..]) {
                Ok(0) => {
                    debug!(buffered = filled, "The client disconnected");
                    return Ok(FrameOutcome::Eof);
                }
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(FrameError::Io(e)),
            };

            let scan_from = filled;
            filled += n;
            trace!(read = n, filled, capacity, "Read request bytes");

            if let Some(end) = find_terminator(&scratch[..filled], scan_from) {
                let request =
                    FramedRequest::from_scratch(&scratch, end).map_err(FrameError::Alloc)?;
                debug!(len = request.len(), "Framed request");
                return Ok(FrameOutcome::Request(request));
            }

            if filled == capacity {
                if let Some(limit) = self.max_frame_size {
                    if capacity >= limit {
                        return Err(FrameError::TooLarge { limit });
                    }
                }
                let mut grown = capacity.saturating_mul(2);
                if let Some(limit) = self.max_frame_size {
                    grown = grown.min(limit);
                }
                scratch
                    .try_reserve_exact(grown - capacity)
                    .map_err(FrameError::Alloc)?;
                scratch.resize(grown, 0);
                trace!(from = capacity, to = grown, "Grew request buffer");
                capacity = grown;
            }
        }
    }
}

/// Index of the `'2'` of the first terminator whose `'2'` is at or after
/// `new_from`. The byte just before `new_from` is included in the scan.
fn find_terminator(buf: &[u8], new_from: usize) -> Option<usize> {
    let start = new_from.saturating_sub(1);
    buf[start..]
        .windows(TERMINATOR.len())
        .position(|w| w == TERMINATOR)
        .map(|pos| start + pos + 1)
}
