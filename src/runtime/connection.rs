//! Client connection state machine and the registry that owns it.
//!
//! Each connection serves exactly one request:
//!
//! ```text
//! Reading --(peer EOF)--> Writing --(response flushed)--> removed
//! ```
//!
//! The registry also owns every pending request buffer and enforces the
//! per-connection and process-wide buffering limits.

use crate::config::Limits;
use bytes::{Bytes, BytesMut};
use slab::Slab;

/// Current state of a connection.
#[derive(Debug)]
pub enum ConnState {
    /// Accumulating the request until the peer half-closes.
    Reading { buf: BytesMut },
    /// Sending the encoded response.
    Writing { out: Bytes, written: usize },
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection<S> {
    pub stream: S,
    pub state: ConnState,
}

impl<S> Connection<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            state: ConnState::Reading {
                buf: BytesMut::new(),
            },
        }
    }

    pub fn is_reading(&self) -> bool {
        matches!(self.state, ConnState::Reading { .. })
    }

    /// Remaining response bytes, if writing.
    pub fn pending_output(&self) -> Option<&[u8]> {
        match &self.state {
            ConnState::Writing { out, written } => Some(&out[*written..]),
            ConnState::Reading { .. } => None,
        }
    }
}

/// Buffering limit that a read would exceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitExceeded {
    Connection(usize),
    Process(usize),
}

impl LimitExceeded {
    pub fn limit(self) -> usize {
        match self {
            LimitExceeded::Connection(n) | LimitExceeded::Process(n) => n,
        }
    }
}

/// Registry of active connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations. Slab keys double as
/// readiness tokens.
pub struct ConnectionRegistry<S> {
    connections: Slab<Connection<S>>,
    max_connections: usize,
    max_request_bytes: usize,
    max_buffered_bytes: usize,
    /// Bytes held in `Reading` buffers across all connections.
    buffered: usize,
}

impl<S> ConnectionRegistry<S> {
    pub fn new(limits: &Limits) -> Self {
        Self {
            connections: Slab::with_capacity(limits.max_connections.min(1024)),
            max_connections: limits.max_connections,
            max_request_bytes: limits.max_request_bytes,
            max_buffered_bytes: limits.max_buffered_bytes,
            buffered: 0,
        }
    }

    /// Insert a new connection in the reading state.
    ///
    /// Returns the stream back if the registry is at capacity.
    pub fn insert(&mut self, stream: S) -> Result<usize, S> {
        if self.connections.len() >= self.max_connections {
            return Err(stream);
        }
        Ok(self.connections.insert(Connection::new(stream)))
    }

    pub fn get(&self, id: usize) -> Option<&Connection<S>> {
        self.connections.get(id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection<S>> {
        self.connections.get_mut(id)
    }

    /// Append read bytes to a connection's request buffer.
    pub fn append(&mut self, id: usize, data: &[u8]) -> Result<(), LimitExceeded> {
        let Some(conn) = self.connections.get_mut(id) else {
            return Ok(());
        };
        let ConnState::Reading { buf } = &mut conn.state else {
            return Ok(());
        };

        if buf.len() + data.len() > self.max_request_bytes {
            return Err(LimitExceeded::Connection(self.max_request_bytes));
        }
        if self.buffered + data.len() > self.max_buffered_bytes {
            return Err(LimitExceeded::Process(self.max_buffered_bytes));
        }

        buf.extend_from_slice(data);
        self.buffered += data.len();
        Ok(())
    }

    /// Stop reading: release the request buffer and return its contents.
    ///
    /// The connection waits in the writing state with nothing to send
    /// until [`respond`](Self::respond) supplies the response.
    pub fn take_request(&mut self, id: usize) -> Option<Bytes> {
        let conn = self.connections.get_mut(id)?;
        if !conn.is_reading() {
            return None;
        }
        let previous = std::mem::replace(
            &mut conn.state,
            ConnState::Writing {
                out: Bytes::new(),
                written: 0,
            },
        );
        match previous {
            ConnState::Reading { buf } => {
                self.buffered -= buf.len();
                Some(buf.freeze())
            }
            ConnState::Writing { .. } => None,
        }
    }

    /// Queue the encoded response for a connection that stopped reading.
    pub fn respond(&mut self, id: usize, out: Bytes) {
        if let Some(conn) = self.connections.get_mut(id) {
            if !conn.is_reading() {
                conn.state = ConnState::Writing { out, written: 0 };
            }
        }
    }

    /// Record `n` more response bytes as sent. Returns true when done.
    pub fn advance(&mut self, id: usize, n: usize) -> bool {
        match self.connections.get_mut(id).map(|c| &mut c.state) {
            Some(ConnState::Writing { out, written }) => {
                *written = (*written + n).min(out.len());
                *written == out.len()
            }
            _ => false,
        }
    }

    pub fn remove(&mut self, id: usize) -> Option<Connection<S>> {
        let conn = self.connections.try_remove(id)?;
        if let ConnState::Reading { buf } = &conn.state {
            self.buffered -= buf.len();
        }
        Some(conn)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Total bytes currently buffered for requests.
    pub fn buffered(&self) -> usize {
        self.buffered
    }
}
