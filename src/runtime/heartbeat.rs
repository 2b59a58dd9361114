//! Heartbeat channel to the supervising parent.
//!
//! The parent connects to the worker's socket before anything else; that
//! first connection is the heartbeat. The worker writes its PID on it once,
//! then watches it for EOF. The parent never sends messages: closing the
//! channel, or dying, are the only signals.
//!
//! On a fatal error the worker writes the error payload as one JSON line
//! and closes the channel.

use crate::error::{Error, Result};
use crate::runtime::{set_cloexec, SignalFlags};
use mio::net::{UnixListener, UnixStream};
use mio::{Events, Interest, Poll, Registry, Token};
use socket2::SockRef;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const ACCEPT_TOKEN: Token = Token(0);
const SIGNAL_TOKEN: Token = Token(1);

pub struct Heartbeat {
    stream: Option<UnixStream>,
    /// Parent PID captured at startup.
    ppid: u32,
}

impl Heartbeat {
    /// Wait up to `timeout` for the first connection on `listener` and take
    /// it as the heartbeat channel.
    ///
    /// Returns `Ok(None)` if a termination or quit signal arrives first.
    /// The listener is deregistered again before returning.
    pub fn establish(
        listener: &mut UnixListener,
        timeout: Duration,
        ppid: u32,
        signals: &SignalFlags,
    ) -> Result<Option<Self>> {
        let mut poll = Poll::new()?;
        let mut waker = signals.waker()?;
        poll.registry()
            .register(&mut waker, SIGNAL_TOKEN, Interest::READABLE)?;
        poll.registry()
            .register(listener, ACCEPT_TOKEN, Interest::READABLE)?;

        let result = Self::wait_for_parent(&mut poll, listener, timeout, ppid, signals);
        let _ = poll.registry().deregister(listener);
        result
    }

    fn wait_for_parent(
        poll: &mut Poll,
        listener: &UnixListener,
        timeout: Duration,
        ppid: u32,
        signals: &SignalFlags,
    ) -> Result<Option<Self>> {
        let mut events = Events::with_capacity(4);
        let deadline = Instant::now() + timeout;
        loop {
            if signals.terminate_requested() || signals.quit_requested() {
                info!("Stop requested before heartbeat connected");
                return Ok(None);
            }

            match listener.accept() {
                Ok((stream, _)) => {
                    set_cloexec(&stream)?;
                    info!(ppid, "Heartbeat connected");
                    return Ok(Some(Self::from_stream(stream, ppid)));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::HeartbeatTimeout(timeout));
            }
            match poll.poll(&mut events, Some(deadline - now)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Wrap an already connected, non-blocking stream.
    pub fn from_stream(stream: UnixStream, ppid: u32) -> Self {
        Self {
            stream: Some(stream),
            ppid,
        }
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Write `"<pid>\n"` to the parent.
    pub fn announce(&mut self) -> io::Result<()> {
        let pid = std::process::id();
        self.write_line(&pid.to_string())?;
        debug!(pid, "Announced worker pid");
        Ok(())
    }

    pub fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        match self.stream.as_mut() {
            Some(stream) => registry.register(stream, token, Interest::READABLE),
            None => Ok(()),
        }
    }

    pub fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self.stream.as_mut() {
            Some(stream) => registry.deregister(stream),
            None => Ok(()),
        }
    }

    /// Drain readable bytes. Returns true once the parent has closed the
    /// channel (or it broke).
    pub fn poll_eof(&mut self) -> bool {
        let Some(stream) = self.stream.as_mut() else {
            return true;
        };

        let mut buf = [0u8; 256];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => return true,
                Ok(n) => debug!(bytes = n, "Ignoring heartbeat input"),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return false,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!(error = %e, "Heartbeat read failed");
                    return true;
                }
            }
        }
    }

    /// Orphan detection: has our parent changed since startup?
    pub fn parent_changed(&self) -> bool {
        std::os::unix::process::parent_id() != self.ppid
    }

    /// Send a fatal error to the parent and close the channel.
    ///
    /// Returns false if the channel was already unusable, in which case the
    /// caller must surface the error itself.
    pub fn report_fatal(&mut self, err: &Error) -> bool {
        if !self.is_open() {
            return false;
        }
        let reported = self.write_line(&err.to_payload().to_json()).is_ok();
        self.close();
        reported
    }

    /// Close the channel. Idempotent.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
            debug!("Heartbeat closed");
        }
    }

    /// Blocking write of one line, then back to non-blocking.
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        let mut stream = self
            .stream
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "heartbeat closed"))?;

        let socket = SockRef::from(stream);
        socket.set_nonblocking(false)?;
        let result = stream
            .write_all(format!("{line}\n").as_bytes())
            .and_then(|()| stream.flush());
        socket.set_nonblocking(true)?;
        result
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.close();
    }
}
