//! Single-threaded readiness runtime.
//!
//! - `Reactor`: mio event loop over the listener, heartbeat and clients
//! - `ConnectionRegistry`: per-connection state and request buffers
//! - `Heartbeat`: control channel to the supervising parent
//! - `handler`: decode, dispatch and encode for one request

mod connection;
pub mod event_loop;
pub mod handler;
pub mod heartbeat;

pub(crate) use connection::{ConnectionRegistry, LimitExceeded};
pub use event_loop::Reactor;
pub use heartbeat::Heartbeat;

use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};
use socket2::SockRef;
use std::io::{self, Read, Write};
use std::os::unix::io::AsFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Why the reactor stopped. Every variant is an orderly shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// The parent closed the heartbeat channel.
    HeartbeatClosed,
    /// The parent process changed (it died and we were reparented).
    Orphaned,
    /// Listener and heartbeat closed, no clients left.
    Drained,
    /// SIGTERM or SIGINT.
    Terminated,
}

/// Signal flags checked by the reactor on every wakeup.
///
/// SIGTERM and SIGINT request an immediate exit. SIGQUIT requests a drain:
/// stop accepting, close the heartbeat, finish in-flight requests.
///
/// Every request also writes a byte to a socket pair so a blocked readiness
/// wait returns at once; pollers watch the read end via [`waker`](Self::waker).
#[derive(Debug, Clone)]
pub struct SignalFlags {
    terminate: Arc<AtomicBool>,
    quit: Arc<AtomicBool>,
    wake_rx: Arc<UnixStream>,
    wake_tx: Arc<UnixStream>,
}

impl SignalFlags {
    /// Flags with a wakeup pipe but no process signal handlers.
    pub fn new() -> io::Result<Self> {
        let (wake_rx, wake_tx) = UnixStream::pair()?;
        wake_rx.set_nonblocking(true)?;
        wake_tx.set_nonblocking(true)?;
        Ok(Self {
            terminate: Arc::new(AtomicBool::new(false)),
            quit: Arc::new(AtomicBool::new(false)),
            wake_rx: Arc::new(wake_rx),
            wake_tx: Arc::new(wake_tx),
        })
    }

    /// Install process signal handlers that set these flags and wake pollers.
    pub fn register() -> io::Result<Self> {
        let flags = Self::new()?;
        for signal in [SIGTERM, SIGINT] {
            signal_hook::flag::register(signal, Arc::clone(&flags.terminate))?;
        }
        signal_hook::flag::register(SIGQUIT, Arc::clone(&flags.quit))?;
        // Registered after the flags so the flag is set before the wakeup.
        for signal in [SIGTERM, SIGINT, SIGQUIT] {
            signal_hook::low_level::pipe::register(signal, flags.wake_tx.try_clone()?)?;
        }
        Ok(flags)
    }

    pub fn terminate(&self) {
        self.terminate.store(true, Ordering::SeqCst);
        self.wake();
    }

    pub fn quit(&self) {
        self.quit.store(true, Ordering::SeqCst);
        self.wake();
    }

    pub fn terminate_requested(&self) -> bool {
        self.terminate.load(Ordering::SeqCst)
    }

    /// Whether a quit is pending, without consuming it.
    pub fn quit_requested(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }

    /// Consume a pending quit request.
    pub fn take_quit(&self) -> bool {
        self.quit.swap(false, Ordering::SeqCst)
    }

    /// A pollable handle on the wakeup pipe. Readable after any request.
    pub fn waker(&self) -> io::Result<mio::net::UnixStream> {
        Ok(mio::net::UnixStream::from_std(self.wake_rx.try_clone()?))
    }

    /// Discard pending wakeup bytes.
    pub fn drain(waker: &mut mio::net::UnixStream) {
        let mut buf = [0u8; 64];
        loop {
            match waker.read(&mut buf) {
                Ok(0) => return,
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => return,
            }
        }
    }

    fn wake(&self) {
        // A full pipe already guarantees a wakeup.
        let _ = (&*self.wake_tx).write(&[1]);
    }
}

/// Mark a socket close-on-exec.
pub(crate) fn set_cloexec<S: AsFd>(socket: &S) -> io::Result<()> {
    SockRef::from(socket).set_cloexec(true)
}
