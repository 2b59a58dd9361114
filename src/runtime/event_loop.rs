//! mio event loop.
//!
//! Readiness-based model: poll tells us when sockets are ready, then we
//! perform non-blocking accept/read/write syscalls. Everything runs on one
//! thread; a request is decoded, dispatched and encoded without yielding
//! once its bytes are fully buffered.
//!
//! Watched sources:
//! - the listening socket (until closed by a drain),
//! - the heartbeat channel (until closed by a drain),
//! - every client connection, readable while buffering the request and
//!   writable while sending the response,
//! - the signal wakeup pipe.
//!
//! The wait is bounded so parent liveness is re-checked even when idle.

use crate::app::Application;
use crate::config::Limits;
use crate::error::{Error, Result};
use crate::runtime::{
    handler, set_cloexec, ConnectionRegistry, Heartbeat, LimitExceeded, Shutdown, SignalFlags,
};
use crate::server::ListenSocket;
use bytes::Bytes;
use mio::net::UnixStream;
use mio::{Events, Interest, Poll, Token};
use std::io::{self, Read, Write};
use std::net::Shutdown as HalfClose;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const HEARTBEAT_TOKEN: Token = Token(usize::MAX - 1);
const SIGNAL_TOKEN: Token = Token(usize::MAX - 2);

const EVENTS_CAPACITY: usize = 256;

/// The worker's event loop. Borrows the lifecycle-owned sockets so they are
/// cleaned up by their owner however the loop ends.
pub struct Reactor<'a> {
    poll: Poll,
    listen: &'a mut ListenSocket,
    heartbeat: &'a mut Heartbeat,
    app: &'a mut dyn Application,
    connections: ConnectionRegistry<UnixStream>,
    limits: Limits,
    poll_timeout: Duration,
    signals: SignalFlags,
    waker: UnixStream,
    read_buf: Vec<u8>,
}

impl<'a> Reactor<'a> {
    pub fn new(
        listen: &'a mut ListenSocket,
        heartbeat: &'a mut Heartbeat,
        app: &'a mut dyn Application,
        limits: Limits,
        poll_timeout: Duration,
        signals: SignalFlags,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;

        if let Some(listener) = listen.listener_mut() {
            poll.registry()
                .register(listener, LISTENER_TOKEN, Interest::READABLE)?;
        }
        heartbeat.register(poll.registry(), HEARTBEAT_TOKEN)?;

        let mut waker = signals.waker()?;
        poll.registry()
            .register(&mut waker, SIGNAL_TOKEN, Interest::READABLE)?;

        Ok(Self {
            poll,
            listen,
            heartbeat,
            app,
            connections: ConnectionRegistry::new(&limits),
            read_buf: vec![0u8; limits.read_chunk_size],
            limits,
            poll_timeout,
            signals,
            waker,
        })
    }

    /// Run until a shutdown condition fires.
    ///
    /// Errors returned here are fatal for the worker; per-request failures
    /// are answered to their client and never escape.
    pub fn run(&mut self) -> Result<Shutdown> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        info!(
            max_connections = self.limits.max_connections,
            max_request_bytes = self.limits.max_request_bytes,
            poll_timeout = ?self.poll_timeout,
            "Reactor started"
        );

        loop {
            match self.poll.poll(&mut events, Some(self.poll_timeout)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => events.clear(),
                Err(e) => {
                    debug!(error = %e, "Readiness wait failed");
                    events.clear();
                }
            }

            if let Some(reason) = self.check_liveness() {
                if !self.connections.is_empty() {
                    info!(
                        discarded = self.connections.len(),
                        "Dropping in-flight connections"
                    );
                }
                return Ok(reason);
            }

            for event in events.iter() {
                match event.token() {
                    HEARTBEAT_TOKEN => {
                        if self.heartbeat.is_open() && self.heartbeat.poll_eof() {
                            info!("Heartbeat closed by parent");
                            return Ok(Shutdown::HeartbeatClosed);
                        }
                    }
                    // Flags were already checked above.
                    SIGNAL_TOKEN => SignalFlags::drain(&mut self.waker),
                    LISTENER_TOKEN => self.accept_connections(),
                    Token(conn_id) => {
                        let readable = event.is_readable() || event.is_read_closed();
                        let writable = event.is_writable() || event.is_write_closed();
                        if let Err(e) = self.handle_connection_event(conn_id, readable, writable) {
                            debug!(conn_id, error = %e, "Connection error");
                            self.close_connection(conn_id);
                        }
                    }
                }
            }
        }
    }

    /// Signals, drain completion and orphan detection.
    fn check_liveness(&mut self) -> Option<Shutdown> {
        if self.signals.terminate_requested() {
            info!("Termination requested");
            return Some(Shutdown::Terminated);
        }
        if self.signals.take_quit() {
            self.begin_drain();
        }
        if !self.listen.is_open() && !self.heartbeat.is_open() && self.connections.is_empty() {
            return Some(Shutdown::Drained);
        }
        if self.heartbeat.parent_changed() {
            warn!("Parent process changed, exiting");
            return Some(Shutdown::Orphaned);
        }
        None
    }

    /// Stop accepting and drop the heartbeat; in-flight requests finish.
    fn begin_drain(&mut self) {
        info!(in_flight = self.connections.len(), "Quit requested, draining");
        if let Some(listener) = self.listen.listener_mut() {
            let _ = self.poll.registry().deregister(listener);
        }
        let _ = self.heartbeat.deregister(self.poll.registry());
        self.listen.close();
        self.heartbeat.close();
    }

    fn accept_connections(&mut self) {
        let Some(listener) = self.listen.listener() else {
            return;
        };

        // Edge-triggered: accept until the backlog is empty.
        loop {
            let stream = match listener.accept() {
                Ok((stream, _)) => stream,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    break;
                }
            };

            if let Err(e) = set_cloexec(&stream) {
                warn!(error = %e, "Failed to configure accepted socket");
                continue;
            }

            let conn_id = match self.connections.insert(stream) {
                Ok(id) => id,
                Err(_stream) => {
                    warn!("Connection limit reached");
                    continue;
                }
            };

            if let Some(conn) = self.connections.get_mut(conn_id) {
                if let Err(e) = self.poll.registry().register(
                    &mut conn.stream,
                    Token(conn_id),
                    Interest::READABLE,
                ) {
                    error!(conn_id, error = %e, "Failed to register connection");
                    self.connections.remove(conn_id);
                    continue;
                }
            }
            debug!(conn_id, "Accepted connection");
        }
    }

    fn handle_connection_event(
        &mut self,
        conn_id: usize,
        readable: bool,
        writable: bool,
    ) -> io::Result<()> {
        let Some(conn) = self.connections.get(conn_id) else {
            return Ok(());
        };

        if conn.is_reading() {
            if readable {
                self.handle_readable(conn_id)?;
            }
        } else if writable {
            self.handle_writable(conn_id)?;
        }
        Ok(())
    }

    /// Read until would-block or EOF. EOF completes the request.
    fn handle_readable(&mut self, conn_id: usize) -> io::Result<()> {
        loop {
            let Some(conn) = self.connections.get_mut(conn_id) else {
                return Ok(());
            };

            let n = match conn.stream.read(&mut self.read_buf) {
                Ok(0) => return self.complete_request(conn_id),
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };

            if let Err(exceeded) = self.connections.append(conn_id, &self.read_buf[..n]) {
                return self.reject_request(conn_id, exceeded);
            }
        }
    }

    fn complete_request(&mut self, conn_id: usize) -> io::Result<()> {
        let Some(input) = self.connections.take_request(conn_id) else {
            return Ok(());
        };
        self.half_close(conn_id, HalfClose::Read);
        debug!(
            conn_id,
            bytes = input.len(),
            buffered = self.connections.buffered(),
            "Request received"
        );

        let out = handler::handle(&input, &mut *self.app, self.limits.max_response_bytes);
        self.send_response(conn_id, out)
    }

    fn reject_request(&mut self, conn_id: usize, exceeded: LimitExceeded) -> io::Result<()> {
        warn!(conn_id, limit = ?exceeded, "Request buffer limit exceeded");
        self.connections.take_request(conn_id);
        self.half_close(conn_id, HalfClose::Read);

        let err = Error::RequestTooLarge {
            limit: exceeded.limit(),
        };
        self.send_response(conn_id, handler::encode_error(&err))
    }

    fn send_response(&mut self, conn_id: usize, out: Bytes) -> io::Result<()> {
        self.connections.respond(conn_id, out);
        if let Some(conn) = self.connections.get_mut(conn_id) {
            self.poll
                .registry()
                .reregister(&mut conn.stream, Token(conn_id), Interest::WRITABLE)?;
        }
        self.handle_writable(conn_id)
    }

    /// Write until would-block or done. Done means half-close and release.
    fn handle_writable(&mut self, conn_id: usize) -> io::Result<()> {
        loop {
            let Some(conn) = self.connections.get(conn_id) else {
                return Ok(());
            };

            let n = match conn.pending_output() {
                None => return Ok(()),
                Some([]) => 0,
                Some(pending) => match (&conn.stream).write(pending) {
                    Ok(0) => {
                        return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                    }
                    Ok(n) => n,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                },
            };

            if self.connections.advance(conn_id, n) {
                self.half_close(conn_id, HalfClose::Write);
                self.close_connection(conn_id);
                debug!(conn_id, "Response sent");
                return Ok(());
            }
        }
    }

    fn half_close(&self, conn_id: usize, how: HalfClose) {
        if let Some(conn) = self.connections.get(conn_id) {
            if let Err(e) = conn.stream.shutdown(how) {
                debug!(conn_id, error = %e, ?how, "Half-close failed");
            }
        }
    }

    fn close_connection(&mut self, conn_id: usize) {
        if let Some(mut conn) = self.connections.remove(conn_id) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            debug!(conn_id, "Connection closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{AppError, Request, Response};
    use crate::netstring;
    use serde_json::json;
    use std::io::{BufRead, BufReader};
    use std::os::unix::net::UnixStream as StdUnixStream;
    use std::path::{Path, PathBuf};
    use std::thread;

    fn request_bytes(path: &str, body: &[u8]) -> Vec<u8> {
        let mut out = bytes::BytesMut::new();
        let headers = json!({"REQUEST_METHOD": "POST", "PATH_INFO": path}).to_string();
        netstring::encode_into(&mut out, headers.as_bytes());
        netstring::encode_into(&mut out, body);
        netstring::encode_into(&mut out, b"");
        out.to_vec()
    }

    fn exchange(path: &Path, request: &[u8]) -> Vec<u8> {
        let mut client = StdUnixStream::connect(path).unwrap();
        client.write_all(request).unwrap();
        client.shutdown(HalfClose::Write).unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).unwrap();
        response
    }

    fn echo_app(req: Request) -> std::result::Result<Response, AppError> {
        let mut req = req;
        let mut body = Vec::new();
        req.input.read_to_end(&mut body).unwrap();
        let body = format!("{} {}", req.path(), String::from_utf8_lossy(&body));
        Ok(Response::text(200, "text/plain", body))
    }

    struct Harness {
        _dir: tempfile::TempDir,
        path: PathBuf,
        listen: ListenSocket,
        heartbeat: Heartbeat,
        parent: StdUnixStream,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.sock");
        let listen = ListenSocket::bind(&path).unwrap();
        let (ours, parent) = StdUnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        let heartbeat = Heartbeat::from_stream(
            UnixStream::from_std(ours),
            std::os::unix::process::parent_id(),
        );
        Harness {
            _dir: dir,
            path,
            listen,
            heartbeat,
            parent,
        }
    }

    fn limits() -> Limits {
        Limits {
            read_chunk_size: 7,
            ..Limits::default()
        }
    }

    #[test]
    fn test_serves_requests_until_heartbeat_closes() {
        let mut h = harness();
        let path = h.path.clone();
        let parent = h.parent.try_clone().unwrap();
        drop(h.parent);

        let client = thread::spawn(move || {
            let first = exchange(&path, &request_bytes("/a", b"some body longer than a chunk"));
            let second = exchange(&path, &request_bytes("/a", b"some body longer than a chunk"));
            drop(parent);
            (first, second)
        });

        let mut app = echo_app;
        let mut reactor = Reactor::new(
            &mut h.listen,
            &mut h.heartbeat,
            &mut app,
            limits(),
            Duration::from_secs(5),
            SignalFlags::new().unwrap(),
        )
        .unwrap();
        assert_eq!(reactor.run().unwrap(), Shutdown::HeartbeatClosed);

        let (first, second) = client.join().unwrap();
        assert_eq!(first, second);
        let frames = netstring::decode(&first).unwrap();
        assert_eq!(&frames[0][..], b"200");
        assert_eq!(&frames[2][..], b"/a some body longer than a chunk");
        assert!(frames[3].is_empty());
    }

    #[test]
    fn test_request_limit_answers_with_error() {
        let mut h = harness();
        let path = h.path.clone();
        let parent = h.parent.try_clone().unwrap();
        drop(h.parent);

        let client = thread::spawn(move || {
            let mut client = StdUnixStream::connect(&path).unwrap();
            // The worker stops reading at the limit, so the write may fail.
            let _ = client.write_all(&request_bytes("/big", &[b'x'; 256]));
            let _ = client.shutdown(HalfClose::Write);
            let mut response = Vec::new();
            client.read_to_end(&mut response).unwrap();
            drop(parent);
            response
        });

        let mut app = echo_app;
        let mut reactor = Reactor::new(
            &mut h.listen,
            &mut h.heartbeat,
            &mut app,
            Limits {
                max_request_bytes: 64,
                ..limits()
            },
            Duration::from_secs(5),
            SignalFlags::new().unwrap(),
        )
        .unwrap();
        assert_eq!(reactor.run().unwrap(), Shutdown::HeartbeatClosed);

        let response = client.join().unwrap();
        let frames = netstring::decode(&response).unwrap();
        assert_eq!(frames.len(), 1);
        let payload: crate::error::ErrorPayload = serde_json::from_slice(&frames[0]).unwrap();
        assert_eq!(payload.name, "RequestTooLarge");
    }

    #[test]
    fn test_quit_drains_in_flight_requests() {
        let mut h = harness();
        let path = h.path.clone();
        let signals = SignalFlags::new().unwrap();
        let trigger = signals.clone();
        let parent = h.parent.try_clone().unwrap();

        let client = thread::spawn(move || {
            let mut client = StdUnixStream::connect(&path).unwrap();
            let request = request_bytes("/slow", b"late");
            client.write_all(&request[..5]).unwrap();
            thread::sleep(Duration::from_millis(200));

            trigger.quit();
            // The heartbeat closes once the drain starts.
            let mut line = String::new();
            let n = BufReader::new(parent).read_line(&mut line).unwrap();
            assert_eq!(n, 0);

            client.write_all(&request[5..]).unwrap();
            client.shutdown(HalfClose::Write).unwrap();
            let mut response = Vec::new();
            client.read_to_end(&mut response).unwrap();
            response
        });

        let mut app = echo_app;
        let mut reactor = Reactor::new(
            &mut h.listen,
            &mut h.heartbeat,
            &mut app,
            limits(),
            Duration::from_millis(20),
            signals,
        )
        .unwrap();
        assert_eq!(reactor.run().unwrap(), Shutdown::Drained);
        drop(reactor);
        assert!(!h.listen.is_open());

        let response = client.join().unwrap();
        let frames = netstring::decode(&response).unwrap();
        assert_eq!(&frames[2][..], b"/slow late");
    }

    #[test]
    fn test_terminate_stops_loop() {
        let mut h = harness();
        let signals = SignalFlags::new().unwrap();
        signals.terminate();

        let mut app = echo_app;
        let mut reactor = Reactor::new(
            &mut h.listen,
            &mut h.heartbeat,
            &mut app,
            limits(),
            Duration::from_millis(10),
            signals,
        )
        .unwrap();
        assert_eq!(reactor.run().unwrap(), Shutdown::Terminated);
    }

    #[test]
    fn test_terminate_wakes_blocked_wait() {
        let mut h = harness();
        let signals = SignalFlags::new().unwrap();
        let trigger = signals.clone();

        let signaller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            trigger.terminate();
        });

        let mut app = echo_app;
        let mut reactor = Reactor::new(
            &mut h.listen,
            &mut h.heartbeat,
            &mut app,
            limits(),
            Duration::from_secs(60),
            signals,
        )
        .unwrap();
        let started = std::time::Instant::now();
        assert_eq!(reactor.run().unwrap(), Shutdown::Terminated);
        assert!(started.elapsed() < Duration::from_secs(10));
        signaller.join().unwrap();
    }

    #[test]
    fn test_parent_change_stops_loop() {
        let mut h = harness();
        let (ours, _parent) = StdUnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        // No process has this parent PID, so the worker counts as orphaned.
        let mut orphaned = Heartbeat::from_stream(UnixStream::from_std(ours), u32::MAX);

        let mut app = echo_app;
        let mut reactor = Reactor::new(
            &mut h.listen,
            &mut orphaned,
            &mut app,
            limits(),
            Duration::from_millis(10),
            SignalFlags::new().unwrap(),
        )
        .unwrap();
        assert_eq!(reactor.run().unwrap(), Shutdown::Orphaned);
    }
}
