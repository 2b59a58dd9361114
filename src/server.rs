//! Worker lifecycle.
//!
//! Startup order: bind the socket, wait for the heartbeat, build the
//! application, announce the PID, then hand over to the reactor. However the
//! worker ends, the socket path is removed and the heartbeat is closed.

use crate::app::builder;
use crate::config::{AppConfig, Config};
use crate::error::{Error, Result};
use crate::runtime::{Heartbeat, Reactor, Shutdown, SignalFlags};
use mio::net::UnixListener;
use socket2::{Domain, SockAddr, Socket, Type};
use std::fs;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

const LISTEN_BACKLOG: i32 = 1024;

/// The worker's listening socket. Owns the filesystem path: dropping it
/// closes the listener and unlinks the path.
pub struct ListenSocket {
    listener: Option<UnixListener>,
    path: PathBuf,
}

impl ListenSocket {
    /// Bind a non-blocking, close-on-exec listener at `path`.
    ///
    /// A stale socket left at `path` is replaced; any other file is an error.
    pub fn bind(path: &Path) -> Result<Self> {
        Self::create(path).map_err(|source| Error::Bind {
            path: path.to_path_buf(),
            source,
        })
    }

    fn create(path: &Path) -> io::Result<Self> {
        match fs::symlink_metadata(path) {
            Ok(meta) if meta.file_type().is_socket() => {
                debug!(path = %path.display(), "Removing stale socket");
                fs::remove_file(path)?;
            }
            Ok(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "path exists and is not a socket",
                ));
            }
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
        socket.set_cloexec(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SockAddr::unix(path)?)?;
        socket.listen(LISTEN_BACKLOG)?;

        let listener: std::os::unix::net::UnixListener = socket.into();
        Ok(Self {
            listener: Some(UnixListener::from_std(listener)),
            path: path.to_path_buf(),
        })
    }

    pub fn listener(&self) -> Option<&UnixListener> {
        self.listener.as_ref()
    }

    pub fn listener_mut(&mut self) -> Option<&mut UnixListener> {
        self.listener.as_mut()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.listener.is_some()
    }

    /// Stop accepting. The path stays until drop.
    pub fn close(&mut self) {
        if self.listener.take().is_some() {
            debug!(path = %self.path.display(), "Listener closed");
        }
    }
}

impl Drop for ListenSocket {
    fn drop(&mut self) {
        self.close();
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove socket"),
        }
    }
}

/// How a worker run ended.
#[derive(Debug, PartialEq, Eq)]
pub enum Exit {
    /// Orderly shutdown, exit status 0.
    Clean(Shutdown),
    /// Failure already reported (to the log or the parent), exit status 1.
    Failed,
}

impl Exit {
    pub fn code(&self) -> u8 {
        match self {
            Exit::Clean(_) => 0,
            Exit::Failed => 1,
        }
    }
}

/// Run one worker to completion.
///
/// Errors that could not be handed to the parent over the heartbeat are
/// returned to the caller.
pub fn run(config: &Config, signals: &SignalFlags) -> Result<Exit> {
    let ppid = std::os::unix::process::parent_id();
    let mut listen = ListenSocket::bind(&config.socket_path)?;
    info!(path = %listen.path().display(), ppid, "Listening");

    let Some(listener) = listen.listener_mut() else {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::NotConnected,
            "listener closed before startup",
        )));
    };
    let established = Heartbeat::establish(listener, config.heartbeat_timeout, ppid, signals);
    let mut heartbeat = match established {
        Ok(Some(heartbeat)) => heartbeat,
        Ok(None) => {
            let reason = if signals.terminate_requested() {
                Shutdown::Terminated
            } else {
                Shutdown::Drained
            };
            info!(?reason, "Worker stopped before serving");
            return Ok(Exit::Clean(reason));
        }
        Err(Error::HeartbeatTimeout(timeout)) => {
            warn!(?timeout, "No heartbeat connected");
            return Ok(Exit::Failed);
        }
        Err(e) => return Err(e),
    };

    match serve(config, signals, &mut listen, &mut heartbeat) {
        Ok(reason) => {
            info!(?reason, "Worker shutting down");
            Ok(Exit::Clean(reason))
        }
        Err(err) => {
            error!(error = %err, name = err.name(), "Worker failed");
            if heartbeat.report_fatal(&err) {
                Ok(Exit::Failed)
            } else {
                Err(err)
            }
        }
    }
}

fn serve(
    config: &Config,
    signals: &SignalFlags,
    listen: &mut ListenSocket,
    heartbeat: &mut Heartbeat,
) -> Result<Shutdown> {
    let app_config = AppConfig::from_file(&config.app_config)?;
    let limits = config.limits(&app_config.worker);
    let mut app = builder::build(&app_config.mounts)?;

    heartbeat.announce()?;

    let mut reactor = Reactor::new(
        listen,
        heartbeat,
        app.as_mut(),
        limits,
        config.poll_timeout,
        signals.clone(),
    )?;
    reactor.run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CliArgs;
    use crate::error::ErrorPayload;
    use crate::netstring;
    use clap::Parser;
    use serde_json::json;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::Shutdown as HalfClose;
    use std::os::unix::net::UnixStream;
    use std::thread::{self, JoinHandle};
    use std::time::{Duration, Instant};

    const APP_TOML: &str = r#"
[worker]
read_chunk_size = 5

[[mount]]
path = "/echo"
app = { kind = "echo" }

[[mount]]
path = "/"
app = { kind = "static", body = "hello", headers = { "Content-Type" = "text/plain" } }
"#;

    struct Worker {
        dir: tempfile::TempDir,
        socket: PathBuf,
        signals: SignalFlags,
        handle: JoinHandle<Result<Exit>>,
    }

    fn spawn_worker(app_toml: &str, heartbeat_timeout_ms: u64) -> Worker {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("worker.sock");
        let app_config = dir.path().join("app.toml");
        fs::write(&app_config, app_toml).unwrap();

        let timeout = heartbeat_timeout_ms.to_string();
        let cli = CliArgs::parse_from([
            "netstring-worker",
            "--file",
            socket.to_str().unwrap(),
            "--heartbeat-timeout-ms",
            timeout.as_str(),
            app_config.to_str().unwrap(),
        ]);
        // Default 60s readiness timeout: every exit below must be event driven.
        let config = Config::from_args(cli);

        let signals = SignalFlags::new().unwrap();
        let worker_signals = signals.clone();
        let handle = thread::spawn(move || run(&config, &worker_signals));
        Worker {
            dir,
            socket,
            signals,
            handle,
        }
    }

    fn connect_when_ready(path: &Path) -> UnixStream {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match UnixStream::connect(path) {
                Ok(stream) => return stream,
                Err(e) if Instant::now() >= deadline => panic!("worker never listened: {e}"),
                Err(_) => thread::sleep(Duration::from_millis(5)),
            }
        }
    }

    fn read_line(reader: &mut BufReader<UnixStream>) -> String {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        line
    }

    fn request(path: &str, body: &[u8]) -> Vec<u8> {
        let headers = json!({"REQUEST_METHOD": "POST", "PATH_INFO": path}).to_string();
        let mut out = Vec::new();
        netstring::write(&mut out, headers.as_bytes()).unwrap();
        netstring::write(&mut out, body).unwrap();
        netstring::write(&mut out, b"").unwrap();
        out
    }

    fn exchange(path: &Path, request: &[u8]) -> Vec<u8> {
        let mut client = UnixStream::connect(path).unwrap();
        client.write_all(request).unwrap();
        client.shutdown(HalfClose::Write).unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).unwrap();
        response
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(Exit::Clean(Shutdown::Drained).code(), 0);
        assert_eq!(Exit::Failed.code(), 1);
    }

    #[test]
    fn test_bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        let stale = UnixListener::bind(&path).unwrap();
        drop(stale);
        assert!(path.exists());

        let listen = ListenSocket::bind(&path).unwrap();
        assert!(listen.is_open());
        drop(listen);
        assert!(!path.exists());
    }

    #[test]
    fn test_bind_refuses_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-a-socket");
        fs::write(&path, b"keep me").unwrap();

        let err = ListenSocket::bind(&path).err().unwrap();
        assert_eq!(err.name(), "BindError");
        assert_eq!(fs::read(&path).unwrap(), b"keep me");
    }

    #[test]
    fn test_heartbeat_timeout_exits_failed() {
        let worker = spawn_worker(APP_TOML, 50);
        let exit = worker.handle.join().unwrap().unwrap();
        assert_eq!(exit, Exit::Failed);
        assert!(!worker.socket.exists());
    }

    #[test]
    fn test_serves_requests_and_exits_on_heartbeat_close() {
        let worker = spawn_worker(APP_TOML, 5000);
        let heartbeat = connect_when_ready(&worker.socket);
        let mut reader = BufReader::new(heartbeat);
        assert_eq!(read_line(&mut reader), format!("{}\n", std::process::id()));

        let first = exchange(&worker.socket, &request("/", b""));
        let second = exchange(&worker.socket, &request("/", b""));
        assert_eq!(first, second);
        let frames = netstring::decode(&first).unwrap();
        assert_eq!(&frames[0][..], b"200");
        assert_eq!(&frames[2][..], b"hello");

        let echoed = exchange(&worker.socket, &request("/echo/x", b"0123456789abc"));
        let frames = netstring::decode(&echoed).unwrap();
        assert_eq!(&frames[2][..], b"0123456789abc");

        drop(reader);
        let exit = worker.handle.join().unwrap().unwrap();
        assert_eq!(exit, Exit::Clean(Shutdown::HeartbeatClosed));
        assert!(!worker.socket.exists());
    }

    #[test]
    fn test_heartbeat_close_abandons_partial_requests() {
        let worker = spawn_worker(APP_TOML, 5000);
        let heartbeat = connect_when_ready(&worker.socket);
        let mut reader = BufReader::new(heartbeat);
        read_line(&mut reader);

        let partial = &request("/", b"unfinished")[..12];
        let mut clients: Vec<UnixStream> = (0..2)
            .map(|_| {
                let mut client = UnixStream::connect(&worker.socket).unwrap();
                client.write_all(partial).unwrap();
                client
            })
            .collect();
        thread::sleep(Duration::from_millis(100));

        drop(reader);
        let exit = worker.handle.join().unwrap().unwrap();
        assert_eq!(exit, Exit::Clean(Shutdown::HeartbeatClosed));
        assert!(!worker.socket.exists());

        for client in &mut clients {
            let mut response = Vec::new();
            // Closed without a response; a reset is as good as EOF here.
            if client.read_to_end(&mut response).is_ok() {
                assert!(response.is_empty());
            }
        }
    }

    #[test]
    fn test_config_error_reported_over_heartbeat() {
        let worker = spawn_worker("[[mount]]\npath = \"relative\"\napp = { kind = \"echo\" }\n", 5000);
        let heartbeat = connect_when_ready(&worker.socket);
        let mut reader = BufReader::new(heartbeat);

        let line = read_line(&mut reader);
        let payload: ErrorPayload = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(payload.name, "ConfigError");
        assert!(read_line(&mut reader).is_empty());

        let exit = worker.handle.join().unwrap().unwrap();
        assert_eq!(exit, Exit::Failed);
        assert!(!worker.socket.exists());
    }

    #[test]
    fn test_terminate_exits_clean() {
        let worker = spawn_worker(APP_TOML, 5000);
        let heartbeat = connect_when_ready(&worker.socket);
        let mut reader = BufReader::new(heartbeat);
        read_line(&mut reader);

        worker.signals.terminate();
        let exit = worker.handle.join().unwrap().unwrap();
        assert_eq!(exit, Exit::Clean(Shutdown::Terminated));
        assert!(!worker.socket.exists());
        // Closing the heartbeat is part of cleanup.
        assert!(read_line(&mut reader).is_empty());
        drop(worker.dir);
    }

    #[test]
    fn test_terminate_while_waiting_for_heartbeat() {
        let worker = spawn_worker(APP_TOML, 60_000);
        wait_for_socket(&worker.socket);

        let started = Instant::now();
        worker.signals.terminate();
        let exit = worker.handle.join().unwrap().unwrap();
        assert_eq!(exit, Exit::Clean(Shutdown::Terminated));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!worker.socket.exists());
    }

    /// Wait until the socket path exists without connecting to it.
    fn wait_for_socket(path: &Path) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !path.exists() {
            assert!(Instant::now() < deadline, "worker never listened");
            thread::sleep(Duration::from_millis(5));
        }
    }
}
