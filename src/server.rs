//! Accept loop.
//!
//! Strictly sequential: one connection is accepted, framed, dispatched,
//! answered and closed before the next accept. There is no per-connection
//! timeout, so a client that connects and then stays silent holds the loop
//! until it disconnects or the server is shut down.

use crate::config::Config;
use crate::engine::Engine;
use crate::runtime::{
    create_listener, handle_client, ConnectionOutcome, Framer, ListenerError, ShutdownHandle,
};
use crate::telemetry::Telemetry;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(0);
const WAKE_TOKEN: Token = Token(1);

/// Pause before retrying an accept that failed for lack of resources
/// (EMFILE, ENFILE, ENOBUFS, ENOMEM). The pending client stays queued, so
/// the retry must not wait for a fresh readiness event.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Where the accept loop gets its connections from.
trait Accept {
    fn is_running(&self) -> bool;

    /// `Ok(None)` when nothing is pending.
    fn accept(&self) -> io::Result<Option<(TcpStream, SocketAddr)>>;
}

impl Accept for ShutdownHandle {
    fn is_running(&self) -> bool {
        ShutdownHandle::is_running(self)
    }

    fn accept(&self) -> io::Result<Option<(TcpStream, SocketAddr)>> {
        ShutdownHandle::accept(self)
    }
}

/// Lifecycle of the accept loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Fatal startup errors
#[derive(Debug)]
pub enum ServerError {
    Listener(ListenerError),
    Io(io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Listener(e) => write!(f, "{e}"),
            ServerError::Io(e) => write!(f, "Server I/O error: {e}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Listener(e) => Some(e),
            ServerError::Io(e) => Some(e),
        }
    }
}

impl From<ListenerError> for ServerError {
    fn from(e: ListenerError) -> Self {
        ServerError::Listener(e)
    }
}

impl From<io::Error> for ServerError {
    fn from(e: io::Error) -> Self {
        ServerError::Io(e)
    }
}

/// Server instance
pub struct Server<E> {
    engine: E,
    framer: Framer,
    telemetry: Arc<Telemetry>,
    poll: Poll,
    shutdown: ShutdownHandle,
    local_addr: SocketAddr,
    state: ServerState,
}

impl<E: Engine> Server<E> {
    /// Create the listener and get ready to accept.
    pub fn bind(config: &Config, engine: E, telemetry: Arc<Telemetry>) -> Result<Self, ServerError> {
        debug!(state = ?ServerState::Starting, port = config.port, "Starting server");

        let listener = create_listener(config.port)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let poll = Poll::new()?;
        poll.registry().register(
            &mut SourceFd(&listener.as_raw_fd()),
            LISTENER_TOKEN,
            Interest::READABLE,
        )?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;

        Ok(Server {
            engine,
            framer: Framer::new(config.initial_buffer_size, config.max_frame_size),
            telemetry,
            poll,
            shutdown: ShutdownHandle::new(listener, waker),
            local_addr,
            state: ServerState::Starting,
        })
    }

    /// Handle for stopping the server from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Accept and serve connections until shutdown is triggered.
    pub fn run(&mut self) -> io::Result<()> {
        self.state = ServerState::Running;
        info!(
            address = %self.local_addr,
            max_frame_size = ?self.framer.max_frame_size(),
            "Server listening"
        );

        let mut events = Events::with_capacity(8);
        while self.shutdown.is_running() {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "Poll failed");
                self.stop();
                return Err(e);
            }

            for event in events.iter() {
                if event.token() == LISTENER_TOKEN {
                    accept_pending(
                        &self.shutdown,
                        &self.framer,
                        &mut self.engine,
                        &self.telemetry,
                    );
                }
            }
        }

        self.stop();
        Ok(())
    }

    fn stop(&mut self) {
        self.state = ServerState::Stopping;
        self.shutdown.close_listener();
        self.state = ServerState::Stopped;
        info!("Server stopped.");
    }
}

/// Serve every connection that is ready, one at a time. Returns how many
/// connections were accepted.
///
/// Only returns once nothing is pending or the server has stopped. Under
/// edge-triggered polling no new event arrives for a client still sitting in
/// the backlog, so failed accepts are retried here rather than left to the
/// next poll.
fn accept_pending<A, E>(
    source: &A,
    framer: &Framer,
    engine: &mut E,
    telemetry: &Telemetry,
) -> usize
where
    A: Accept + ?Sized,
    E: Engine + ?Sized,
{
    let mut accepted = 0;
    while source.is_running() {
        let (stream, peer) = match source.accept() {
            Ok(Some(accepted)) => accepted,
            Ok(None) => break,
            Err(e) => {
                if !source.is_running() {
                    break;
                }
                match e.kind() {
                    io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::Interrupted => {
                        debug!(error = %e, "Accept interrupted, retrying");
                    }
                    _ => {
                        warn!(error = %e, "Failed to accept connection");
                        thread::sleep(ACCEPT_BACKOFF);
                    }
                }
                continue;
            }
        };

        accepted += 1;
        telemetry.increment_request_count();
        debug!(peer = %peer, "Accepted a connection");

        // Accepted sockets may inherit non-blocking mode from the listener
        if let Err(e) = stream.set_nonblocking(false) {
            warn!(peer = %peer, error = %e, "Failed to configure connection");
            continue;
        }

        match handle_client(stream, framer, engine, telemetry) {
            ConnectionOutcome::Responded { bytes } => {
                debug!(peer = %peer, bytes, "Response sent")
            }
            other => debug!(peer = %peer, outcome = ?other, "Connection closed"),
        }
    }
    accepted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShutdownMode;
    use crate::engine::{EngineResult, ValueKind};
    use std::cell::Cell;
    use std::io::{Read, Write};
    use std::net::{Shutdown, TcpStream};
    use std::path::PathBuf;
    use std::thread;

    /// Answers payloads starting with "ok" with `reply`, everything else with
    /// a non-string value.
    struct TestEngine {
        registered: bool,
        reply: &'static str,
    }

    impl Engine for TestEngine {
        fn has_registered_handler(&self) -> bool {
            self.registered
        }

        fn dispatch(&mut self, payload: &str) -> EngineResult {
            if payload.starts_with("ok") || payload.starts_with("hello") {
                EngineResult::String(self.reply.to_string())
            } else {
                EngineResult::Value(ValueKind::Null)
            }
        }
    }

    fn test_config() -> Config {
        Config {
            script: PathBuf::from("handler.j2"),
            port: 0,
            initial_buffer_size: 128,
            max_frame_size: None,
            shutdown: ShutdownMode::Drain,
            log_level: "info".to_string(),
        }
    }

    fn start(
        engine: TestEngine,
    ) -> (
        u16,
        ShutdownHandle,
        Arc<Telemetry>,
        thread::JoinHandle<Server<TestEngine>>,
    ) {
        let telemetry = Telemetry::init();
        let mut server = Server::bind(&test_config(), engine, Arc::clone(&telemetry)).unwrap();
        assert_eq!(server.state(), ServerState::Starting);
        let port = server.local_addr().port();
        let handle = server.shutdown_handle();
        let join = thread::spawn(move || {
            server.run().unwrap();
            server
        });
        (port, handle, telemetry, join)
    }

    fn request(port: u16, body: &[u8]) -> Vec<u8> {
        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        client.write_all(body).unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).unwrap();
        response
    }

    #[test]
    fn test_hello_world_end_to_end() {
        let (port, handle, telemetry, join) = start(TestEngine {
            registered: true,
            reply: "world",
        });

        assert_eq!(request(port, b"hello42"), b"world");
        assert_eq!(telemetry.request_count(), 1);
        assert_eq!(telemetry.ok_response_count(), 1);

        assert!(handle.trigger());
        let server = join.join().unwrap();
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[test]
    fn test_no_handler_closes_silently() {
        let (port, handle, telemetry, join) = start(TestEngine {
            registered: false,
            reply: "world",
        });

        assert!(request(port, b"hello42").is_empty());
        assert_eq!(telemetry.request_count(), 1);
        assert_eq!(telemetry.ok_response_count(), 0);

        handle.trigger();
        join.join().unwrap();
    }

    #[test]
    fn test_counters_across_mixed_connections() {
        let (port, handle, telemetry, join) = start(TestEngine {
            registered: true,
            reply: "fine",
        });

        assert_eq!(request(port, b"ok 142"), b"fine");
        assert!(request(port, b"nope42").is_empty());
        assert_eq!(request(port, b"ok 242"), b"fine");

        // Disconnects before completing a frame
        let mut quitter = TcpStream::connect(("127.0.0.1", port)).unwrap();
        quitter.write_all(b"ok but no terminator").unwrap();
        quitter.shutdown(Shutdown::Write).unwrap();
        let mut rest = Vec::new();
        quitter.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());

        let mut big = b"ok".to_vec();
        big.extend(std::iter::repeat(b'.').take(500));
        big.extend_from_slice(b"42");
        assert_eq!(request(port, &big), b"fine");

        assert!(request(port, b"other42").is_empty());

        assert_eq!(telemetry.request_count(), 6);
        assert_eq!(telemetry.ok_response_count(), 3);

        handle.trigger();
        join.join().unwrap();
    }

    #[test]
    fn test_terminator_split_across_packets() {
        let (port, handle, _telemetry, join) = start(TestEngine {
            registered: true,
            reply: "joined",
        });

        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        client.set_nodelay(true).unwrap();
        client.write_all(b"ok4").unwrap();
        thread::sleep(std::time::Duration::from_millis(20));
        client.write_all(b"2").unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).unwrap();
        assert_eq!(response, b"joined");

        handle.trigger();
        join.join().unwrap();
    }

    #[test]
    fn test_shutdown_while_idle_twice() {
        let (port, handle, telemetry, join) = start(TestEngine {
            registered: true,
            reply: "x",
        });

        let second = handle.clone();
        assert!(handle.trigger());
        assert!(!second.trigger());

        let server = join.join().unwrap();
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(TcpStream::connect(("127.0.0.1", port)).is_err());
        assert_eq!(telemetry.request_count(), 0);
    }

    #[test]
    fn test_bind_failure_is_fatal() {
        let taken = std::net::TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let mut config = test_config();
        config.port = taken.local_addr().unwrap().port();

        let result = Server::bind(
            &config,
            TestEngine {
                registered: true,
                reply: "x",
            },
            Telemetry::init(),
        );
        assert!(matches!(result, Err(ServerError::Listener(_))));
    }

    /// Fails the first `failures` accepts with a resource error, then hands
    /// out connections from a real non-blocking listener.
    struct FlakyListener {
        listener: std::net::TcpListener,
        failures: Cell<usize>,
        attempts: Cell<usize>,
    }

    impl Accept for FlakyListener {
        fn is_running(&self) -> bool {
            true
        }

        fn accept(&self) -> io::Result<Option<(TcpStream, SocketAddr)>> {
            self.attempts.set(self.attempts.get() + 1);
            if self.failures.get() > 0 {
                self.failures.set(self.failures.get() - 1);
                return Err(io::Error::new(io::ErrorKind::Other, "Too many open files"));
            }
            match self.listener.accept() {
                Ok(accepted) => Ok(Some(accepted)),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
                Err(e) => Err(e),
            }
        }
    }

    #[test]
    fn test_accept_error_retries_pending_client() {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        listener.set_nonblocking(true).unwrap();
        let port = listener.local_addr().unwrap().port();

        // Queued in the backlog before the loop looks at the listener
        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        client.write_all(b"hello42").unwrap();
        let reader = thread::spawn(move || {
            let mut response = Vec::new();
            client.read_to_end(&mut response).unwrap();
            response
        });

        let source = FlakyListener {
            listener,
            failures: Cell::new(2),
            attempts: Cell::new(0),
        };
        let telemetry = Telemetry::init();
        let mut engine = TestEngine {
            registered: true,
            reply: "world",
        };

        let accepted = accept_pending(&source, &Framer::default(), &mut engine, &telemetry);

        assert_eq!(accepted, 1);
        // two failures, the client, then nothing pending
        assert_eq!(source.attempts.get(), 4);
        assert_eq!(reader.join().unwrap(), b"world");
        assert_eq!(telemetry.request_count(), 1);
        assert_eq!(telemetry.ok_response_count(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_sighup_drains_and_stops() {
        use signal_hook::consts::signal::SIGHUP;

        let (port, handle, telemetry, join) = start(TestEngine {
            registered: true,
            reply: "world",
        });
        let _signals = crate::runtime::install_signal_handlers(handle.clone(), ShutdownMode::Drain)
            .unwrap();

        assert_eq!(request(port, b"hello42"), b"world");

        signal_hook::low_level::raise(SIGHUP).unwrap();

        let server = join.join().unwrap();
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(!handle.is_running());
        assert!(!handle.is_listener_open());
        assert_eq!(telemetry.request_count(), 1);
        assert_eq!(telemetry.ok_response_count(), 1);
    }
}
