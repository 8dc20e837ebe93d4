//! Listening socket setup.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener};
use tracing::{debug, error};

/// Pending connections the kernel queues for us. One is enough: we only
/// ever handle a single client at a time.
const BACKLOG: i32 = 1;

/// Step of listener creation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerStep {
    Socket,
    SetOption,
    Bind,
    Listen,
}

/// Listener creation error. The partially built socket has already been
/// closed when this is returned.
#[derive(Debug)]
pub struct ListenerError {
    pub step: ListenerStep,
    pub port: u16,
    pub source: io::Error,
}

impl std::fmt::Display for ListenerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let what = match self.step {
            ListenerStep::Socket => "create socket",
            ListenerStep::SetOption => "set socket options",
            ListenerStep::Bind => "bind socket to the address",
            ListenerStep::Listen => "mark socket as passive listener",
        };
        write!(f, "Failed to {} on port {}: {}", what, self.port, self.source)
    }
}

impl std::error::Error for ListenerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Create an IPv4 TCP listener bound to every interface on `port`.
///
/// The socket has SO_REUSEADDR and SO_REUSEPORT set and a backlog of one.
/// On failure the socket is dropped (closed) before the error is returned.
pub fn create_listener(port: u16) -> Result<TcpListener, ListenerError> {
    let fail = move |step: ListenerStep| {
        move |source: io::Error| {
            error!(port, ?step, error = %source, "Listener setup failed");
            ListenerError { step, port, source }
        }
    };

    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .map_err(fail(ListenerStep::Socket))?;

    socket
        .set_reuse_address(true)
        .map_err(fail(ListenerStep::SetOption))?;
    socket
        .set_reuse_port(true)
        .map_err(fail(ListenerStep::SetOption))?;

    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    socket
        .bind(&addr.into())
        .map_err(fail(ListenerStep::Bind))?;
    socket.listen(BACKLOG).map_err(fail(ListenerStep::Listen))?;

    debug!(port, "Listener ready");
    Ok(socket.into())
}
