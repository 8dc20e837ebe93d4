//! Per-connection request handling.
//!
//! One accepted connection goes through exactly one cycle:
//! frame the request, dispatch it to the engine, write the response, close.
//! Every failure is absorbed here so the accept loop never sees it.

use crate::engine::{Engine, EngineResult};
use crate::runtime::framer::{FrameError, FrameOutcome, FramedRequest, Framer};
use crate::telemetry::Telemetry;
use std::io::{self, Read, Write};
use tracing::{debug, warn};

/// What happened to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOutcome {
    /// A string response of `bytes` bytes was written in full.
    Responded { bytes: usize },
    /// The handler returned a non-string value; nothing was written.
    EmptyResponse,
    /// Peer closed before completing a frame.
    Eof,
    /// Reading the frame failed.
    ReadFailed,
    /// No handler registered; connection closed without a reply.
    NoHandler,
    /// The response write failed part-way.
    WriteFailed,
}

/// Dispatch outcome before any response is written.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Result(EngineResult),
    NoHandler,
}

/// Pass a framed request to the engine.
///
/// The engine only borrows the payload for the duration of the call.
pub fn dispatch<E: Engine + ?Sized>(engine: &mut E, request: &FramedRequest) -> Dispatch {
    if !engine.has_registered_handler() {
        warn!("No handler registered. Did the script set one up?");
        return Dispatch::NoHandler;
    }
    let payload = String::from_utf8_lossy(request.as_bytes());
    Dispatch::Result(engine.dispatch(&payload))
}

/// Write the engine result to the client and release the connection.
///
/// Takes ownership of the connection, the request and the result; all three
/// are dropped before this returns, whether or not the write succeeded.
pub fn respond<S: Write>(
    mut conn: S,
    request: FramedRequest,
    result: EngineResult,
    telemetry: &Telemetry,
) -> ConnectionOutcome {
    let outcome = match result.body() {
        Some(body) => match conn.write_all(body).and_then(|()| conn.flush()) {
            Ok(()) => {
                telemetry.increment_ok_response_count();
                ConnectionOutcome::Responded { bytes: body.len() }
            }
            Err(e) => {
                warn!(error = %e, len = body.len(), "Failed to write response");
                ConnectionOutcome::WriteFailed
            }
        },
        None => {
            debug!(?result, "Handler returned no string, closing without a body");
            ConnectionOutcome::EmptyResponse
        }
    };
    drop(request);
    drop(result);
    drop(conn);
    outcome
}

/// Run one connection through frame, dispatch and respond.
pub fn handle_client<S, E>(
    mut conn: S,
    framer: &Framer,
    engine: &mut E,
    telemetry: &Telemetry,
) -> ConnectionOutcome
where
    S: Read + Write,
    E: Engine + ?Sized,
{
    let request = match framer.read_framed_request(&mut conn) {
        Ok(FrameOutcome::Request(request)) => request,
        Ok(FrameOutcome::Eof) => return ConnectionOutcome::Eof,
        Err(e) => {
            log_frame_error(&e);
            return ConnectionOutcome::ReadFailed;
        }
    };

    match dispatch(engine, &request) {
        Dispatch::Result(result) => respond(conn, request, result, telemetry),
        Dispatch::NoHandler => ConnectionOutcome::NoHandler,
    }
}

fn log_frame_error(e: &FrameError) {
    match e {
        FrameError::Io(io_err) if is_disconnect(io_err) => {
            debug!(error = %e, "Client went away mid-request")
        }
        _ => warn!(error = %e, "Failed to read request"),
    }
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted | io::ErrorKind::BrokenPipe
    )
}
