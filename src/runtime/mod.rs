//! Connection-handling runtime.
//!
//! Pieces used by the accept loop in [`crate::server`]:
//! - `listener`: passive IPv4 socket setup
//! - `framer`: `"42"`-terminated request reader
//! - `connection`: dispatch to the engine and write the response
//! - `shutdown`: running flag, close-once listener and signal handling

mod connection;
mod framer;
mod listener;
mod shutdown;

pub use connection::{handle_client, ConnectionOutcome};
pub use framer::{Framer, TERMINATOR};
pub use listener::{create_listener, ListenerError};
#[cfg(unix)]
pub use shutdown::install_signal_handlers;
pub use shutdown::ShutdownHandle;
