//! Shutdown coordination between the accept loop and signal handling.
//!
//! [`ShutdownHandle`] owns the listening socket and the running flag. The
//! accept loop and the signal thread each hold a clone. Triggering shutdown
//! flips the flag, closes the listener and wakes the loop's poll so a
//! blocked wait returns at once.

use crate::config::ShutdownMode;
use mio::Waker;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Shared server context: running flag plus the listener it guards.
#[derive(Clone)]
pub struct ShutdownHandle {
    inner: Arc<Inner>,
}

struct Inner {
    running: AtomicBool,
    /// `None` once closed. Taking the listener out drops (closes) it, so a
    /// second close finds nothing to do.
    listener: Mutex<Option<TcpListener>>,
    waker: Waker,
}

impl ShutdownHandle {
    pub fn new(listener: TcpListener, waker: Waker) -> Self {
        Self {
            inner: Arc::new(Inner {
                running: AtomicBool::new(true),
                listener: Mutex::new(Some(listener)),
                waker,
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Stop the server: clear the running flag, close the listener and wake
    /// the accept loop.
    ///
    /// Safe to call any number of times from any thread. Returns `true` only
    /// for the call that actually stopped the server.
    pub fn trigger(&self) -> bool {
        let first = self.inner.running.swap(false, Ordering::SeqCst);
        self.close_listener();
        if let Err(e) = self.inner.waker.wake() {
            warn!(error = %e, "Failed to wake accept loop");
        }
        first
    }

    /// Close the listening socket if it is still open. Returns whether this
    /// call closed it.
    pub fn close_listener(&self) -> bool {
        match self.listener().take() {
            Some(listener) => {
                drop(listener);
                debug!("Listener closed");
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub fn is_listener_open(&self) -> bool {
        self.listener().is_some()
    }

    /// Accept one pending connection without blocking.
    ///
    /// `Ok(None)` means nothing is pending. Fails once the listener has been
    /// closed.
    pub fn accept(&self) -> io::Result<Option<(TcpStream, SocketAddr)>> {
        let guard = self.listener();
        let listener = guard
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "listener closed"))?;
        match listener.accept() {
            Ok(accepted) => Ok(Some(accepted)),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn listener(&self) -> MutexGuard<'_, Option<TcpListener>> {
        self.inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Spawn a thread that turns SIGINT, SIGTERM and SIGHUP into shutdown.
///
/// In [`ShutdownMode::Immediate`] the process exits with status 0 right after
/// the listener is closed; the in-flight connection is not drained. In
/// [`ShutdownMode::Drain`] the accept loop is left to finish its current
/// connection and return; a second signal exits immediately.
#[cfg(unix)]
pub fn install_signal_handlers(
    handle: ShutdownHandle,
    mode: ShutdownMode,
) -> io::Result<std::thread::JoinHandle<()>> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;
    std::thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            for signal in signals.forever() {
                let first = handle.trigger();
                info!(signal, ?mode, "Server shutting down...");
                if mode == ShutdownMode::Immediate || !first {
                    std::process::exit(0);
                }
            }
        })
}
