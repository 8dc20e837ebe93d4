//! fortytwo: a single-connection request/response server
//!
//! Clients send bytes terminated by `"42"`. The server passes the request to
//! the handler loaded from a script and writes back the string it returns,
//! then closes the connection.
//!
//! Features:
//! - One connection at a time, no keep-alive
//! - Growable request buffer with an optional size cap
//! - Request and response counters
//! - Shutdown on SIGINT, SIGTERM or SIGHUP
//! - Configuration via CLI arguments or TOML file

mod config;
mod engine;
mod runtime;
mod server;
mod telemetry;

use config::Config;
use engine::TemplateEngine;
use server::Server;
use telemetry::Telemetry;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        port = config.port,
        script = %config.script.display(),
        initial_buffer_size = config.initial_buffer_size,
        max_frame_size = ?config.max_frame_size,
        shutdown = ?config.shutdown,
        "Starting fortytwo server"
    );

    let engine = TemplateEngine::load(&config.script)?;
    let telemetry = Telemetry::init();

    let mut server = Server::bind(&config, engine, std::sync::Arc::clone(&telemetry))?;
    let _signals = runtime::install_signal_handlers(server.shutdown_handle(), config.shutdown)?;

    server.run()?;

    let stats = telemetry.snapshot();
    info!(
        state = ?server.state(),
        requests = stats.request_count,
        ok_responses = stats.ok_response_count,
        started = %stats.start_time,
        uptime_secs = stats.uptime.as_secs(),
        "Final telemetry"
    );
    Ok(())
}
