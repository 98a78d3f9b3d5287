//! gutil-echo: framed TCP echo server
//!
//! Runs the echo protocol on the gutil connection core:
//! - Length-prefixed frames with a flag byte
//! - Hello handshake with an optional auth token
//! - Unverified connections dropped after a timeout
//! - SIGHUP re-reads the configuration file
//! - Configuration via CLI arguments or TOML file

use gutil::config::Config;
use gutil::lifecycle::{Server, ServerHandle, Service};
use gutil::protocols::echo::{handle_connection, EchoState};
use gutil::server::TcpServer;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

const TICK: Duration = Duration::from_millis(100);
const STATS_INTERVAL: Duration = Duration::from_secs(10);

struct EchoService {
    config: Config,
    handle: ServerHandle,
    state: Arc<EchoState>,
    listener: Option<TcpServer>,
    last_stats: Instant,
}

impl EchoService {
    fn new(config: Config, handle: ServerHandle) -> Self {
        let state = EchoState::new(&config);
        Self {
            config,
            handle,
            state,
            listener: None,
            last_stats: Instant::now(),
        }
    }
}

impl Service for EchoService {
    fn init(&mut self) -> bool {
        let shared = Arc::clone(&self.state);
        let bind = TcpServer::bind_accept(&self.config.listen, move |stream, _peer| {
            handle_connection(stream, Arc::clone(&shared))
        });

        match tokio::runtime::Handle::current().block_on(bind) {
            Ok(listener) => {
                info!(address = %listener.local_addr(), "Listening");
                self.listener = Some(listener);
                true
            }
            Err(e) => {
                error!(address = %self.config.listen, error = %e, "Failed to bind");
                false
            }
        }
    }

    fn main_loop(&mut self) {
        std::thread::sleep(TICK);

        if self.last_stats.elapsed() >= STATS_INTERVAL {
            self.last_stats = Instant::now();
            debug!(
                connections = self.state.connection_count(),
                echoed = self.state.frames_echoed(),
                "Stats"
            );
        }

        if self.listener.as_ref().map_or(true, TcpServer::is_closed) {
            error!("Listener stopped, shutting down");
            self.handle.close();
        }
    }

    fn reload(&mut self) {
        match self.config.reload() {
            Ok(config) => {
                if config.listen != self.config.listen {
                    warn!(
                        current = %self.config.listen,
                        requested = %config.listen,
                        "Listen address change needs a restart"
                    );
                }
                self.state.apply(&config);
                self.config = config;
                info!("Configuration reloaded");
            }
            Err(e) => {
                error!(error = %e, "Reload failed, keeping current configuration");
            }
        }
    }

    fn finalize(&mut self) -> bool {
        if let Some(listener) = self.listener.take() {
            listener.close();
        }
        self.state.stop_all();
        info!(
            connections = self.state.connection_count(),
            echoed = self.state.frames_echoed(),
            "Echo service stopped"
        );
        true
    }
}

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
        listen = %config.listen,
        workers = ?config.workers,
        verify_timeout_secs = config.task.verify_timeout.as_secs(),
        max_frame_size = config.task.max_frame_size,
        max_connections = config.max_connections,
        auth = config.auth_token.is_some(),
        "Starting gutil-echo server"
    );

    let mut server = Server::new();
    if let Some(workers) = config.workers {
        server.set_cpu_num(workers);
    }

    let mut service = EchoService::new(config, server.handle());
    if !server.run(&mut service) {
        return Err("server exited with errors".into());
    }
    Ok(())
}
