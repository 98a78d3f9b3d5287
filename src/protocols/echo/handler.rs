//! Echo protocol handler on top of `TcpTask`.

use super::parser::{self, Command, ParseResult, FLAG_ECHO, FLAG_HELLO, HELLO_DENIED, HELLO_OK};
use crate::config::Config;
use crate::runtime::{ConnectionRegistry, TaskConfig, TaskHandler, TcpTask};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};

/// Settings that can change on reload.
#[derive(Debug, Clone)]
struct Settings {
    auth_token: Option<String>,
    task: TaskConfig,
}

/// State shared by every echo connection.
#[derive(Debug)]
pub struct EchoState {
    registry: Mutex<ConnectionRegistry>,
    settings: RwLock<Settings>,
    frames_echoed: AtomicU64,
}

impl EchoState {
    pub fn new(config: &Config) -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(ConnectionRegistry::new(config.max_connections)),
            settings: RwLock::new(Settings {
                auth_token: config.auth_token.clone(),
                task: config.task.clone(),
            }),
            frames_echoed: AtomicU64::new(0),
        })
    }

    /// Apply reloaded settings. Open connections keep their task config.
    pub fn apply(&self, config: &Config) {
        let mut settings = self.settings.write().unwrap_or_else(PoisonError::into_inner);
        settings.auth_token = config.auth_token.clone();
        settings.task = config.task.clone();
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.registry().len()
    }

    /// Total frames echoed since start.
    pub fn frames_echoed(&self) -> u64 {
        self.frames_echoed.load(Ordering::Relaxed)
    }

    /// Stop every open connection.
    pub fn stop_all(&self) {
        for (_, task) in self.registry().iter() {
            task.stop();
        }
    }

    fn registry(&self) -> MutexGuard<'_, ConnectionRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settings(&self) -> Settings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn accepts(&self, token: &[u8]) -> bool {
        match &self.settings().auth_token {
            Some(expected) => expected.as_bytes() == token,
            None => true,
        }
    }
}

/// Per-connection handler.
struct EchoSession {
    state: Arc<EchoState>,
    slot: usize,
}

impl TaskHandler for EchoSession {
    fn parse_msg(&self, task: &TcpTask, frame: &[u8]) -> bool {
        match parser::parse(frame) {
            ParseResult::Complete(Command::Hello { token }) => {
                if self.state.accepts(token) {
                    task.verify();
                    debug!(peer = ?task.remote_addr(), "Client verified");
                    task.send_frame(FLAG_HELLO, HELLO_OK)
                } else {
                    warn!(peer = ?task.remote_addr(), "Client presented a bad token");
                    task.send_frame(FLAG_HELLO, HELLO_DENIED);
                    task.stop();
                    true
                }
            }
            ParseResult::Complete(Command::Echo(payload)) => {
                if !task.is_verified() {
                    debug!(peer = ?task.remote_addr(), "Echo before hello dropped");
                    return false;
                }
                trace!(peer = ?task.remote_addr(), len = payload.len(), "Echo");
                self.state.frames_echoed.fetch_add(1, Ordering::Relaxed);
                task.send_frame(FLAG_ECHO, payload)
            }
            ParseResult::Complete(Command::Quit) => {
                debug!(peer = ?task.remote_addr(), "Client quit");
                task.stop();
                true
            }
            ParseResult::UnknownFlag(flag) => {
                warn!(peer = ?task.remote_addr(), flag, "Unknown frame flag");
                false
            }
            ParseResult::Malformed => {
                warn!(
                    peer = ?task.remote_addr(),
                    len = parser::payload_len(frame),
                    "Malformed frame"
                );
                false
            }
        }
    }

    fn on_close(&self, task: &TcpTask) {
        self.state.registry().remove(self.slot);
        trace!(peer = ?task.remote_addr(), slot = self.slot, "Connection released");
    }
}

/// Handle an accepted connection: register it and start its task.
pub async fn handle_connection(stream: TcpStream, state: Arc<EchoState>) {
    let config = state.settings().task;
    let peer = stream.peer_addr().ok();

    let inserted = state.registry().insert_with(|slot| {
        let session = EchoSession {
            state: Arc::clone(&state),
            slot,
        };
        TcpTask::new(stream, Arc::new(session), config)
    });

    match inserted {
        Some((slot, task)) => {
            task.start();
            trace!(peer = ?peer, slot, "Connection registered");
        }
        None => {
            info!(peer = ?peer, "Connection limit reached, dropping connection");
        }
    }
}
