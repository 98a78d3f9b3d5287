//! Outbound connections with the same socket options as accepted ones.

use crate::runtime::{TaskConfig, TaskHandler, TcpTask};
use crate::server::configure_stream;
use std::io;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Dial `address` and apply keep-alive, no-delay and buffer sizes.
pub async fn connect(address: &str) -> io::Result<TcpStream> {
    let stream = TcpStream::connect(address).await.map_err(|e| {
        warn!(address, error = %e, "Failed to connect");
        e
    })?;
    configure_stream(&stream)?;
    debug!(address, local = ?stream.local_addr().ok(), "Connected");
    Ok(stream)
}

/// Dial `address` and start a task over the new connection.
pub async fn connect_task(
    address: &str,
    handler: Arc<dyn TaskHandler>,
    config: TaskConfig,
) -> io::Result<Arc<TcpTask>> {
    let stream = connect(address).await?;
    let task = TcpTask::new(stream, handler, config);
    task.start();
    Ok(task)
}
