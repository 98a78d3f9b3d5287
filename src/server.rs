//! TCP acceptor.
//!
//! Binds once, then accepts connections on a background task. Each accept is
//! bounded by a short rolling deadline so the loop notices `close` without a
//! wakeup from the outside. Accept failures are retried immediately; the loop
//! runs until the server is closed.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, trace, warn};

/// Upper bound on a single accept wait.
pub const ACCEPT_DEADLINE: Duration = Duration::from_secs(1);

/// Send and receive buffer size applied to every connection.
pub const SOCKET_BUFFER_SIZE: usize = 128 * 1024;

/// Idle time before keep-alive probes start.
pub const KEEPALIVE_IDLE: Duration = Duration::from_secs(60);

/// Listen backlog.
const BACKLOG: i32 = 1024;

/// Apply the standard connection options: no Nagle, keep-alive, 128 KiB
/// socket buffers.
pub fn configure_stream(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;

    let socket = SockRef::from(stream);
    socket.set_keepalive(true)?;
    socket.set_tcp_keepalive(&TcpKeepalive::new().with_time(KEEPALIVE_IDLE))?;
    socket.set_send_buffer_size(SOCKET_BUFFER_SIZE)?;
    socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE)?;
    Ok(())
}

/// Handle to a running accept loop.
#[derive(Debug)]
pub struct TcpServer {
    local_addr: SocketAddr,
    closed: Arc<AtomicBool>,
}

impl TcpServer {
    /// Bind `address` and start accepting connections.
    ///
    /// Every accepted connection is configured with [`configure_stream`] and
    /// passed to `handler` on its own task. Resolution, bind and listen
    /// errors are returned and nothing is spawned.
    pub async fn bind_accept<H, Fut>(address: &str, handler: H) -> io::Result<Self>
    where
        H: Fn(TcpStream, SocketAddr) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let addr = tokio::net::lookup_host(address)
            .await
            .map_err(|e| {
                warn!(address, error = %e, "Failed to resolve listen address");
                e
            })?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("no address found for {address}"),
                )
            })?;

        let listener = create_listener(addr).map_err(|e| {
            warn!(address = %addr, error = %e, "Failed to listen");
            e
        })?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "Server listening");

        let closed = Arc::new(AtomicBool::new(false));
        tokio::spawn(accept_loop(listener, Arc::new(handler), Arc::clone(&closed)));

        Ok(Self { local_addr, closed })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting. The listener is released within one accept deadline.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!(address = %self.local_addr, "Server closing");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

async fn accept_loop<H, Fut>(listener: TcpListener, handler: Arc<H>, closed: Arc<AtomicBool>)
where
    H: Fn(TcpStream, SocketAddr) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    while !closed.load(Ordering::Acquire) {
        let (stream, peer) = match tokio::time::timeout(ACCEPT_DEADLINE, listener.accept()).await {
            Ok(Ok(accepted)) => accepted,
            Ok(Err(e)) => {
                debug!(error = %e, "Accept failed");
                continue;
            }
            Err(_) => continue,
        };

        if let Err(e) = configure_stream(&stream) {
            warn!(peer = %peer, error = %e, "Failed to configure connection");
        }
        trace!(peer = %peer, "Accepted connection");

        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            handler(stream, peer).await;
        });
    }

    debug!(address = ?listener.local_addr().ok(), "Accept loop finished");
}

/// Create a non-blocking listener with SO_REUSEADDR set.
fn create_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    TcpListener::from_std(socket.into())
}
