//! Per-connection task: one receive loop and one send loop over a socket.
//!
//! ## Lifecycle
//!
//! ```text
//! unstarted(-1) --start--> open(0) --close--> closed(1)
//!       ^                                        |
//!       +------------- reset (verified) ---------+
//! ```
//!
//! `start` spawns both loops. Any read or write error, a protocol violation,
//! a verification timeout or a `stop` request ends in `close`, which runs at
//! most once per start and notifies the handler through `on_close`.
//!
//! ## Loops
//!
//! The receive loop owns the receive buffer. It reads until a complete frame
//! is buffered, hands the frame (header included) to `TaskHandler::parse_msg`
//! and consumes it. Once the task is closed no further frame is delivered,
//! even if more are already buffered.
//!
//! The send loop waits for a send signal, a stop signal or the verification
//! deadline. On a send signal it drains the shared send buffer into a private
//! scratch buffer under the lock, then writes the scratch buffer outside it.
//! Signals are coalesced: a pending signal absorbs new ones, and the loop
//! always drains whatever is queued when it wakes.

use crate::runtime::buffer::ByteBuffer;
use crate::runtime::frame::{self, read_at_least, Decode, FrameError};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

const STATE_UNSTARTED: i32 = -1;
const STATE_OPEN: i32 = 0;
const STATE_CLOSED: i32 = 1;

/// Default time a connection may stay open without being verified.
pub const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// Application callbacks for a connection.
pub trait TaskHandler: Send + Sync + 'static {
    /// Handle one complete frame, header included.
    ///
    /// Returns whether the frame was understood. The framing layer only logs
    /// a `false` result.
    fn parse_msg(&self, task: &TcpTask, frame: &[u8]) -> bool;

    /// Called once each time the task transitions to closed.
    fn on_close(&self, task: &TcpTask);
}

/// Tunables for a connection task.
#[derive(Debug, Clone)]
pub struct TaskConfig {
    /// Largest total frame length accepted from the peer.
    pub max_frame_size: usize,
    /// Deadline after start for the application to call `verify`.
    pub verify_timeout: Duration,
    /// Initial size of the receive and send buffers.
    pub initial_buffer_size: usize,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_frame_size: frame::MAX_FRAME_SIZE,
            verify_timeout: DEFAULT_VERIFY_TIMEOUT,
            initial_buffer_size: crate::runtime::buffer::DEFAULT_INITIAL_SIZE,
        }
    }
}

/// Why a connection loop ended.
#[derive(Debug)]
pub enum TaskError {
    /// Socket read or write failed, including EOF.
    Io(io::Error),
    /// The peer sent a frame with an out-of-bounds length.
    Frame(FrameError),
    /// The connection was not verified before the deadline.
    VerifyTimeout,
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::Io(e) => write!(f, "I/O error: {e}"),
            TaskError::Frame(e) => write!(f, "protocol violation: {e}"),
            TaskError::VerifyTimeout => write!(f, "verification timed out"),
        }
    }
}

impl std::error::Error for TaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TaskError::Io(e) => Some(e),
            TaskError::Frame(e) => Some(e),
            TaskError::VerifyTimeout => None,
        }
    }
}

impl From<io::Error> for TaskError {
    fn from(e: io::Error) -> Self {
        TaskError::Io(e)
    }
}

impl From<FrameError> for TaskError {
    fn from(e: FrameError) -> Self {
        TaskError::Frame(e)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Outgoing bytes shared between producers and the send loop.
#[derive(Debug)]
pub(crate) struct SendQueue {
    buf: Mutex<ByteBuffer>,
}

impl SendQueue {
    pub(crate) fn new(initial: usize) -> Self {
        Self {
            buf: Mutex::new(ByteBuffer::with_capacity(initial)),
        }
    }

    pub(crate) fn push(&self, data: &[u8]) {
        lock(&self.buf).append(data);
    }

    /// Move everything queued into `scratch` and empty the queue.
    pub(crate) fn drain_into(&self, scratch: &mut ByteBuffer) {
        let mut shared = lock(&self.buf);
        if shared.read_ready() {
            scratch.append(shared.read_buf());
            shared.reset();
        }
    }

    pub(crate) fn clear(&self) {
        lock(&self.buf).reset();
    }
}

/// Write queued bytes until both the queue and `scratch` are empty.
pub(crate) async fn write_pending<W>(
    queue: &SendQueue,
    writer: &mut W,
    scratch: &mut ByteBuffer,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        queue.drain_into(scratch);
        if !scratch.read_ready() {
            break;
        }

        let n = writer.write(scratch.read_buf()).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
        }
        scratch.read_flip(n);
    }
    writer.flush().await
}

/// Read frames from `reader`, calling `on_frame` for each one until it
/// returns `false`.
///
/// Otherwise only returns on an I/O error or a frame length outside
/// `HEADER_SIZE..=max_frame_size`.
pub(crate) async fn recv_frames<R, F>(
    reader: &mut R,
    buf: &mut ByteBuffer,
    max_frame_size: usize,
    mut on_frame: F,
) -> Result<(), TaskError>
where
    R: AsyncRead + Unpin,
    F: FnMut(&[u8]) -> bool,
{
    loop {
        match frame::decode(buf.read_buf(), max_frame_size)? {
            Decode::NeedData(missing) => {
                read_at_least(reader, buf, missing).await?;
            }
            Decode::Complete(length) => {
                let more = on_frame(&buf.read_buf()[..length]);
                buf.read_flip(length);
                if !more {
                    return Ok(());
                }
            }
        }
    }
}

/// Signal channels, recreated on every reset.
struct Signals {
    send_tx: mpsc::Sender<()>,
    stop_tx: mpsc::Sender<()>,
    send_rx: Option<mpsc::Receiver<()>>,
    stop_rx: Option<mpsc::Receiver<()>>,
}

impl Signals {
    fn new() -> Self {
        let (send_tx, send_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        Self {
            send_tx,
            stop_tx,
            send_rx: Some(send_rx),
            stop_rx: Some(stop_rx),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Endpoints {
    remote: Option<SocketAddr>,
    local: Option<SocketAddr>,
}

impl Endpoints {
    fn of(stream: &TcpStream) -> Self {
        Self {
            remote: stream.peer_addr().ok(),
            local: stream.local_addr().ok(),
        }
    }
}

/// One live TCP connection.
pub struct TcpTask {
    state: AtomicI32,
    verified: AtomicBool,
    config: TaskConfig,
    handler: Arc<dyn TaskHandler>,
    stream: Mutex<Option<TcpStream>>,
    endpoints: Mutex<Endpoints>,
    send_queue: SendQueue,
    signals: Mutex<Signals>,
    loops: Mutex<Vec<AbortHandle>>,
}

impl fmt::Debug for TcpTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTask")
            .field("state", &self.state.load(Ordering::Acquire))
            .field("verified", &self.is_verified())
            .field("remote", &self.remote_addr())
            .finish()
    }
}

impl TcpTask {
    /// Wrap an accepted or dialed stream. The task starts unstarted.
    pub fn new(stream: TcpStream, handler: Arc<dyn TaskHandler>, config: TaskConfig) -> Arc<Self> {
        let endpoints = Endpoints::of(&stream);
        let send_queue = SendQueue::new(config.initial_buffer_size);

        Arc::new(Self {
            state: AtomicI32::new(STATE_UNSTARTED),
            verified: AtomicBool::new(false),
            config,
            handler,
            stream: Mutex::new(Some(stream)),
            endpoints: Mutex::new(endpoints),
            send_queue,
            signals: Mutex::new(Signals::new()),
            loops: Mutex::new(Vec::with_capacity(2)),
        })
    }

    /// Launch the receive and send loops.
    ///
    /// Must be called from within a tokio runtime. Returns `false` if the
    /// task was not in the unstarted state.
    pub fn start(self: &Arc<Self>) -> bool {
        if self
            .state
            .compare_exchange(STATE_UNSTARTED, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let stream = lock(&self.stream).take();
        let receivers = {
            let mut signals = lock(&self.signals);
            (signals.send_rx.take(), signals.stop_rx.take())
        };
        let (stream, send_rx, stop_rx) = match (stream, receivers) {
            (Some(stream), (Some(send_rx), Some(stop_rx))) => (stream, send_rx, stop_rx),
            _ => {
                warn!(peer = ?self.remote_addr(), "Task started without a stream");
                self.close();
                return false;
            }
        };

        let deadline = Instant::now() + self.config.verify_timeout;
        let (mut reader, mut writer) = stream.into_split();

        // Held while spawning so a concurrent close sees both handles.
        let mut loops = lock(&self.loops);

        let task = Arc::clone(self);
        let recv = tokio::spawn(async move {
            let mut buf = ByteBuffer::with_capacity(task.config.initial_buffer_size);
            let max_frame_size = task.config.max_frame_size;
            let result = recv_frames(&mut reader, &mut buf, max_frame_size, |frame| {
                // A closed task delivers nothing, buffered frames included.
                if task.is_closed() {
                    return false;
                }
                if !task.handler.parse_msg(&task, frame) {
                    debug!(peer = ?task.remote_addr(), len = frame.len(), "Frame not handled");
                }
                !task.is_closed()
            })
            .await;
            match result {
                Ok(()) => trace!(peer = ?task.remote_addr(), "Receive loop stopped"),
                Err(e) => task.log_exit("receive", &e),
            }
            task.close();
        });
        loops.push(recv.abort_handle());

        let task = Arc::clone(self);
        let send = tokio::spawn(async move {
            if let Err(e) = task.send_loop(&mut writer, send_rx, stop_rx, deadline).await {
                task.log_exit("send", &e);
            }
            task.close();
        });
        loops.push(send.abort_handle());
        drop(loops);

        info!(peer = ?self.remote_addr(), "Connection started");
        true
    }

    async fn send_loop<W>(
        &self,
        writer: &mut W,
        mut send_rx: mpsc::Receiver<()>,
        mut stop_rx: mpsc::Receiver<()>,
        deadline: Instant,
    ) -> Result<(), TaskError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut scratch = ByteBuffer::with_capacity(self.config.initial_buffer_size);
        let verify_timer = tokio::time::sleep_until(deadline);
        tokio::pin!(verify_timer);
        let mut verify_pending = true;

        loop {
            tokio::select! {
                biased;

                Some(()) = send_rx.recv() => {
                    write_pending(&self.send_queue, writer, &mut scratch).await?;
                }
                _ = stop_rx.recv() => {
                    trace!(peer = ?self.remote_addr(), "Send loop stopped");
                    return Ok(());
                }
                _ = &mut verify_timer, if verify_pending => {
                    verify_pending = false;
                    if !self.is_verified() {
                        return Err(TaskError::VerifyTimeout);
                    }
                }
            }
        }
    }

    fn log_exit(&self, side: &str, error: &TaskError) {
        match error {
            TaskError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                debug!(peer = ?self.remote_addr(), side, "Peer closed connection");
            }
            _ => {
                warn!(peer = ?self.remote_addr(), side, error = %error, "Connection loop failed");
            }
        }
    }

    /// Tear the connection down. Only the first call after `start` has any
    /// effect; it drops the socket, clears the send buffer and calls
    /// `on_close`.
    pub fn close(&self) {
        if self
            .state
            .compare_exchange(STATE_OPEN, STATE_CLOSED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        info!(peer = ?self.remote_addr(), "Connection closed");
        self.send_queue.clear();

        if lock(&self.signals).stop_tx.try_send(()).is_err() {
            trace!(peer = ?self.remote_addr(), "Stop signal already pending");
        }
        for handle in lock(&self.loops).drain(..) {
            handle.abort();
        }

        self.handler.on_close(self);
    }

    /// Same as `close`.
    pub fn terminate(&self) {
        self.close();
    }

    /// Ask the send loop to stop, which then closes the task.
    ///
    /// Returns `false` if the task is not open or a stop is already pending.
    pub fn stop(&self) -> bool {
        if self.is_closed() {
            warn!(peer = ?self.remote_addr(), "Stop on a task that is not open");
            return false;
        }
        match lock(&self.signals).stop_tx.try_send(()) {
            Ok(()) => true,
            Err(_) => {
                warn!(peer = ?self.remote_addr(), "Stop already pending");
                false
            }
        }
    }

    /// Return a closed, verified task to the unstarted state over a new
    /// stream so its slot can be reused. Call `start` afterwards.
    pub fn reset(&self, stream: TcpStream) -> bool {
        if self.state.load(Ordering::Acquire) != STATE_CLOSED || !self.is_verified() {
            return false;
        }

        *lock(&self.endpoints) = Endpoints::of(&stream);
        *lock(&self.stream) = Some(stream);
        *lock(&self.signals) = Signals::new();
        self.send_queue.clear();

        if self
            .state
            .compare_exchange(STATE_CLOSED, STATE_UNSTARTED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        info!(peer = ?self.remote_addr(), "Connection reset");
        true
    }

    /// Queue raw bytes for sending. Returns `false` if the task is not open.
    pub fn send_bytes(&self, data: &[u8]) -> bool {
        if self.is_closed() {
            return false;
        }
        self.send_queue.push(data);
        self.send_signal();
        true
    }

    /// Encode `payload` into a frame and queue it.
    pub fn send_frame(&self, flag: u8, payload: &[u8]) -> bool {
        match frame::encode(flag, payload, self.config.max_frame_size) {
            Ok(bytes) => self.send_bytes(&bytes),
            Err(e) => {
                warn!(peer = ?self.remote_addr(), error = %e, "Refusing to send frame");
                false
            }
        }
    }

    /// Wake the send loop. A pending wake absorbs this one.
    pub fn send_signal(&self) {
        let _ = lock(&self.signals).send_tx.try_send(());
    }

    /// Mark the connection as having passed the application handshake.
    pub fn verify(&self) {
        self.verified.store(true, Ordering::Release);
    }

    pub fn is_verified(&self) -> bool {
        self.verified.load(Ordering::Acquire)
    }

    /// True unless the task is open (unstarted counts as closed).
    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) != STATE_OPEN
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        lock(&self.endpoints).remote
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.endpoints).local
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }
}
