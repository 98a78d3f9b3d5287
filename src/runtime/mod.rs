//! Framed TCP connection runtime.
//!
//! Layers, bottom up:
//! - `buffer`: `ByteBuffer`, the growable cursor buffer behind every socket
//! - `frame`: the 3-byte length + flag wire format and read-at-least helper
//! - `task`: `TcpTask`, one connection with its receive and send loops
//! - `connection`: `ConnectionRegistry`, a slab of live tasks

pub mod buffer;
pub mod connection;
pub mod frame;
pub mod task;

pub use buffer::ByteBuffer;
pub use connection::ConnectionRegistry;
pub use frame::{Frame, FrameError, HEADER_SIZE, MAX_FRAME_SIZE};
pub use task::{TaskConfig, TaskError, TaskHandler, TcpTask};
