//! Echo protocol over gutil frames.
//!
//! A small authenticated echo service that exercises the connection core
//! end to end: framing, verification, queued sends and stop handling.
//!
//! ## Protocol Format
//!
//! Every message is one frame: a 3-byte big-endian total length (header
//! included), a flag byte, then the payload.
//!
//! ```text
//! +--------+--------+--------+--------+-------------------+
//! |      length (24-bit BE)  |  flag  |  payload ...      |
//! +--------+--------+--------+--------+-------------------+
//! ```
//!
//! Flags:
//! - `0` echo: the payload comes back in a flag-0 frame. Ignored until the
//!   connection has said hello.
//! - `1` hello: the payload is the auth token. The server answers with a
//!   flag-1 frame, `ok` on success (the connection is verified) or
//!   `denied`, after which the connection is closed. Any token is accepted
//!   when none is configured.
//! - `2` quit: the server closes the connection.
//!
//! Other flags are logged and ignored. A connection that does not say hello
//! within the verify timeout is closed.
//!
//! ```text
//! Client: [00 00 09 01] "token"   Server: [00 00 06 01] "ok"
//! Client: [00 00 08 00] "ping"    Server: [00 00 08 00] "ping"
//! Client: [00 00 04 02]           Server: <close>
//! ```

pub mod handler;
pub mod parser;

pub use handler::{handle_connection, EchoState};
