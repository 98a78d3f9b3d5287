//! gutil: networking building blocks for game backend services.
//!
//! - [`runtime`]: byte buffer, frame codec and per-connection tasks
//! - [`server`]: TCP acceptor
//! - [`client`]: outbound connections
//! - [`lifecycle`]: init / main loop / reload / finalize driver with signals
//! - [`protocols`]: application protocols built on frames
//! - [`config`]: configuration for the bundled echo server

pub mod client;
pub mod config;
pub mod lifecycle;
pub mod protocols;
pub mod runtime;
pub mod server;
