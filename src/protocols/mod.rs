//! Protocol implementations on top of `TcpTask`.
//!
//! - `echo`: authenticated frame echo service
//!
//! A protocol supplies a `TaskHandler` that interprets frame flags and
//! payloads; framing and socket handling stay in the runtime.

pub mod echo;
