//! Per-session helper process serving privileged operations for exactly
//! one authenticated user, over a private Unix socket.

#[macro_use]
extern crate tracing;

pub mod dispatch;
pub mod handlers;
pub mod privileges;
pub mod server;
