//! Webserver-side half of the LinuxIO privilege-separation runtime: the
//! session registry, the per-session bridge supervision, and the RPC
//! client surface the HTTP layer is built on.
//!
//! This daemon never holds root. Everything privileged happens in the
//! per-session bridge processes, reached over private Unix sockets.

#[macro_use]
extern crate tracing;

pub mod auth;
pub mod bridge;
pub mod client;
pub mod config;
mod log;
pub mod pinning;
pub mod session;
pub mod service;
