//! Core library for the rust_scope microscope server.
//!
//! Devices on the rig speak line-oriented serial protocols, often several
//! logical devices per physical port, and answer out of order. This crate
//! routes those messages and exposes the rig to remote clients:
//!
//! - [`messaging`]: per-port message managers, response correlation,
//!   asynchronous devices and device namespaces.
//! - [`rpc`]: a request/reply command server with describe-driven client
//!   proxies and an out-of-band interrupt channel.
//! - [`properties`]: publish/subscribe broadcast of named property values.
//! - [`scope`]: wiring of a [`config::ScopeConfig`] into all of the above.

pub mod config;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod net;
pub mod properties;
pub mod rpc;
pub mod scope;

pub use error::{AppResult, ScopeError};
