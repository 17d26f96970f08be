//! Logging initialization for the `saml-sp` binary.
//!
//! The library itself only emits `tracing` events; embedding applications
//! install their own subscriber.

mod tracing_init;

pub use tracing_init::*;
