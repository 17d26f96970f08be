//! Shared fixtures and end-to-end flows through [`crate::ServiceProvider`].

pub mod fixtures;
