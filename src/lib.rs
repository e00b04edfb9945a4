//! cotps-bot: authenticated polling client for the COTPS order service.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod http;
pub mod session;
pub mod platforms;
pub mod engine;
