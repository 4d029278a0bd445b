//! Adapters for configuration, Azure services and the Functions host

pub mod azure;
pub mod config;
pub mod http;
