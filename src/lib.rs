pub mod cache;
pub mod client;
pub mod config;
pub mod config_validation;
pub mod connection;
pub mod error;
pub mod handshake;
pub mod listener;
pub mod logging;
pub mod metrics;
pub mod poller;
pub mod tunnel;

pub use client::{ExitHandle, ProxyClient};
pub use config::{Config, ServerAddr};
pub use error::ProxyError;
