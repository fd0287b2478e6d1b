use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Setup error: {0}")]
    Setup(String),

    #[error("Handshake error: {0}")]
    Handshake(String),

    #[error("Proxy response exceeds header buffer of {capacity} bytes")]
    HeaderOverflow { capacity: usize },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Illegal tunnel transition: {from} -> {to}")]
    InvalidTransition { from: &'static str, to: &'static str },
}

impl ProxyError {
    /// Only startup problems end the process; everything else is absorbed
    /// by tearing down the affected tunnel.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProxyError::Config(_) | ProxyError::InvalidAddress(_) | ProxyError::Setup(_)
        )
    }
}
