use crate::error::ProxyError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::str::FromStr;

pub const DEFAULT_POOL_CAPACITY: usize = 64;
pub const DEFAULT_MAX_HEADER_SIZE: usize = 16 * 1024;
pub const DEFAULT_CACHE_MEMORY_LIMIT: usize = 256 * 1024;
pub const DEFAULT_MAX_PENDING_BYTES: usize = 1024 * 1024;
pub const DEFAULT_LOOP_WAIT_MILLIS: u64 = 1000;
pub const DEFAULT_STATS_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl LogLevel {
    pub fn to_level_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Trace => log::LevelFilter::Trace,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Error => log::LevelFilter::Error,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Text
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutputType {
    Stdout,
    Stderr,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogTarget {
    #[serde(rename = "type")]
    pub output_type: LogOutputType,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub level: Option<LogLevel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: Option<LogLevel>,
    #[serde(default)]
    pub format: Option<LogFormat>,
    #[serde(default)]
    pub targets: Option<Vec<LogTarget>>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Some(LogLevel::Info),
            format: Some(LogFormat::Text),
            targets: Some(vec![LogTarget {
                output_type: LogOutputType::Stdout,
                path: None,
                level: None,
            }]),
        }
    }
}

/// A `host:port` pair. The host may be a DNS name, an IPv4 literal or a
/// bracketed IPv6 literal; it is kept verbatim so it can be placed in a
/// CONNECT request without resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServerAddr {
    host: String,
    port: u16,
}

impl ServerAddr {
    pub fn new(host: &str, port: u16) -> Result<Self, ProxyError> {
        if port == 0 {
            return Err(ProxyError::InvalidAddress(format!("port 0 is not usable ({})", host)));
        }
        if let Ok(ip) = host.parse::<Ipv6Addr>() {
            return Ok(Self { host: ip.to_string(), port });
        }
        validate_host(host)?;
        Ok(Self { host: host.to_string(), port })
    }

    pub fn parse(s: &str) -> Result<Self, ProxyError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ProxyError::InvalidAddress("address is empty".to_string()));
        }

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (ip, port) = rest
                .split_once("]:")
                .ok_or_else(|| ProxyError::InvalidAddress(format!("expected [ipv6]:port, got '{}'", s)))?;
            ip.parse::<Ipv6Addr>()
                .map_err(|_| ProxyError::InvalidAddress(format!("illegal ipv6 literal '{}'", ip)))?;
            (ip, port)
        } else {
            let (host, port) = s
                .rsplit_once(':')
                .ok_or_else(|| ProxyError::InvalidAddress(format!("expected host:port, got '{}'", s)))?;
            if host.contains(':') {
                return Err(ProxyError::InvalidAddress(format!(
                    "ipv6 hosts must be bracketed, got '{}'",
                    s
                )));
            }
            (host, port)
        };

        let port = port
            .parse::<u16>()
            .map_err(|_| ProxyError::InvalidAddress(format!("illegal port '{}' in '{}'", port, s)))?;
        Self::new(host, port)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_ipv6(&self) -> bool {
        self.host.contains(':')
    }

    /// Resolves to the first socket address. This may block on DNS and is
    /// only meant for startup-time configuration.
    pub fn resolve(&self) -> Result<SocketAddr, ProxyError> {
        let target = if self.is_ipv6() {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        };
        target
            .to_socket_addrs()
            .map_err(|e| ProxyError::InvalidAddress(format!("cannot resolve {}: {}", target, e)))?
            .next()
            .ok_or_else(|| ProxyError::InvalidAddress(format!("{} resolved to no addresses", target)))
    }
}

fn validate_host(host: &str) -> Result<(), ProxyError> {
    if host.is_empty() {
        return Err(ProxyError::InvalidAddress("host is empty".to_string()));
    }
    if host.len() > 253 {
        return Err(ProxyError::InvalidAddress(format!("host too long ({} bytes)", host.len())));
    }
    let legal = host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_');
    if !legal {
        return Err(ProxyError::InvalidAddress(format!("illegal host '{}'", host)));
    }
    Ok(())
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ipv6() {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for ServerAddr {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ServerAddr {
    type Error = ProxyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ServerAddr> for String {
    fn from(addr: ServerAddr) -> Self {
        addr.to_string()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    // Address local clients connect to
    #[serde(default)]
    pub listen_addr: Option<ServerAddr>,
    // Mandatory upstream HTTP proxy
    #[serde(default)]
    pub proxy_addr: Option<ServerAddr>,
    // Destination every tunnel is opened to
    #[serde(default)]
    pub dest_addr: Option<ServerAddr>,
    // Basic authentication towards the upstream proxy
    #[serde(default)]
    pub proxy_username: Option<String>,
    #[serde(default)]
    pub proxy_password: Option<String>,
    #[serde(default)]
    pub pool_capacity: Option<usize>,
    #[serde(default)]
    pub max_header_size: Option<usize>,
    #[serde(default)]
    pub cache_memory_limit: Option<usize>,
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    // Unsent backlog per connection before its peer stops being read
    #[serde(default)]
    pub max_pending_bytes: Option<usize>,
    #[serde(default)]
    pub loop_wait_millis: Option<u64>,
    #[serde(default)]
    pub stats_interval_secs: Option<u64>,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, ProxyError> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| ProxyError::Config(format!("{}: {}", path, e)))
    }

    pub fn to_file(&self, path: &str) -> Result<(), ProxyError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ProxyError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn sample() -> Self {
        Self {
            listen_addr: Some(ServerAddr { host: "127.0.0.1".to_string(), port: 2222 }),
            proxy_addr: Some(ServerAddr { host: "proxy.example.com".to_string(), port: 3128 }),
            dest_addr: Some(ServerAddr { host: "ssh.example.com".to_string(), port: 22 }),
            proxy_username: None,
            proxy_password: None,
            pool_capacity: Some(DEFAULT_POOL_CAPACITY),
            max_header_size: Some(DEFAULT_MAX_HEADER_SIZE),
            cache_memory_limit: Some(DEFAULT_CACHE_MEMORY_LIMIT),
            cache_dir: None,
            max_pending_bytes: Some(DEFAULT_MAX_PENDING_BYTES),
            loop_wait_millis: Some(DEFAULT_LOOP_WAIT_MILLIS),
            stats_interval_secs: Some(DEFAULT_STATS_INTERVAL_SECS),
            logging: Some(LoggingConfig::default()),
        }
    }

    pub fn pool_capacity(&self) -> usize {
        self.pool_capacity.unwrap_or(DEFAULT_POOL_CAPACITY)
    }

    pub fn max_header_size(&self) -> usize {
        self.max_header_size.unwrap_or(DEFAULT_MAX_HEADER_SIZE)
    }

    pub fn cache_memory_limit(&self) -> usize {
        self.cache_memory_limit.unwrap_or(DEFAULT_CACHE_MEMORY_LIMIT)
    }

    pub fn max_pending_bytes(&self) -> usize {
        self.max_pending_bytes.unwrap_or(DEFAULT_MAX_PENDING_BYTES)
    }

    pub fn loop_wait_millis(&self) -> u64 {
        self.loop_wait_millis.unwrap_or(DEFAULT_LOOP_WAIT_MILLIS)
    }

    pub fn stats_interval_secs(&self) -> u64 {
        self.stats_interval_secs.unwrap_or(DEFAULT_STATS_INTERVAL_SECS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hostname_and_ipv4() {
        let addr = ServerAddr::parse("proxy.corp.local:3128").unwrap();
        assert_eq!(addr.host(), "proxy.corp.local");
        assert_eq!(addr.port(), 3128);

        let addr: ServerAddr = "10.0.0.1:22".parse().unwrap();
        assert_eq!(addr.to_string(), "10.0.0.1:22");
    }

    #[test]
    fn test_parse_bracketed_ipv6() {
        let addr = ServerAddr::parse("[::1]:443").unwrap();
        assert_eq!(addr.host(), "::1");
        assert!(addr.is_ipv6());
        assert_eq!(addr.to_string(), "[::1]:443");
    }

    #[test]
    fn test_parse_rejects_malformed_input() {
        for input in ["", "host", ":80", "host:", "host:0", "host:70000", "a b:80", "::1:80", "[::1]80"] {
            assert!(ServerAddr::parse(input).is_err(), "'{}' should be rejected", input);
        }
    }

    #[test]
    fn test_resolve_loopback() {
        let addr = ServerAddr::parse("127.0.0.1:8080").unwrap();
        assert_eq!(addr.resolve().unwrap(), "127.0.0.1:8080".parse().unwrap());
    }

    #[test]
    fn test_config_json_roundtrip_keeps_addresses() {
        let json = r#"{
            "listen_addr": "127.0.0.1:2222",
            "proxy_addr": "proxy:3128",
            "dest_addr": "[2001:db8::1]:22",
            "pool_capacity": 8
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.pool_capacity(), 8);
        assert_eq!(config.max_header_size(), DEFAULT_MAX_HEADER_SIZE);
        assert_eq!(config.max_pending_bytes(), DEFAULT_MAX_PENDING_BYTES);
        assert_eq!(config.dest_addr.as_ref().unwrap().host(), "2001:db8::1");

        let encoded = serde_json::to_string(&config).unwrap();
        assert!(encoded.contains("\"[2001:db8::1]:22\""));
    }

    #[test]
    fn test_config_rejects_bad_address_in_file() {
        let json = r#"{ "proxy_addr": "no-port-here" }"#;
        assert!(serde_json::from_str::<Config>(json).is_err());
    }
}
