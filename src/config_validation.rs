//! Startup checks for a loaded [`Config`].
//!
//! Errors make the configuration unusable; warnings are logged and the
//! process starts anyway.

use crate::config::{Config, ServerAddr};
use std::net::IpAddr;

/// Minimum room for a status line and a blank line.
const MIN_HEADER_SIZE: usize = 64;

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
}

impl ValidationResult {
    pub fn success() -> Self {
        Self {
            is_valid: true,
            errors: vec![],
            warnings: vec![],
            suggestions: vec![],
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
        self.is_valid = false;
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn add_suggestion(&mut self, suggestion: String) {
        self.suggestions.push(suggestion);
    }
}

pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate(config: &Config) -> ValidationResult {
        let mut result = ValidationResult::success();

        Self::validate_addresses(config, &mut result);
        Self::validate_credentials(config, &mut result);
        Self::validate_limits(config, &mut result);

        result
    }

    fn validate_addresses(config: &Config, result: &mut ValidationResult) {
        let required = [
            ("listen address (-l)", &config.listen_addr),
            ("proxy address (-r)", &config.proxy_addr),
            ("destination address (-t)", &config.dest_addr),
        ];
        for (name, addr) in required {
            if addr.is_none() {
                result.add_error(format!("{} is required", name));
            }
        }

        if let (Some(listen), Some(proxy)) = (&config.listen_addr, &config.proxy_addr) {
            if listen == proxy {
                result.add_error(format!(
                    "listen address {} equals the proxy address; tunnels would loop back into this process",
                    listen
                ));
            }
        }

        if let Some(listen) = &config.listen_addr {
            if listen.port() < 1024 {
                result.add_warning(format!(
                    "Using privileged port {} - may require elevated privileges",
                    listen.port()
                ));
            }
            if is_unspecified(listen) {
                result.add_warning(format!(
                    "Listening on {} accepts tunnel clients from every interface",
                    listen
                ));
                result.add_suggestion("Bind to 127.0.0.1 unless remote clients need the tunnel".to_string());
            }
        }
    }

    fn validate_credentials(config: &Config, result: &mut ValidationResult) {
        match (&config.proxy_username, &config.proxy_password) {
            (Some(username), _) if username.is_empty() => {
                result.add_error("proxy username is empty".to_string());
            }
            (Some(username), _) if username.contains(':') => {
                result.add_error("proxy username must not contain ':'".to_string());
            }
            (Some(_), None) => {
                result.add_warning("proxy username given without password; an empty password will be sent".to_string());
            }
            (None, Some(_)) => {
                result.add_warning("proxy password given without username; it is ignored".to_string());
            }
            _ => {}
        }
    }

    fn validate_limits(config: &Config, result: &mut ValidationResult) {
        if config.max_header_size() < MIN_HEADER_SIZE {
            result.add_error(format!(
                "max_header_size {} is below the minimum of {} bytes",
                config.max_header_size(),
                MIN_HEADER_SIZE
            ));
        }

        if config.pool_capacity() == 0 {
            result.add_warning("pool_capacity is 0: tunnels are never reused".to_string());
        }

        if config.loop_wait_millis() == 0 {
            result.add_warning("loop_wait_millis is 0: the event loop will busy-poll".to_string());
        }

        if config.max_pending_bytes() == 0 {
            result.add_warning("max_pending_bytes is 0: each side stops reading whenever its peer has unsent data".to_string());
        }

        if config.cache_memory_limit() == 0 {
            result.add_suggestion(
                "cache_memory_limit is 0: every byte sent before the tunnel is up goes to disk".to_string(),
            );
        }

        if let Some(dir) = &config.cache_dir {
            if !dir.is_dir() {
                result.add_error(format!("cache_dir {} is not a directory", dir.display()));
            }
        }
    }
}

fn is_unspecified(addr: &ServerAddr) -> bool {
    addr.host()
        .parse::<IpAddr>()
        .map(|ip| ip.is_unspecified())
        .unwrap_or(false)
}
