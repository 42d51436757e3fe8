use std::env;

use crate::proxy::error::ConfigError;

pub const DEFAULT_MOUNT: &str = "/api";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Proxy settings read once at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Prepended verbatim to the inbound path; not validated here
    pub backend_url: String,
    /// Path prefix served by the proxy, e.g. `/api`
    pub mount: String,
    pub port: u16,
    /// Resolve backend hosts to IPv4 addresses only
    pub force_ipv4: bool,
    pub max_body_bytes: usize,
}

impl ProxyConfig {
    pub fn new(backend_url: impl Into<String>) -> Self {
        Self {
            backend_url: backend_url.into(),
            mount: DEFAULT_MOUNT.to_string(),
            port: DEFAULT_PORT,
            force_ipv4: false,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    /// Read `BACKEND_API_URL`, `PROXY_MOUNT`, `PORT`, `PROXY_FORCE_IPV4`
    /// and `PROXY_MAX_BODY_BYTES`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let backend_url = lookup("BACKEND_API_URL")
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .ok_or(ConfigError::Missing("BACKEND_API_URL"))?;

        let mut config = Self::new(backend_url);

        if let Some(mount) = lookup("PROXY_MOUNT") {
            config = config.with_mount(mount);
        }

        if let Some(port) = lookup("PORT") {
            config.port = port.trim().parse().map_err(|e: std::num::ParseIntError| {
                ConfigError::Invalid {
                    key: "PORT",
                    value: port.clone(),
                    reason: e.to_string(),
                }
            })?;
        }

        if let Some(flag) = lookup("PROXY_FORCE_IPV4") {
            config.force_ipv4 = parse_flag("PROXY_FORCE_IPV4", &flag)?;
        }

        if let Some(limit) = lookup("PROXY_MAX_BODY_BYTES") {
            config.max_body_bytes = limit.trim().parse().map_err(|e: std::num::ParseIntError| {
                ConfigError::Invalid {
                    key: "PROXY_MAX_BODY_BYTES",
                    value: limit.clone(),
                    reason: e.to_string(),
                }
            })?;
        }

        Ok(config)
    }

    /// Normalize to a leading slash and no trailing slash; `/` becomes the root scope
    pub fn with_mount(mut self, mount: impl AsRef<str>) -> Self {
        let trimmed = mount.as_ref().trim().trim_matches('/');
        self.mount = if trimmed.is_empty() {
            String::new()
        } else {
            format!("/{trimmed}")
        };
        self
    }
}

fn parse_flag(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::Invalid {
            key,
            value: other.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}
