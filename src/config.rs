use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{Error, Result};

/// Largest message the harness sends in one write unless segmentation is
/// requested.
pub const MAX_MESSAGE_SIZE: usize = 65536;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub client: ClientConfig,
    pub server: ServerConfig,
    pub proxy: ProxyConfig,
    pub deproxy: DeproxyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub hostname: String,
    pub ip: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub ip: String,
}

/// The few facts about the proxy under test needed to compute expectations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub ip: String,
    pub port: u16,
    pub version: String,
    pub cache_enabled: bool,
    pub config_text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeproxyConfig {
    pub auto_parser: bool,
    pub tcp_segmentation: usize,
    pub poll_interval_ms: u64,
    pub max_message_size: usize,
    pub expected_time_delta: u64,
    pub default_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            ip: "127.0.0.1".to_string(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ip: "127.0.0.1".to_string(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            ip: "127.0.0.1".to_string(),
            port: 80,
            version: "0.8".to_string(),
            cache_enabled: false,
            config_text: None,
        }
    }
}

impl Default for DeproxyConfig {
    fn default() -> Self {
        Self {
            auto_parser: true,
            tcp_segmentation: 0,
            poll_interval_ms: 1,
            max_message_size: MAX_MESSAGE_SIZE,
            expected_time_delta: 20,
            default_timeout_secs: 5,
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let name = path
            .to_str()
            .ok_or_else(|| Error::framework(format!("non UTF-8 config path {:?}", path)))?;
        let settings = config::Config::builder()
            .add_source(config::File::with_name(name))
            .build()?;

        let config: Config = settings.try_deserialize()?;
        Ok(config)
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn proxy_addr(&self) -> String {
        format!("{}:{}", self.proxy.ip, self.proxy.port)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.deproxy.poll_interval_ms.max(1))
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.deproxy.default_timeout_secs)
    }

    pub fn expand_path(path: &str) -> String {
        if let Some(rest) = path.strip_prefix('~') {
            if let Some(home) = dirs::home_dir() {
                return format!("{}{}", home.display(), rest);
            }
        }
        path.to_string()
    }
}
