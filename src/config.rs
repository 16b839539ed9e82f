use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Configuration for the demo server binary. The core library itself takes
/// no configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Bind address
    pub bind_addr: String,

    /// Port to listen on
    pub port: u16,

    /// Number of worker event loops (accepted connections are distributed
    /// round-robin across them)
    pub loops: usize,

    /// TCP nodelay for accepted connections
    pub tcp_nodelay: bool,

    /// Close connections idle longer than this, in milliseconds (0 disables)
    pub idle_timeout_ms: u64,

    /// Log level
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".to_string(),
            port: 6379,
            loops: num_cpus::get(),
            tcp_nodelay: true,
            idle_timeout_ms: 0,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.loops == 0 {
            anyhow::bail!("loops must be > 0");
        }

        if self.port == 0 {
            anyhow::bail!("port must be > 0");
        }

        Ok(())
    }
}
