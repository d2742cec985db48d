//! Server configuration
//!
//! Layered with figment: built-in defaults, then an optional TOML file, then
//! `PROTOMUD_*` environment variables (`__` separates nested keys, e.g.
//! `PROTOMUD_RUNTIME__ROUTER_ALIAS`).

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::lua::SandboxConfig;
use crate::objects::ObjectId;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind_addr: SocketAddr,
    /// SQLite file; `None` = in-memory
    pub db_path: Option<String>,
    pub runtime: RuntimeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            db_path: None, // None = in-memory
            runtime: RuntimeConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from defaults, an optional TOML file, and the environment
    pub fn load(file: Option<&Path>) -> anyhow::Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = file {
            figment = figment.merge(Toml::file(path));
        }
        let config = figment
            .merge(Env::prefixed("PROTOMUD_").split("__"))
            .extract()?;
        Ok(config)
    }
}

/// Object runtime settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Alias of the object that receives connection events
    pub router_alias: String,
    /// Deadline for each top-level dispatch, in milliseconds (0 = none)
    pub dispatch_timeout_ms: u64,
    /// Lua heap limit in bytes
    pub max_memory: usize,
    /// Instructions between deadline checks
    pub hook_interval: u32,
    /// Objects loaded into the cache at startup
    pub preload: Vec<ObjectId>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let sandbox = SandboxConfig::default();
        Self {
            router_alias: "router".to_string(),
            dispatch_timeout_ms: 5_000,
            max_memory: sandbox.max_memory,
            hook_interval: sandbox.hook_interval,
            preload: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    pub fn sandbox(&self) -> SandboxConfig {
        SandboxConfig {
            max_memory: self.max_memory,
            hook_interval: self.hook_interval,
        }
    }

    pub fn dispatch_timeout(&self) -> Option<Duration> {
        match self.dispatch_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.bind_addr.port(), 8080);
        assert!(config.db_path.is_none());
        assert_eq!(config.runtime.router_alias, "router");
        assert_eq!(
            config.runtime.dispatch_timeout(),
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn test_zero_timeout_disables_deadline() {
        let runtime = RuntimeConfig {
            dispatch_timeout_ms: 0,
            ..Default::default()
        };
        assert_eq!(runtime.dispatch_timeout(), None);
    }

    #[test]
    fn test_toml_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            bind_addr = "0.0.0.0:4000"
            db_path = "world.db"

            [runtime]
            router_alias = "lobby"
            preload = [2, 3]
            "#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.bind_addr.port(), 4000);
        assert_eq!(config.db_path.as_deref(), Some("world.db"));
        assert_eq!(config.runtime.router_alias, "lobby");
        assert_eq!(config.runtime.preload, vec![2, 3]);
        // Unset keys keep their defaults
        assert_eq!(config.runtime.hook_interval, 1000);
    }
}
