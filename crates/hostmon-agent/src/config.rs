use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use hostmon_common::types::Request;
use hostmon_scheduler::{Expression, SchedulerOptions};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_hostname")]
    pub hostname: String,
    /// Upper bound for a single check execution.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Passive check listener, e.g. `0.0.0.0:10050`. Disabled when absent.
    pub listen_addr: Option<String>,
    /// Addresses, CIDR networks or host names allowed to request passive
    /// checks. Empty allows every peer.
    #[serde(default)]
    pub allowed_peers: Vec<String>,
    /// Status HTTP port, 0 disables the endpoint.
    #[serde(default)]
    pub status_port: u16,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// 0 means the same as `buffer_size`.
    #[serde(default)]
    pub persistent_buffer_size: usize,
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
    #[serde(default = "default_ttl")]
    pub item_ttl_secs: u64,
    #[serde(default = "default_ttl")]
    pub plugin_ttl_secs: u64,
    #[serde(default = "default_housekeeping_interval")]
    pub housekeeping_interval_secs: u64,
    /// How often the static `checks` batch is resubmitted. Must stay below
    /// `item_ttl_secs`.
    #[serde(default = "default_refresh_active_checks")]
    pub refresh_active_checks_secs: u64,
    /// `name:target` key aliases.
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Static active checks, registered as one batch at startup.
    #[serde(default)]
    pub checks: Vec<Request>,
    #[serde(default)]
    pub regexps: Vec<Expression>,
    /// Per-plugin options, keyed by plugin name.
    #[serde(default)]
    pub plugins: HashMap<String, HashMap<String, String>>,
}

fn default_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "hostmon".to_string())
}

fn default_timeout() -> u64 {
    3
}

fn default_buffer_size() -> usize {
    1000
}

fn default_flush_interval() -> u64 {
    5
}

fn default_ttl() -> u64 {
    3600
}

fn default_housekeeping_interval() -> u64 {
    60
}

fn default_refresh_active_checks() -> u64 {
    120
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            timeout_secs: default_timeout(),
            listen_addr: None,
            allowed_peers: Vec::new(),
            status_port: 0,
            buffer_size: default_buffer_size(),
            persistent_buffer_size: 0,
            flush_interval_secs: default_flush_interval(),
            item_ttl_secs: default_ttl(),
            plugin_ttl_secs: default_ttl(),
            housekeeping_interval_secs: default_housekeeping_interval(),
            refresh_active_checks_secs: default_refresh_active_checks(),
            aliases: Vec::new(),
            checks: Vec::new(),
            regexps: Vec::new(),
            plugins: HashMap::new(),
        }
    }
}

impl AgentConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {path}"))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {path}"))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.timeout_secs == 0 || self.timeout_secs > 30 {
            anyhow::bail!("timeout_secs must be between 1 and 30, got {}", self.timeout_secs);
        }
        if self.buffer_size == 0 {
            anyhow::bail!("buffer_size must be greater than 0");
        }
        if self.flush_interval_secs == 0 {
            anyhow::bail!("flush_interval_secs must be greater than 0");
        }
        if self.refresh_active_checks_secs == 0
            || self.refresh_active_checks_secs >= self.item_ttl_secs
        {
            anyhow::bail!(
                "refresh_active_checks_secs must be between 1 and item_ttl_secs ({}), got {}",
                self.item_ttl_secs,
                self.refresh_active_checks_secs
            );
        }
        Ok(())
    }

    pub fn persistent_buffer_size(&self) -> usize {
        if self.persistent_buffer_size == 0 {
            self.buffer_size
        } else {
            self.persistent_buffer_size
        }
    }

    pub fn refresh_active_checks(&self) -> Duration {
        Duration::from_secs(self.refresh_active_checks_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions {
            timeout: self.timeout(),
            item_ttl: chrono_secs(self.item_ttl_secs),
            plugin_ttl: chrono_secs(self.plugin_ttl_secs),
            housekeeping_interval: Duration::from_secs(self.housekeeping_interval_secs.max(1)),
            plugin_options: self.plugins.clone(),
        }
    }
}

fn chrono_secs(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX).min(i64::MAX / 1000))
}
