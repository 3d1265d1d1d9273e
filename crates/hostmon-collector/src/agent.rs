use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use hostmon_plugin::{Configurator, ContextProvider, ExportValue, Exporter, Plugin, PluginError};

use crate::{check_params, unknown_key};

/// The agent's own keys. `Hostname` in the plugin options overrides the
/// configured host name.
pub struct Agent {
    hostname: Mutex<String>,
}

impl Agent {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: Mutex::new(hostname.into()),
        }
    }

    fn hostname(&self) -> String {
        self.hostname.lock().map(|h| h.clone()).unwrap_or_default()
    }
}

impl Exporter for Agent {
    fn export(
        &self,
        key: &str,
        params: &[String],
        _ctx: &dyn ContextProvider,
    ) -> Result<Option<ExportValue>, PluginError> {
        check_params(params, 0)?;
        let value = match key {
            "agent.ping" => ExportValue::Uint(1),
            "agent.version" => env!("CARGO_PKG_VERSION").into(),
            "agent.hostname" => self.hostname().into(),
            _ => return Err(unknown_key(key)),
        };
        Ok(Some(value))
    }
}

impl Configurator for Agent {
    fn configure(&self, options: &HashMap<String, String>) {
        if let Some(name) = options.get("Hostname") {
            if let Ok(mut hostname) = self.hostname.lock() {
                tracing::debug!(hostname = %name, "Agent host name overridden");
                *hostname = name.clone();
            }
        }
    }
}

pub fn plugin(hostname: &str) -> Plugin {
    let agent = Arc::new(Agent::new(hostname));
    Plugin::builder("Agent")
        .metric("agent.hostname", "Returns Hostname from agent configuration.")
        .metric("agent.ping", "Returns agent availability check result.")
        .metric("agent.version", "Version of hostmon_agent.")
        .exporter(agent.clone())
        .configurator(agent)
        .build()
}
