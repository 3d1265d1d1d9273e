//! Built-in plugins of the hostmon agent.
//!
//! Each module builds one [`Plugin`] descriptor: system metrics read through
//! `sysinfo` (CPU, memory, file systems, network interfaces, load), log
//! file keys, the agent's own `agent.*` keys, and the `debug.trap` watch
//! plugin.

pub mod agent;
pub mod cpu;
pub mod disk;
pub mod load;
pub mod log;
pub mod memory;
pub mod network;
pub mod trap;

use hostmon_plugin::{Plugin, PluginError, PluginRegistry, RegistryError};

/// All built-in plugins. `hostname` is reported by `agent.hostname`.
pub fn builtin_plugins(hostname: &str) -> Vec<Plugin> {
    vec![
        agent::plugin(hostname),
        cpu::plugin(),
        disk::plugin(),
        load::plugin(),
        log::plugin(),
        memory::plugin(),
        network::plugin(),
        trap::plugin(),
    ]
}

pub fn register_builtin(
    registry: &mut PluginRegistry,
    hostname: &str,
) -> Result<(), RegistryError> {
    for plugin in builtin_plugins(hostname) {
        registry.register(plugin)?;
    }
    Ok(())
}

pub(crate) fn check_params(params: &[String], max: usize) -> Result<(), PluginError> {
    if params.len() > max {
        return Err(PluginError::unsupported("Too many parameters."));
    }
    Ok(())
}

/// Parameter at `index`, empty when absent.
pub(crate) fn param(params: &[String], index: usize) -> &str {
    params.get(index).map(String::as_str).unwrap_or("")
}

pub(crate) fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    part as f64 / total as f64 * 100.0
}

pub(crate) fn unknown_key(key: &str) -> PluginError {
    PluginError::unsupported(format!("Unsupported metric \"{key}\"."))
}
