pub mod cache;
pub mod config;
pub mod listener;
pub mod status;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use hostmon_common::types::Request;
use hostmon_plugin::{PluginRegistry, ResultWriter};
use hostmon_scheduler::{AliasTable, Manager, ManagerHandle};
use tokio::time::{interval, MissedTickBehavior};

use crate::config::AgentConfig;

/// Builds the scheduler with every built-in plugin registered and the
/// configured aliases loaded. Configuration errors are fatal.
pub fn build_manager(config: &AgentConfig) -> anyhow::Result<Manager> {
    let mut registry = PluginRegistry::new();
    hostmon_collector::register_builtin(&mut registry, &config.hostname)
        .context("Failed to register built-in plugins")?;
    let aliases = AliasTable::parse(&config.aliases).context("Invalid alias configuration")?;
    tracing::debug!(plugins = registry.len(), aliases = aliases.len(), "Scheduler configured");
    Ok(Manager::new(registry, aliases, config.scheduler_options()))
}

/// Submits the static active-check batch under `client_id` every `every`,
/// starting immediately, so the batch never outlives the item TTL. Returns
/// once the scheduler has stopped.
pub async fn refresh_active_checks(
    handle: ManagerHandle,
    client_id: u64,
    output: Arc<dyn ResultWriter>,
    checks: Vec<Request>,
    every: Duration,
) {
    let mut tick = interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        if let Err(e) = handle.update(client_id, Arc::clone(&output), checks.clone()) {
            tracing::debug!(client_id, error = %e, "Active check refresh stopped");
            return;
        }
        tracing::trace!(client_id, checks = checks.len(), "Active checks refreshed");
    }
}
