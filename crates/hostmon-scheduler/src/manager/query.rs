use std::fmt::Write;

use hostmon_plugin::Metric;

use super::Manager;
use crate::agent::PluginAgent;
use crate::error::SchedulerError;

impl Manager {
    /// Answers a status query.
    ///
    /// `metrics` lists every plugin, sorted by name, with its activity,
    /// capacity use, queued task count and metric keys (sorted):
    ///
    /// ```text
    /// [Agent]
    /// active: true
    /// capacity: 0/100
    /// tasks: 1
    /// agent.ping: Returns agent availability check result.
    ///
    /// ```
    ///
    /// # Errors
    ///
    /// [`SchedulerError::UnknownRequest`] for any other command.
    pub fn process_query(&self, command: &str) -> Result<String, SchedulerError> {
        match command.trim() {
            "metrics" => Ok(self.metrics_report()),
            other => Err(SchedulerError::UnknownRequest(other.to_string())),
        }
    }

    fn metrics_report(&self) -> String {
        let mut agents: Vec<&PluginAgent> = self.agents.iter().collect();
        agents.sort_by(|a, b| a.plugin().name().cmp(b.plugin().name()));

        let mut out = String::new();
        for agent in agents {
            let plugin = agent.plugin();
            let mut metrics: Vec<&Metric> = plugin.metrics().iter().collect();
            metrics.sort_by(|a, b| a.key.cmp(&b.key));

            let _ = writeln!(out, "[{}]", plugin.name());
            let _ = writeln!(out, "active: {}", agent.active());
            let _ = writeln!(out, "capacity: {}/{}", agent.used_capacity(), agent.capacity());
            let _ = writeln!(out, "tasks: {}", agent.task_count());
            for metric in metrics {
                let _ = writeln!(out, "{}: {}", metric.key, metric.description);
            }
            out.push('\n');
        }
        out
    }
}
