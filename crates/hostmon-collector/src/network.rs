use std::sync::{Arc, Mutex};

use hostmon_plugin::{ContextProvider, ExportValue, Exporter, Plugin, PluginError};
use serde_json::json;
use sysinfo::{NetworkData, Networks};

use crate::{check_params, param, unknown_key};

#[derive(Clone, Copy)]
enum Direction {
    In,
    Out,
    Total,
}

/// Interface counters as totals since boot; rates are left to the server.
pub struct Network {
    networks: Mutex<Networks>,
}

impl Network {
    pub fn new() -> Self {
        Self {
            networks: Mutex::new(Networks::new_with_refreshed_list()),
        }
    }

    fn counter(data: &NetworkData, direction: Direction, mode: &str) -> Result<u64, PluginError> {
        let (rx, tx) = match mode {
            "" | "bytes" => (data.total_received(), data.total_transmitted()),
            "packets" => (data.total_packets_received(), data.total_packets_transmitted()),
            "errors" => (data.total_errors_on_received(), data.total_errors_on_transmitted()),
            _ => return Err(PluginError::unsupported("Invalid second parameter.")),
        };
        Ok(match direction {
            Direction::In => rx,
            Direction::Out => tx,
            Direction::Total => rx.saturating_add(tx),
        })
    }
}

impl Default for Network {
    fn default() -> Self {
        Self::new()
    }
}

impl Exporter for Network {
    fn export(
        &self,
        key: &str,
        params: &[String],
        _ctx: &dyn ContextProvider,
    ) -> Result<Option<ExportValue>, PluginError> {
        let direction = match key {
            "net.if.in" => Direction::In,
            "net.if.out" => Direction::Out,
            "net.if.total" => Direction::Total,
            "net.if.discovery" => {
                check_params(params, 0)?;
                let mut networks = self.networks.lock().unwrap_or_else(|p| p.into_inner());
                networks.refresh_list();
                let entries: Vec<_> = networks
                    .iter()
                    .map(|(name, _)| json!({ "{#IFNAME}": name }))
                    .collect();
                return serde_json::to_string(&entries)
                    .map(|s| Some(ExportValue::Text(s)))
                    .map_err(|e| PluginError::System(e.to_string()));
            }
            _ => return Err(unknown_key(key)),
        };

        check_params(params, 2)?;
        let interface = param(params, 0);
        if interface.is_empty() {
            return Err(PluginError::unsupported("Network interface name cannot be empty."));
        }
        let mut networks = self.networks.lock().unwrap_or_else(|p| p.into_inner());
        networks.refresh();
        if !networks.iter().any(|(name, _)| name == interface) {
            networks.refresh_list();
        }
        let data = networks
            .iter()
            .find(|(name, _)| name.as_str() == interface)
            .map(|(_, data)| data)
            .ok_or_else(|| {
                PluginError::unsupported(
                    "Cannot find information for this network interface in /proc/net/dev.",
                )
            })?;
        Ok(Some(ExportValue::Uint(Self::counter(data, direction, param(params, 1))?)))
    }
}

pub fn plugin() -> Plugin {
    Plugin::builder("NetIf")
        .metric(
            "net.if.discovery",
            "Returns list of network interfaces. Used for low-level discovery.",
        )
        .metric("net.if.in", "Returns incoming traffic statistics on network interface.")
        .metric("net.if.out", "Returns outgoing traffic statistics on network interface.")
        .metric(
            "net.if.total",
            "Returns sum of incoming and outgoing traffic statistics on network interface.",
        )
        .exporter(Arc::new(Network::new()))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::Ctx;

    #[test]
    fn rejects_missing_or_unknown_interface() {
        let net = Network::new();
        let ctx = Ctx::new(0);
        assert!(net.export("net.if.in", &[], &ctx).is_err());
        assert!(net.export("net.if.in", &["no-such-if0".into()], &ctx).is_err());
        assert!(net.export("net.if.in", &["lo".into(), "x".into(), "y".into()], &ctx).is_err());
    }

    #[test]
    fn discovery_lists_interfaces_as_json() {
        let value = Network::new()
            .export("net.if.discovery", &[], &Ctx::new(0))
            .unwrap()
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&value.to_string()).unwrap();
        assert!(parsed.is_array());
    }
}
