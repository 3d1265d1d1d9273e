use std::sync::Arc;

use hostmon_plugin::{ContextProvider, ExportValue, Exporter, Plugin, PluginError};
use sysinfo::System;

use crate::{check_params, param, unknown_key};

/// Load averages, uptime and host identity.
pub struct Load;

impl Load {
    fn load(params: &[String]) -> Result<ExportValue, PluginError> {
        check_params(params, 2)?;
        let divisor = match param(params, 0) {
            "" | "all" => 1.0,
            "percpu" => std::thread::available_parallelism()
                .map(|n| n.get() as f64)
                .map_err(|e| PluginError::System(e.to_string()))?,
            _ => return Err(PluginError::unsupported("Invalid first parameter.")),
        };
        let avg = System::load_average();
        let value = match param(params, 1) {
            "" | "avg1" => avg.one,
            "avg5" => avg.five,
            "avg15" => avg.fifteen,
            _ => return Err(PluginError::unsupported("Invalid second parameter.")),
        };
        Ok(ExportValue::Float(value / divisor))
    }
}

impl Exporter for Load {
    fn export(
        &self,
        key: &str,
        params: &[String],
        _ctx: &dyn ContextProvider,
    ) -> Result<Option<ExportValue>, PluginError> {
        let value = match key {
            "system.cpu.load" => Self::load(params)?,
            "system.uptime" => {
                check_params(params, 0)?;
                ExportValue::Uint(System::uptime())
            }
            "system.boottime" => {
                check_params(params, 0)?;
                ExportValue::Uint(System::boot_time())
            }
            "system.hostname" => {
                check_params(params, 0)?;
                System::host_name()
                    .ok_or_else(|| PluginError::System("Cannot obtain host name.".into()))?
                    .into()
            }
            _ => return Err(unknown_key(key)),
        };
        Ok(Some(value))
    }
}

pub fn plugin() -> Plugin {
    Plugin::builder("System")
        .metric("system.boottime", "Returns system boot time.")
        .metric("system.cpu.load", "CPU load.")
        .metric("system.hostname", "Returns system host name.")
        .metric("system.uptime", "Returns system uptime in seconds.")
        .exporter(Arc::new(Load))
        .build()
}
