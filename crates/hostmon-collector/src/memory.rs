use std::sync::{Arc, Mutex};

use hostmon_plugin::{ContextProvider, ExportValue, Exporter, Plugin, PluginError};
use sysinfo::System;

use crate::{check_params, param, percent, unknown_key};

pub struct Memory {
    system: Mutex<System>,
}

impl Memory {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

impl Exporter for Memory {
    fn export(
        &self,
        key: &str,
        params: &[String],
        _ctx: &dyn ContextProvider,
    ) -> Result<Option<ExportValue>, PluginError> {
        let mut system = self.system.lock().unwrap_or_else(|p| p.into_inner());
        system.refresh_memory();

        let value = match key {
            "vm.memory.size" => {
                check_params(params, 1)?;
                let total = system.total_memory();
                let used = system.used_memory();
                let available = system.available_memory();
                match param(params, 0) {
                    "" | "total" => ExportValue::Uint(total),
                    "used" => ExportValue::Uint(used),
                    "available" => ExportValue::Uint(available),
                    "free" => ExportValue::Uint(system.free_memory()),
                    "pused" => ExportValue::Float(percent(used, total)),
                    "pavailable" => ExportValue::Float(percent(available, total)),
                    _ => return Err(PluginError::unsupported("Invalid first parameter.")),
                }
            }
            "system.swap.size" => {
                check_params(params, 2)?;
                if !matches!(param(params, 0), "" | "all") {
                    return Err(PluginError::unsupported("Invalid first parameter."));
                }
                let total = system.total_swap();
                let free = system.free_swap();
                let used = system.used_swap();
                match param(params, 1) {
                    "" | "free" => ExportValue::Uint(free),
                    "total" => ExportValue::Uint(total),
                    "used" => ExportValue::Uint(used),
                    "pfree" => ExportValue::Float(percent(free, total)),
                    "pused" => ExportValue::Float(percent(used, total)),
                    _ => return Err(PluginError::unsupported("Invalid second parameter.")),
                }
            }
            _ => return Err(unknown_key(key)),
        };
        Ok(Some(value))
    }
}

pub fn plugin() -> Plugin {
    Plugin::builder("Memory")
        .metric("system.swap.size", "Returns Swap space size in bytes or in percentage from total.")
        .metric("vm.memory.size", "Returns memory size in bytes or in percentage from total.")
        .exporter(Arc::new(Memory::new()))
        .build()
}
