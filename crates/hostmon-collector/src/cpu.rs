use std::sync::{Arc, Mutex, MutexGuard};

use hostmon_plugin::{
    Collector, ContextProvider, ExportValue, Exporter, Plugin, PluginError, Runner,
};
use sysinfo::System;

use crate::{check_params, param, unknown_key};

struct CpuState {
    system: System,
    total: f32,
    cores: Vec<f32>,
    collected: bool,
}

/// CPU utilization, sampled every second by the collector while the plugin
/// is active. The `sysinfo` handle lives only between start and stop.
#[derive(Default)]
pub struct Cpu {
    state: Mutex<Option<CpuState>>,
}

impl Cpu {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, Option<CpuState>> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn utilization(&self, params: &[String]) -> Result<Option<ExportValue>, PluginError> {
        check_params(params, 3)?;
        if !matches!(param(params, 1), "" | "total") {
            return Err(PluginError::unsupported("Invalid second parameter."));
        }
        if !matches!(param(params, 2), "" | "avg1") {
            return Err(PluginError::unsupported("Invalid third parameter."));
        }

        let guard = self.state();
        let state = guard
            .as_ref()
            .ok_or_else(|| PluginError::unsupported("Collector is not started."))?;
        if !state.collected {
            return Ok(None);
        }
        let usage = match param(params, 0) {
            "" | "all" => state.total,
            index => {
                let core: usize = index
                    .parse()
                    .map_err(|_| PluginError::unsupported("Invalid first parameter."))?;
                *state
                    .cores
                    .get(core)
                    .ok_or_else(|| PluginError::unsupported("Invalid first parameter."))?
            }
        };
        Ok(Some(ExportValue::Float(usage as f64)))
    }

    fn count(&self, params: &[String]) -> Result<Option<ExportValue>, PluginError> {
        check_params(params, 1)?;
        if !matches!(param(params, 0), "" | "online" | "max") {
            return Err(PluginError::unsupported("Invalid first parameter."));
        }
        let guard = self.state();
        let count = match guard.as_ref() {
            Some(state) => state.system.cpus().len(),
            None => {
                let mut system = System::new();
                system.refresh_cpu_all();
                system.cpus().len()
            }
        };
        Ok(Some(ExportValue::Uint(count as u64)))
    }
}

impl Runner for Cpu {
    fn start(&self) {
        let mut system = System::new();
        system.refresh_cpu_all();
        *self.state() = Some(CpuState {
            system,
            total: 0.0,
            cores: Vec::new(),
            collected: false,
        });
    }

    fn stop(&self) {
        *self.state() = None;
    }
}

impl Collector for Cpu {
    fn collect(&self) -> Result<(), PluginError> {
        let mut guard = self.state();
        let Some(state) = guard.as_mut() else {
            return Ok(());
        };
        state.system.refresh_cpu_all();
        state.total = state.system.global_cpu_usage();
        state.cores = state.system.cpus().iter().map(|cpu| cpu.cpu_usage()).collect();
        state.collected = true;
        Ok(())
    }

    fn period(&self) -> u64 {
        1
    }
}

impl Exporter for Cpu {
    fn export(
        &self,
        key: &str,
        params: &[String],
        _ctx: &dyn ContextProvider,
    ) -> Result<Option<ExportValue>, PluginError> {
        match key {
            "system.cpu.util" => self.utilization(params),
            "system.cpu.num" => self.count(params),
            _ => Err(unknown_key(key)),
        }
    }
}

pub fn plugin() -> Plugin {
    let cpu = Arc::new(Cpu::new());
    Plugin::builder("Cpu")
        .metric("system.cpu.num", "Number of CPUs.")
        .metric("system.cpu.util", "CPU utilization in percent.")
        .collector(cpu.clone())
        .exporter(cpu.clone())
        .runner(cpu)
        .build()
}
