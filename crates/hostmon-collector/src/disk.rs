use std::sync::{Arc, Mutex};

use hostmon_plugin::{ContextProvider, ExportValue, Exporter, Plugin, PluginError};
use serde_json::json;
use sysinfo::Disks;

use crate::{check_params, param, percent, unknown_key};

/// File system usage per mount point.
pub struct Disk {
    disks: Mutex<Disks>,
}

impl Disk {
    pub fn new() -> Self {
        Self {
            disks: Mutex::new(Disks::new_with_refreshed_list()),
        }
    }

    fn size(disks: &Disks, params: &[String]) -> Result<ExportValue, PluginError> {
        check_params(params, 2)?;
        let mount = param(params, 0);
        if mount.is_empty() {
            return Err(PluginError::unsupported("Invalid first parameter."));
        }
        let disk = disks
            .iter()
            .find(|d| d.mount_point().to_string_lossy() == mount)
            .ok_or_else(|| {
                PluginError::unsupported(format!(
                    "Cannot obtain filesystem information: {mount} not mounted."
                ))
            })?;

        let total = disk.total_space();
        let free = disk.available_space();
        let used = total.saturating_sub(free);
        Ok(match param(params, 1) {
            "" | "total" => ExportValue::Uint(total),
            "free" => ExportValue::Uint(free),
            "used" => ExportValue::Uint(used),
            "pfree" => ExportValue::Float(percent(free, total)),
            "pused" => ExportValue::Float(percent(used, total)),
            _ => return Err(PluginError::unsupported("Invalid second parameter.")),
        })
    }

    fn discovery(disks: &Disks, params: &[String]) -> Result<ExportValue, PluginError> {
        check_params(params, 0)?;
        let entries: Vec<_> = disks
            .iter()
            .map(|d| {
                json!({
                    "{#FSNAME}": d.mount_point().to_string_lossy(),
                    "{#FSTYPE}": d.file_system().to_string_lossy(),
                })
            })
            .collect();
        serde_json::to_string(&entries)
            .map(ExportValue::Text)
            .map_err(|e| PluginError::System(e.to_string()))
    }
}

impl Default for Disk {
    fn default() -> Self {
        Self::new()
    }
}

impl Exporter for Disk {
    fn export(
        &self,
        key: &str,
        params: &[String],
        _ctx: &dyn ContextProvider,
    ) -> Result<Option<ExportValue>, PluginError> {
        let mut disks = self.disks.lock().unwrap_or_else(|p| p.into_inner());
        disks.refresh_list();
        let value = match key {
            "vfs.fs.size" => Self::size(&disks, params)?,
            "vfs.fs.discovery" => Self::discovery(&disks, params)?,
            _ => return Err(unknown_key(key)),
        };
        Ok(Some(value))
    }
}

pub fn plugin() -> Plugin {
    Plugin::builder("Disk")
        .metric("vfs.fs.discovery", "List of mounted filesystems. Used for low-level discovery.")
        .metric("vfs.fs.size", "Disk space in bytes or in percentage from total.")
        .exporter(Arc::new(Disk::new()))
        .build()
}
