//! Plugin framework for the hostmon agent.
//!
//! A plugin is a named bundle of optional capabilities (see [`Plugin`]):
//! any subset of [`Collector`], [`Exporter`], [`Runner`], [`Watcher`] and
//! [`Configurator`]. The scheduler checks which capabilities a plugin
//! offers before invoking them; there is no monolithic base trait.

pub mod context;
pub mod error;
pub mod registry;
pub mod watch;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::fmt;

use hostmon_common::types::{AgentResult, Request};

pub use context::{CaseMode, ContextProvider, Meta, RegexpMatcher, ResultWriter};
pub use error::{PluginError, RegistryError};
pub use registry::{Metric, Plugin, PluginBuilder, PluginId, PluginRegistry, DEFAULT_CAPACITY};

/// Periodic background collection, independent of incoming requests.
///
/// The scheduler runs [`Collector::collect`] every [`Collector::period`]
/// seconds while the plugin is active, exclusively with respect to the
/// plugin's other tasks. Exporters then serve the collected data.
pub trait Collector: Send + Sync {
    /// Refreshes the plugin's internal data.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying system API call fails. The error
    /// is logged; the collector stays scheduled.
    fn collect(&self) -> Result<(), PluginError>;

    /// Collection period in seconds.
    fn period(&self) -> u64;
}

/// Synchronous key to value computation.
pub trait Exporter: Send + Sync {
    /// Computes the value of `key` with the already parsed `params`.
    ///
    /// `Ok(None)` means "no value this time" (nothing is written upstream).
    ///
    /// # Errors
    ///
    /// The error message becomes the human-readable reason of a
    /// "not supported" result for the item.
    fn export(
        &self,
        key: &str,
        params: &[String],
        ctx: &dyn ContextProvider,
    ) -> Result<Option<ExportValue>, PluginError>;
}

/// Start/stop of background resources, driven by the plugin's activation
/// reference count.
pub trait Runner: Send + Sync {
    fn start(&self);
    fn stop(&self);
}

/// Push-style monitoring: the plugin receives the client's complete set of
/// requests and delivers results through `ctx.output()` whenever events
/// arrive. An empty request list withdraws the client's subscriptions.
pub trait Watcher: Send + Sync {
    fn watch(&self, requests: &[Request], ctx: &dyn ContextProvider);
}

/// Receives the plugin's section of the agent configuration at startup.
pub trait Configurator: Send + Sync {
    fn configure(&self, options: &HashMap<String, String>);
}

/// Value returned by an [`Exporter`].
///
/// # Examples
///
/// ```
/// use hostmon_plugin::ExportValue;
///
/// assert_eq!(ExportValue::from(1.5).to_string(), "1.500000");
/// assert_eq!(ExportValue::from(42u64).to_string(), "42");
/// assert_eq!(ExportValue::from("up").to_string(), "up");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum ExportValue {
    Text(String),
    Int(i64),
    Uint(u64),
    Float(f64),
    /// Several results at once (log-style items). Each result is written to
    /// the output as is.
    Results(Vec<AgentResult>),
}

impl fmt::Display for ExportValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportValue::Text(s) => f.write_str(s),
            ExportValue::Int(v) => write!(f, "{v}"),
            ExportValue::Uint(v) => write!(f, "{v}"),
            ExportValue::Float(v) => write!(f, "{v:.6}"),
            ExportValue::Results(results) => write!(f, "<{} results>", results.len()),
        }
    }
}

impl From<String> for ExportValue {
    fn from(value: String) -> Self {
        ExportValue::Text(value)
    }
}

impl From<&str> for ExportValue {
    fn from(value: &str) -> Self {
        ExportValue::Text(value.to_string())
    }
}

impl From<i64> for ExportValue {
    fn from(value: i64) -> Self {
        ExportValue::Int(value)
    }
}

impl From<u64> for ExportValue {
    fn from(value: u64) -> Self {
        ExportValue::Uint(value)
    }
}

impl From<f64> for ExportValue {
    fn from(value: f64) -> Self {
        ExportValue::Float(value)
    }
}
