use std::any::Any;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use hostmon_common::types::AgentResult;

use crate::PluginError;

/// Buffered delivery of results upstream.
pub trait ResultWriter: Send + Sync {
    fn write(&self, result: AgentResult);

    fn flush(&self);

    /// Number of results that can still be buffered.
    fn slots_available(&self) -> usize;

    /// Number of persistent results (log positions) that can still be
    /// buffered. Plugins producing history-bearing results should skip a
    /// run rather than block when this reaches zero.
    fn persist_slots_available(&self) -> usize;
}

/// Per-item metadata that survives between task runs.
///
/// Log position fields are atomics because they are read and written by
/// execution contexts outside the scheduling lock.
#[derive(Default)]
pub struct Meta {
    last_log_size: AtomicU64,
    mtime: AtomicI32,
    data: Mutex<Option<Box<dyn Any + Send>>>,
}

impl Meta {
    pub fn new(last_log_size: u64, mtime: i32) -> Self {
        Self {
            last_log_size: AtomicU64::new(last_log_size),
            mtime: AtomicI32::new(mtime),
            data: Mutex::new(None),
        }
    }

    pub fn last_log_size(&self) -> u64 {
        self.last_log_size.load(Ordering::Acquire)
    }

    pub fn set_last_log_size(&self, value: u64) {
        self.last_log_size.store(value, Ordering::Release);
    }

    pub fn mtime(&self) -> i32 {
        self.mtime.load(Ordering::Acquire)
    }

    pub fn set_mtime(&self, value: i32) {
        self.mtime.store(value, Ordering::Release);
    }

    /// Plugin-private per-item state.
    pub fn data(&self) -> MutexGuard<'_, Option<Box<dyn Any + Send>>> {
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for Meta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Meta")
            .field("last_log_size", &self.last_log_size())
            .field("mtime", &self.mtime())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaseMode {
    Insensitive,
    #[default]
    Sensitive,
}

/// Matches values against a plain regular expression or a named global
/// expression (`@name`).
pub trait RegexpMatcher: Send + Sync {
    /// Returns `Ok(None)` on no match, otherwise the output built from
    /// `output_template` (`\0`..`\9` groups, `\@` whole match), or the whole
    /// value when no template is given.
    ///
    /// # Errors
    ///
    /// Fails when `pattern` is not a valid expression or names an unknown
    /// global expression.
    fn matches(
        &self,
        value: &str,
        pattern: &str,
        case: CaseMode,
        output_template: Option<&str>,
    ) -> Result<Option<String>, PluginError>;
}

/// Everything an Exporter or Watcher invocation may need from the agent.
pub trait ContextProvider: Send + Sync {
    /// Client ID of the request batch, `0` for single checks.
    fn client_id(&self) -> u64;

    fn item_id(&self) -> u64;

    fn output(&self) -> Arc<dyn ResultWriter>;

    fn meta(&self) -> &Meta;

    fn global_regexp(&self) -> &dyn RegexpMatcher;
}
