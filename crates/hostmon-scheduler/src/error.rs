use hostmon_plugin::RegistryError;

/// Alias table configuration errors. Fatal at startup.
///
/// # Examples
///
/// ```rust
/// use hostmon_scheduler::error::AliasError;
///
/// let err = AliasError::Duplicate("cpu".to_string());
/// assert!(err.to_string().contains("duplicate"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AliasError {
    #[error("Alias: cannot add alias \"{0}\": duplicate name")]
    Duplicate(String),

    #[error("Alias: cannot parse alias \"{entry}\": {reason}")]
    Invalid { entry: String, reason: String },
}

/// Outcomes of [`crate::task::Task::reschedule`] that retire a task instead
/// of requeueing it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// The item was not refreshed by its client within the validity window.
    #[error("task validity window has elapsed")]
    Expired,

    #[error("one-shot task cannot be rescheduled")]
    OneShot,

    #[error("Invalid update interval \"{0}\".")]
    InvalidInterval(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Status query command not recognized. Carries the command verbatim.
    #[error("unknown request \"{0}\"")]
    UnknownRequest(String),

    #[error(transparent)]
    Alias(#[from] AliasError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("invalid global regular expression \"{name}\": {reason}")]
    InvalidExpression { name: String, reason: String },

    /// The dispatch loop has exited.
    #[error("scheduler is not running")]
    Stopped,
}

/// Convenience `Result` alias for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedulerError>;
