/// Errors returned by plugin capabilities.
///
/// The `Display` text is what ends up as the reason of a "not supported"
/// result, so variants carry human-readable messages.
///
/// # Examples
///
/// ```rust
/// use hostmon_plugin::PluginError;
///
/// let err = PluginError::Unsupported("Too many parameters.".to_string());
/// assert_eq!(err.to_string(), "Too many parameters.");
/// ```
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// The request cannot be served (bad parameters, unknown mode, ...).
    #[error("{0}")]
    Unsupported(String),

    /// An operating system query failed.
    #[error("Cannot obtain system information: {0}")]
    System(String),

    /// An underlying I/O error.
    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// A regular expression could not be compiled.
    #[error("Invalid regular expression: {0}")]
    Regex(String),
}

impl PluginError {
    pub fn unsupported(reason: impl Into<String>) -> Self {
        PluginError::Unsupported(reason.into())
    }
}

/// Errors raised while building the plugin registry. These are
/// configuration errors and abort agent startup.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Registry: plugin '{0}' is already registered")]
    DuplicatePlugin(String),

    #[error("Registry: metric '{key}' is already provided by plugin '{plugin}'")]
    DuplicateMetric { key: String, plugin: String },

    #[error("Registry: invalid metric key '{0}'")]
    InvalidMetric(String),

    #[error("Registry: plugin '{0}' has zero capacity")]
    ZeroCapacity(String),
}

/// Convenience `Result` alias for plugin operations.
pub type Result<T> = std::result::Result<T, PluginError>;
