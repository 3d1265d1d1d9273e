use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single item request, as received in an active-check batch or built
/// for a passive check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub itemid: u64,
    pub key: String,
    /// Update interval, e.g. `"30"`, `"30s"`, `"5m"`.
    #[serde(default)]
    pub delay: String,
    #[serde(default, rename = "lastlogsize")]
    pub last_log_size: Option<u64>,
    #[serde(default)]
    pub mtime: Option<i32>,
}

impl Request {
    pub fn new(itemid: u64, key: impl Into<String>, delay: impl Into<String>) -> Self {
        Self {
            itemid,
            key: key.into(),
            delay: delay.into(),
            last_log_size: None,
            mtime: None,
        }
    }
}

/// One collected value (or failure) for an item, buffered for delivery
/// upstream.
///
/// # Examples
///
/// ```
/// use hostmon_common::types::AgentResult;
///
/// let ok = AgentResult::value(7, "42");
/// assert!(!ok.is_not_supported());
///
/// let failed = AgentResult::not_supported(7, "Cannot open file.");
/// assert!(failed.is_not_supported());
/// assert_eq!(failed.error.as_deref(), Some("Cannot open file."));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub itemid: u64,
    pub value: Option<String>,
    pub ts: DateTime<Utc>,
    pub error: Option<String>,
    #[serde(rename = "lastlogsize")]
    pub last_log_size: Option<u64>,
    pub mtime: Option<i32>,
    /// Persistent results carry log positions and must not be dropped
    /// when the outbound buffer overflows.
    pub persistent: bool,
}

impl AgentResult {
    pub fn value(itemid: u64, value: impl Into<String>) -> Self {
        Self {
            itemid,
            value: Some(value.into()),
            ts: Utc::now(),
            error: None,
            last_log_size: None,
            mtime: None,
            persistent: false,
        }
    }

    pub fn not_supported(itemid: u64, reason: impl Into<String>) -> Self {
        Self {
            itemid,
            value: None,
            ts: Utc::now(),
            error: Some(reason.into()),
            last_log_size: None,
            mtime: None,
            persistent: false,
        }
    }

    pub fn is_not_supported(&self) -> bool {
        self.error.is_some()
    }
}
