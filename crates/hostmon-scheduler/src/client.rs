use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use hostmon_common::types::Request;
use hostmon_plugin::{PluginId, ResultWriter};

use crate::task::TaskId;

/// A source of request batches. Client `0` collects single (passive)
/// checks; its plugin references expire individually.
pub(crate) struct Client {
    pub id: u64,
    pub output: Arc<dyn ResultWriter>,
    /// Exporter tasks by item ID.
    pub items: HashMap<u64, TaskId>,
    /// Referenced plugins and when each was last used.
    pub plugins: HashMap<PluginId, DateTime<Utc>>,
    /// Last request set submitted to each watcher plugin.
    pub watches: HashMap<PluginId, Vec<Request>>,
    pub updated: DateTime<Utc>,
}

impl Client {
    pub fn new(id: u64, output: Arc<dyn ResultWriter>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            output,
            items: HashMap::new(),
            plugins: HashMap::new(),
            watches: HashMap::new(),
            updated: now,
        }
    }
}
