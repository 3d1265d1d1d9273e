//! Subscription bookkeeping for watch-style plugins.
//!
//! A watch plugin maps each requested key to an [`EventSource`] identified
//! by URI (a file path, a listening port, ...). The [`WatchManager`]
//! subscribes a source when the first client asks for it, unsubscribes it
//! when the last client drops it, and fans incoming events out to every
//! subscribed item through per-item [`EventFilter`]s.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use hostmon_common::types::{AgentResult, Request};

use crate::{PluginError, ResultWriter};

/// Raw event payload, or an error reported by the source itself.
pub type EventValue = std::result::Result<Vec<u8>, String>;

/// Converts a raw event into a result value for one item.
pub trait EventFilter: Send + Sync {
    /// `Ok(None)` drops the event for this item.
    fn convert(&self, event: &EventValue) -> Result<Option<String>, String>;
}

pub trait EventSource: Send + Sync {
    fn uri(&self) -> String;

    fn subscribe(&self) -> Result<(), PluginError>;

    fn unsubscribe(&self);

    fn new_filter(&self, key: &str) -> Result<Box<dyn EventFilter>, PluginError>;
}

/// Resolves request keys to event sources. Usually the plugin itself.
pub trait EventProvider: Send + Sync {
    fn event_source_by_key(&self, key: &str) -> Result<Arc<dyn EventSource>, PluginError>;
}

struct ItemFilter {
    itemid: u64,
    filter: Box<dyn EventFilter>,
}

struct ClientWatch {
    output: Arc<dyn ResultWriter>,
    items: HashMap<String, Vec<ItemFilter>>,
}

struct Subscription {
    source: Arc<dyn EventSource>,
    clients: HashSet<u64>,
}

#[derive(Default)]
pub struct WatchManager {
    subscriptions: HashMap<String, Subscription>,
    clients: HashMap<u64, ClientWatch>,
}

impl WatchManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the watch requests of `client_id` with `requests`.
    ///
    /// Requests whose source cannot be resolved, filtered or subscribed
    /// produce a "not supported" result on `output`.
    pub fn update(
        &mut self,
        client_id: u64,
        output: Arc<dyn ResultWriter>,
        requests: &[Request],
        provider: &dyn EventProvider,
    ) {
        let mut wanted: HashMap<String, (Arc<dyn EventSource>, Vec<ItemFilter>)> = HashMap::new();
        for request in requests {
            let source = match provider.event_source_by_key(&request.key) {
                Ok(source) => source,
                Err(e) => {
                    output.write(AgentResult::not_supported(request.itemid, e.to_string()));
                    continue;
                }
            };
            let filter = match source.new_filter(&request.key) {
                Ok(filter) => filter,
                Err(e) => {
                    output.write(AgentResult::not_supported(request.itemid, e.to_string()));
                    continue;
                }
            };
            wanted
                .entry(source.uri())
                .or_insert_with(|| (source, Vec::new()))
                .1
                .push(ItemFilter {
                    itemid: request.itemid,
                    filter,
                });
        }

        let mut items = HashMap::new();
        for (uri, (source, filters)) in wanted {
            if !self.subscriptions.contains_key(&uri) {
                if let Err(e) = source.subscribe() {
                    tracing::warn!(uri = %uri, error = %e, "Cannot subscribe to event source");
                    for f in &filters {
                        output.write(AgentResult::not_supported(f.itemid, e.to_string()));
                    }
                    continue;
                }
                tracing::debug!(uri = %uri, "Subscribed to event source");
                self.subscriptions.insert(
                    uri.clone(),
                    Subscription {
                        source,
                        clients: HashSet::new(),
                    },
                );
            }
            if let Some(sub) = self.subscriptions.get_mut(&uri) {
                sub.clients.insert(client_id);
            }
            items.insert(uri, filters);
        }

        if let Some(previous) = self.clients.remove(&client_id) {
            for uri in previous.items.keys() {
                if !items.contains_key(uri) {
                    self.release(uri, client_id);
                }
            }
        }
        if !items.is_empty() {
            self.clients.insert(client_id, ClientWatch { output, items });
        }
    }

    fn release(&mut self, uri: &str, client_id: u64) {
        let Some(sub) = self.subscriptions.get_mut(uri) else {
            return;
        };
        sub.clients.remove(&client_id);
        if sub.clients.is_empty() {
            if let Some(sub) = self.subscriptions.remove(uri) {
                sub.source.unsubscribe();
                tracing::debug!(uri = %uri, "Unsubscribed from event source");
            }
        }
    }

    /// Delivers an event from the source identified by `uri`.
    pub fn notify(&self, uri: &str, event: &EventValue) {
        let Some(sub) = self.subscriptions.get(uri) else {
            return;
        };
        for client_id in &sub.clients {
            let Some(watch) = self.clients.get(client_id) else {
                continue;
            };
            let Some(filters) = watch.items.get(uri) else {
                continue;
            };
            for f in filters {
                match f.filter.convert(event) {
                    Ok(Some(value)) => watch.output.write(AgentResult::value(f.itemid, value)),
                    Ok(None) => {}
                    Err(reason) => watch.output.write(AgentResult::not_supported(f.itemid, reason)),
                }
            }
        }
    }

    pub fn is_subscribed(&self, uri: &str) -> bool {
        self.subscriptions.contains_key(uri)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }
}
