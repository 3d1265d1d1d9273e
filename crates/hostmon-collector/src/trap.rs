//! `debug.trap[port,<prefix>]`: a watch plugin that listens on a TCP port
//! and turns every received line into a value for the subscribed items.
//! Lines not starting with `prefix` are dropped for that item.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use hostmon_common::itemutil::parse_key;
use hostmon_common::types::Request;
use hostmon_plugin::watch::{EventFilter, EventProvider, EventSource, EventValue, WatchManager};
use hostmon_plugin::{ContextProvider, Plugin, PluginError, Runner, Watcher};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

#[derive(Default)]
struct Shared {
    runtime: Mutex<Option<Handle>>,
    listeners: Mutex<HashMap<String, JoinHandle<()>>>,
    watch: Mutex<WatchManager>,
}

impl Shared {
    fn notify(&self, uri: &str, event: &EventValue) {
        lock(&self.watch).notify(uri, event);
    }
}

struct Provider(Arc<Shared>);

impl EventProvider for Provider {
    fn event_source_by_key(&self, key: &str) -> Result<Arc<dyn EventSource>, PluginError> {
        let (_, params) = parse_key(key).map_err(|e| PluginError::unsupported(e.to_string()))?;
        if params.len() > 2 {
            return Err(PluginError::unsupported("Too many parameters."));
        }
        let port: u16 = params
            .first()
            .and_then(|p| p.parse().ok())
            .filter(|p| *p != 0)
            .ok_or_else(|| PluginError::unsupported("Invalid first parameter."))?;
        Ok(Arc::new(PortSource {
            port,
            shared: Arc::clone(&self.0),
        }))
    }
}

struct PortSource {
    port: u16,
    shared: Arc<Shared>,
}

impl EventSource for PortSource {
    fn uri(&self) -> String {
        format!("tcp://0.0.0.0:{}", self.port)
    }

    fn subscribe(&self) -> Result<(), PluginError> {
        let runtime = lock(&self.shared.runtime)
            .clone()
            .ok_or_else(|| PluginError::unsupported("Trap listener is not running."))?;
        let listener = std::net::TcpListener::bind(("0.0.0.0", self.port))?;
        listener.set_nonblocking(true)?;

        let uri = self.uri();
        let shared = Arc::clone(&self.shared);
        let task = runtime.spawn(accept_loop(listener, uri.clone(), shared));
        lock(&self.shared.listeners).insert(uri, task);
        Ok(())
    }

    fn unsubscribe(&self) {
        if let Some(task) = lock(&self.shared.listeners).remove(&self.uri()) {
            task.abort();
        }
    }

    fn new_filter(&self, key: &str) -> Result<Box<dyn EventFilter>, PluginError> {
        let (_, params) = parse_key(key).map_err(|e| PluginError::unsupported(e.to_string()))?;
        Ok(Box::new(PrefixFilter(params.get(1).filter(|p| !p.is_empty()).cloned())))
    }
}

async fn accept_loop(listener: std::net::TcpListener, uri: String, shared: Arc<Shared>) {
    let listener = match TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(e) => {
            shared.notify(&uri, &Err(e.to_string()));
            return;
        }
    };
    debug!(uri = %uri, "Trap listener started");
    // readers live in the set, so aborting this loop aborts them too
    let mut connections = JoinSet::new();
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            Some(_) = connections.join_next(), if !connections.is_empty() => continue,
        };
        let (stream, peer) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                warn!(uri = %uri, error = %e, "Trap accept failed");
                continue;
            }
        };
        connections.spawn(read_lines(stream, peer, uri.clone(), Arc::clone(&shared)));
    }
}

async fn read_lines(stream: TcpStream, peer: SocketAddr, uri: String, shared: Arc<Shared>) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => shared.notify(&uri, &Ok(line.into_bytes())),
            Ok(None) => break,
            Err(e) => {
                debug!(uri = %uri, peer = %peer, error = %e, "Trap connection closed");
                break;
            }
        }
    }
}

struct PrefixFilter(Option<String>);

impl EventFilter for PrefixFilter {
    fn convert(&self, event: &EventValue) -> Result<Option<String>, String> {
        let data = event.as_ref().map_err(Clone::clone)?;
        let text = String::from_utf8_lossy(data).into_owned();
        match &self.0 {
            Some(prefix) if !text.starts_with(prefix.as_str()) => Ok(None),
            _ => Ok(Some(text)),
        }
    }
}

/// The plugin object: captures the runtime on start so event sources can
/// spawn listeners from blocking execution contexts.
#[derive(Default)]
pub struct Trap {
    shared: Arc<Shared>,
}

impl Trap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscription_count(&self) -> usize {
        lock(&self.shared.watch).subscription_count()
    }
}

impl Runner for Trap {
    fn start(&self) {
        *lock(&self.shared.runtime) = Handle::try_current().ok();
    }

    fn stop(&self) {
        for (_, task) in lock(&self.shared.listeners).drain() {
            task.abort();
        }
        *lock(&self.shared.watch) = WatchManager::new();
        *lock(&self.shared.runtime) = None;
    }
}

impl Watcher for Trap {
    fn watch(&self, requests: &[Request], ctx: &dyn ContextProvider) {
        let provider = Provider(Arc::clone(&self.shared));
        lock(&self.shared.watch).update(ctx.client_id(), ctx.output(), requests, &provider);
    }
}

pub fn plugin() -> Plugin {
    let trap = Arc::new(Trap::new());
    Plugin::builder("DebugTrap")
        .capacity(1)
        .metric("debug.trap", "Listen on port for incoming TCP data.")
        .runner(trap.clone())
        .watcher(trap)
        .build()
}
