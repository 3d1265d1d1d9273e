use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use hostmon_agent::cache::ResultCache;
use hostmon_agent::config::AgentConfig;
use hostmon_agent::{build_manager, listener, refresh_active_checks, status};
use hostmon_common::id::new_client_id;
use hostmon_common::types::AgentResult;
use hostmon_scheduler::ManagerHandle;
use tokio::signal;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing_subscriber::EnvFilter;

#[allow(clippy::print_stderr)]
fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  hostmon-agent [-c <config.toml>] [-f] [-p <port>] [-s <port>]   Start the agent");
    eprintln!("  hostmon-agent [-c <config.toml>] -t <item key>   Check one item and exit");
    eprintln!();
    eprintln!("  -c  configuration file (default config/agent.toml)");
    eprintln!("  -f  run in the foreground");
    eprintln!("  -p  passive check port, overrides listen_addr");
    eprintln!("  -s  status HTTP port, overrides status_port");
}

#[derive(Debug)]
struct Args {
    config_path: String,
    listen_port: Option<u16>,
    status_port: Option<u16>,
    test_key: Option<String>,
}

fn parse_args(args: &[String]) -> Result<Args> {
    let mut parsed = Args {
        config_path: "config/agent.toml".to_string(),
        listen_port: None,
        status_port: None,
        test_key: None,
    };

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        let mut value = || {
            i += 1;
            args.get(i).cloned().ok_or_else(|| {
                print_usage();
                anyhow::anyhow!("{flag} requires an argument")
            })
        };
        match flag {
            "-c" => parsed.config_path = value()?,
            "-p" => {
                let port = value()?.parse().context("Invalid passive check port")?;
                parsed.listen_port = Some(port);
            }
            "-s" => parsed.status_port = Some(value()?.parse().context("Invalid status port")?),
            "-t" => parsed.test_key = Some(value()?),
            "-f" => {}
            other => {
                print_usage();
                anyhow::bail!("Unknown argument: {other}");
            }
        }
        i += 1;
    }
    Ok(parsed)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("hostmon=info".parse()?))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let args = parse_args(&args)?;

    let mut config = AgentConfig::load(&args.config_path)?;
    if let Some(port) = args.listen_port {
        config.listen_addr = Some(format!("0.0.0.0:{port}"));
    }
    if let Some(port) = args.status_port {
        config.status_port = port;
    }

    let manager = build_manager(&config)?;
    let (handle, scheduler) = manager.start();
    if !config.regexps.is_empty() {
        handle
            .update_regexps(config.regexps.clone())
            .await
            .context("Invalid global regular expressions")?;
    }

    match args.test_key {
        Some(key) => run_test(&handle, &key, &config).await?,
        None => run_agent(&handle, &config).await?,
    }

    handle.stop();
    if let Err(e) = scheduler.await {
        tracing::error!(error = %e, "Scheduler task failed");
    }
    Ok(())
}

#[allow(clippy::print_stdout)]
async fn run_test(handle: &ManagerHandle, key: &str, config: &AgentConfig) -> Result<()> {
    let result = handle.perform_check(key, config.timeout()).await?;
    match (&result.error, &result.value) {
        (Some(reason), _) => println!("{key:<48}[m|{}] [{reason}]", listener::NOT_SUPPORTED),
        (None, Some(value)) => println!("{key:<48}[s|{value}]"),
        (None, None) => println!("{key:<48}[-]"),
    }
    Ok(())
}

async fn run_agent(handle: &ManagerHandle, config: &AgentConfig) -> Result<()> {
    tracing::info!(hostname = %config.hostname, "hostmon-agent starting");

    let cache = Arc::new(ResultCache::new(config.buffer_size, config.persistent_buffer_size()));
    let refresh_handle = if config.checks.is_empty() {
        None
    } else {
        let client_id = new_client_id();
        tracing::info!(client_id, checks = config.checks.len(), "Registering active checks");
        Some(tokio::spawn(refresh_active_checks(
            handle.clone(),
            client_id,
            cache.clone(),
            config.checks.clone(),
            config.refresh_active_checks(),
        )))
    };

    let listener_handle = match &config.listen_addr {
        Some(addr) => {
            let addr: SocketAddr =
                addr.parse().with_context(|| format!("Invalid listen_addr {addr}"))?;
            let tcp = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind passive check listener on {addr}"))?;
            let peers = listener::AllowedPeers::resolve(&config.allowed_peers).await?;
            tracing::info!(addr = %addr, restricted = !peers.is_empty(), "Passive checks enabled");
            Some(tokio::spawn(listener::serve(
                tcp,
                handle.clone(),
                config.timeout(),
                peers,
            )))
        }
        None => None,
    };

    let status_handle = if config.status_port != 0 {
        let addr: SocketAddr = format!("0.0.0.0:{}", config.status_port).parse()?;
        let tcp = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind status endpoint on {addr}"))?;
        let app = status::status_routes(handle.clone());
        tracing::info!(addr = %addr, "Status endpoint enabled");
        Some(tokio::spawn(async move {
            if let Err(e) = axum::serve(tcp, app).await {
                tracing::error!(error = %e, "Status server error");
            }
        }))
    } else {
        None
    };

    let mut tick = interval(Duration::from_secs(config.flush_interval_secs));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => flush(&cache),
            _ = cache.flush_requested() => flush(&cache),
            _ = signal::ctrl_c() => {
                tracing::info!("Shutting down gracefully");
                break;
            }
        }
    }

    flush(&cache);
    if let Some(h) = refresh_handle {
        h.abort();
    }
    if let Some(h) = listener_handle {
        h.abort();
    }
    if let Some(h) = status_handle {
        h.abort();
    }
    Ok(())
}

fn flush(cache: &ResultCache) {
    let results = cache.drain_all();
    if results.is_empty() {
        return;
    }
    for result in &results {
        report(result);
    }
    tracing::debug!(count = results.len(), "Results flushed");
}

fn report(result: &AgentResult) {
    match &result.error {
        Some(reason) => tracing::warn!(
            itemid = result.itemid,
            ts = %result.ts,
            reason = %reason,
            "Item not supported"
        ),
        None => tracing::info!(
            itemid = result.itemid,
            ts = %result.ts,
            value = result.value.as_deref().unwrap_or(""),
            lastlogsize = ?result.last_log_size,
            "Item value"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("hostmon-agent")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_args_defaults() {
        let parsed = parse_args(&args(&[])).unwrap();
        assert_eq!(parsed.config_path, "config/agent.toml");
        assert!(parsed.test_key.is_none());
    }

    #[test]
    fn test_parse_args_overrides() {
        let parsed = parse_args(&args(&[
            "-c",
            "/etc/hostmon.toml",
            "-f",
            "-p",
            "10050",
            "-s",
            "8080",
            "-t",
            "agent.ping",
        ]))
        .unwrap();
        assert_eq!(parsed.config_path, "/etc/hostmon.toml");
        assert_eq!(parsed.listen_port, Some(10050));
        assert_eq!(parsed.status_port, Some(8080));
        assert_eq!(parsed.test_key.as_deref(), Some("agent.ping"));
    }

    #[test]
    fn test_parse_args_rejects_bad_input() {
        assert!(parse_args(&args(&["-c"])).is_err());
        assert!(parse_args(&args(&["-p", "http"])).is_err());
        assert!(parse_args(&args(&["--verbose"])).is_err());
    }
}
