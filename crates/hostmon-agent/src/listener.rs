//! Passive checks: the peer sends one newline-terminated item key, the
//! agent answers with the value and closes the connection. Failures are
//! answered with `ZBX_NOTSUPPORTED\0<reason>`.

use std::net::IpAddr;
use std::time::Duration;

use anyhow::Context;
use hostmon_common::types::AgentResult;
use hostmon_scheduler::ManagerHandle;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

pub const NOT_SUPPORTED: &str = "ZBX_NOTSUPPORTED";

const MAX_KEY_LEN: u64 = 64 * 1024;

/// Wire form of a single check result.
pub fn format_reply(result: &AgentResult) -> Vec<u8> {
    match &result.error {
        Some(reason) => {
            let mut reply = NOT_SUPPORTED.as_bytes().to_vec();
            reply.push(0);
            reply.extend_from_slice(reason.as_bytes());
            reply
        }
        None => result.value.clone().unwrap_or_default().into_bytes(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Network {
    addr: IpAddr,
    prefix: u8,
}

impl Network {
    fn host(addr: IpAddr) -> Self {
        let prefix = if addr.is_ipv4() { 32 } else { 128 };
        Self { addr, prefix }
    }

    fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix)).unwrap_or(0);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX.checked_shl(128 - u32::from(self.prefix)).unwrap_or(0);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

/// Peers allowed to request passive checks: IP addresses, CIDR networks
/// and host names. An empty list allows every peer.
#[derive(Debug, Clone, Default)]
pub struct AllowedPeers {
    networks: Vec<Network>,
}

impl AllowedPeers {
    /// Parses `entries`, resolving host names once.
    ///
    /// # Errors
    ///
    /// Fails on a malformed network or a host name that does not resolve.
    pub async fn resolve(entries: &[String]) -> anyhow::Result<Self> {
        let mut networks = Vec::new();
        for entry in entries.iter().map(|e| e.trim()).filter(|e| !e.is_empty()) {
            if let Some((addr, prefix)) = entry.split_once('/') {
                let addr: IpAddr = addr
                    .parse()
                    .with_context(|| format!("Invalid address in allowed peer {entry}"))?;
                let prefix: u8 = prefix
                    .parse()
                    .with_context(|| format!("Invalid prefix in allowed peer {entry}"))?;
                let max = if addr.is_ipv4() { 32 } else { 128 };
                if prefix > max {
                    anyhow::bail!("Prefix of allowed peer {entry} exceeds {max}");
                }
                networks.push(Network { addr, prefix });
            } else if let Ok(addr) = entry.parse::<IpAddr>() {
                networks.push(Network::host(addr));
            } else {
                let resolved = tokio::net::lookup_host((entry, 0))
                    .await
                    .with_context(|| format!("Failed to resolve allowed peer {entry}"))?;
                let before = networks.len();
                networks.extend(resolved.map(|a| Network::host(a.ip())));
                let addresses = networks.len() - before;
                tracing::debug!(host = entry, addresses, "Allowed peer resolved");
            }
        }
        Ok(Self { networks })
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }

    pub fn allows(&self, ip: IpAddr) -> bool {
        if self.networks.is_empty() {
            return true;
        }
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(ip, IpAddr::V4),
            IpAddr::V4(_) => ip,
        };
        self.networks.iter().any(|n| n.contains(ip))
    }
}

/// Accepts passive check connections. Connections from peers outside
/// `peers` are closed without a reply.
pub async fn serve(
    listener: TcpListener,
    handle: ManagerHandle,
    timeout: Duration,
    peers: AllowedPeers,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, "Passive check accept failed");
                continue;
            }
        };
        if !peers.allows(peer.ip()) {
            tracing::warn!(peer = %peer, "Passive check from disallowed peer rejected");
            drop(stream);
            continue;
        }
        let handle = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, &handle, timeout).await {
                tracing::debug!(peer = %peer, error = %e, "Passive check connection failed");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    handle: &ManagerHandle,
    timeout: Duration,
) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut line = String::new();
    tokio::time::timeout(timeout, BufReader::new(reader.take(MAX_KEY_LEN)).read_line(&mut line))
        .await
        .map_err(|_| anyhow::anyhow!("timed out reading item key"))??;

    let key = line.trim_end_matches(['\r', '\n']);
    if key.is_empty() {
        return Ok(());
    }
    tracing::debug!(key, "Passive check requested");

    let result = handle.perform_check(key, timeout).await?;
    writer.write_all(&format_reply(&result)).await?;
    writer.shutdown().await?;
    Ok(())
}
