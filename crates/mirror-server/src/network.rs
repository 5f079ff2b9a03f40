//! Discovery of this machine's mesh VPN address.

use crate::tools;
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::debug;

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(3);

/// The address phones should use to reach this host: the headscale node
/// address, else the first `100.x.y.z` interface address, else `localhost`.
pub async fn mesh_address() -> String {
    match tools::run("headscale", &["nodes", "list", "--output", "json"], &[], LOOKUP_TIMEOUT).await {
        Ok(out) => {
            if let Some(ip) = parse_headscale_nodes(&String::from_utf8_lossy(&out.stdout)) {
                return ip;
            }
        }
        Err(e) => debug!(error = %e, "headscale lookup failed"),
    }

    match tools::run("ip", &["addr", "show"], &[], LOOKUP_TIMEOUT).await {
        Ok(out) => {
            if let Some(ip) = parse_ip_addr(&String::from_utf8_lossy(&out.stdout)) {
                return ip.to_string();
            }
        }
        Err(e) => debug!(error = %e, "interface lookup failed"),
    }

    "localhost".to_string()
}

/// First address of the first node in `headscale nodes list --output json`.
pub fn parse_headscale_nodes(json: &str) -> Option<String> {
    let nodes: serde_json::Value = serde_json::from_str(json).ok()?;
    let first = nodes.as_array()?.first()?;
    let addrs = first
        .get("ip_addresses")
        .or_else(|| first.get("ipAddresses"))?
        .as_array()?;
    addrs
        .first()?
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// First `inet 100.x.y.z` address in `ip addr show` output.
pub fn parse_ip_addr(output: &str) -> Option<Ipv4Addr> {
    output
        .lines()
        .filter_map(|line| line.trim_start().strip_prefix("inet "))
        .filter_map(|rest| rest.split(['/', ' ']).next())
        .filter_map(|addr| addr.parse::<Ipv4Addr>().ok())
        .find(|ip| ip.octets()[0] == 100)
}
