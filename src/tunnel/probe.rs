//! Tunnel interface health probing through `ip` and `ping`.

use std::time::Duration;

use tracing::debug;

use super::error::TunnelResult;
use super::{InterfaceHealth, TunnelProbe};
use crate::process::run_command;

/// Extra time given to `ping` beyond its own `-W` reply timeout.
const PING_GRACE: Duration = Duration::from_secs(2);

/// Timeout for `ip` queries.
const IP_TIMEOUT: Duration = Duration::from_secs(5);

/// Probes a WireGuard interface with the system `ip` and `ping` tools.
#[derive(Debug, Clone)]
pub struct SystemTunnelProbe {
    interface: String,
    gateway_host: String,
    ping_timeout: Duration,
}

impl SystemTunnelProbe {
    /// Create a probe for `interface`, pinging `gateway_host` through it.
    pub fn new(interface: impl Into<String>, gateway_host: impl Into<String>, ping_timeout: Duration) -> Self {
        Self {
            interface: interface.into(),
            gateway_host: gateway_host.into(),
            ping_timeout,
        }
    }

    async fn link_state(&self) -> TunnelResult<Option<bool>> {
        let output = run_command(
            "ip",
            &["-o", "link", "show", "dev", &self.interface],
            IP_TIMEOUT,
        )
        .await?;
        if !output.success() {
            // `ip` exits non-zero when the device does not exist.
            return Ok(None);
        }
        Ok(Some(link_is_up(&output.stdout)))
    }

    async fn has_address(&self) -> TunnelResult<bool> {
        let output = run_command(
            "ip",
            &["-o", "-4", "addr", "show", "dev", &self.interface],
            IP_TIMEOUT,
        )
        .await?;
        Ok(output.success() && has_ipv4_address(&output.stdout))
    }

    async fn ping(&self) -> TunnelResult<bool> {
        let wait = self.ping_timeout.as_secs().max(1).to_string();
        let output = run_command(
            "ping",
            &["-c", "1", "-W", &wait, "-I", &self.interface, &self.gateway_host],
            self.ping_timeout + PING_GRACE,
        )
        .await?;
        Ok(output.success())
    }
}

impl TunnelProbe for SystemTunnelProbe {
    async fn check(&mut self) -> TunnelResult<InterfaceHealth> {
        let mut health = InterfaceHealth::absent();

        match self.link_state().await? {
            None => {
                debug!("Interface {} not found", self.interface);
                return Ok(health);
            }
            Some(up) => {
                health.present = true;
                health.up = up;
            }
        }
        if !health.up {
            debug!("Interface {} exists but is not UP", self.interface);
            return Ok(health);
        }

        health.has_address = self.has_address().await?;
        if !health.has_address {
            debug!("Interface {} has no IPv4 address", self.interface);
            return Ok(health);
        }

        health.gateway_reachable = self.ping().await?;
        debug!(
            "Ping to {} via {}: {}",
            self.gateway_host,
            self.interface,
            if health.gateway_reachable { "ok" } else { "failed" }
        );
        Ok(health)
    }
}

/// Whether `ip -o link show` output reports the link as up.
///
/// WireGuard links report `state UNKNOWN`, so the `UP` flag inside the
/// angle brackets is what counts.
pub fn link_is_up(output: &str) -> bool {
    if output.contains("state UP") {
        return true;
    }
    let Some(start) = output.find('<') else {
        return false;
    };
    let Some(len) = output[start..].find('>') else {
        return false;
    };
    output[start + 1..start + len].split(',').any(|flag| flag == "UP")
}

/// Whether `ip -o -4 addr show` output carries an `inet` address.
pub fn has_ipv4_address(output: &str) -> bool {
    output.split_whitespace().collect::<Vec<_>>().windows(2).any(|pair| {
        pair[0] == "inet"
            && pair[1]
                .split('/')
                .next()
                .is_some_and(|addr| addr.parse::<std::net::Ipv4Addr>().is_ok())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const WG_UP: &str = "5: wg0: <POINTOPOINT,NOARP,UP,LOWER_UP> mtu 1420 qdisc noqueue state UNKNOWN mode DEFAULT group default qlen 1000\\    link/none";
    const WG_DOWN: &str = "5: wg0: <POINTOPOINT,NOARP> mtu 1420 qdisc noop state DOWN mode DEFAULT group default qlen 1000\\    link/none";
    const ETH_UP: &str = "2: eth0: <BROADCAST,MULTICAST,LOWER_UP> mtu 1500 qdisc fq_codel state UP mode DEFAULT";

    #[test]
    fn test_wireguard_flags_up() {
        assert!(link_is_up(WG_UP));
    }

    #[test]
    fn test_wireguard_down() {
        assert!(!link_is_up(WG_DOWN));
    }

    #[test]
    fn test_state_up() {
        assert!(link_is_up(ETH_UP));
    }

    #[test]
    fn test_lower_up_alone_is_not_up() {
        assert!(!link_is_up("3: wg1: <NOARP,LOWER_UP> mtu 1420 state UNKNOWN"));
    }

    #[test]
    fn test_has_ipv4_address() {
        let out = "5: wg0    inet 10.2.0.2/32 scope global wg0\\       valid_lft forever preferred_lft forever";
        assert!(has_ipv4_address(out));
        assert!(!has_ipv4_address(""));
        assert!(!has_ipv4_address("5: wg0    inet6 fe80::1/64 scope link"));
    }

    #[tokio::test]
    #[ignore = "requires a WireGuard interface named wg0"]
    async fn test_probe_real_interface() {
        let mut probe = SystemTunnelProbe::new("wg0", "10.2.0.1", Duration::from_secs(2));
        let health = probe.check().await.unwrap();
        assert!(health.present);
    }
}
