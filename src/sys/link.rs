// src/sys/link.rs

use async_trait::async_trait;
use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;
use tokio::process::Command;
use tracing::info;

use crate::sys::traits::{LinkManager, LinkState};

/// Used when no suitable uplink shows up in the interface list.
pub const FALLBACK_UPLINK: &str = "wlan0";

/// Name prefixes of interfaces that are never an uplink.
const VIRTUAL_PREFIXES: [&str; 4] = ["lo", "docker", "veth", "br-"];

/// Drives iproute2 for link changes and reads state through getifaddrs(3).
pub struct IpLinkManager {
    use_sudo: bool,
}

impl IpLinkManager {
    pub fn new(use_sudo: bool) -> Self {
        Self { use_sudo }
    }

    async fn ip(&self, args: &[&str]) -> Result<(), String> {
        let mut cmd = if self.use_sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg("ip");
            cmd
        } else {
            Command::new("ip")
        };

        let output = cmd
            .args(args)
            .output()
            .await
            .map_err(|e| format!("ip spawn failed: {}", e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!(
                "`ip {}` exited with code {}: {}",
                args.join(" "),
                output.status.code().unwrap_or(-1),
                stderr.trim()
            ));
        }
        Ok(())
    }
}

/// Picks the first interface that is up, not loopback and not virtual.
pub fn select_uplink<'a>(candidates: impl IntoIterator<Item = (&'a str, bool, bool)>) -> Option<&'a str> {
    candidates
        .into_iter()
        .find(|(name, up, loopback)| {
            *up && !*loopback && !VIRTUAL_PREFIXES.iter().any(|p| name.starts_with(p))
        })
        .map(|(name, _, _)| name)
}

#[async_trait]
impl LinkManager for IpLinkManager {
    async fn uplink(&self) -> Result<String, String> {
        let addrs = getifaddrs().map_err(|e| format!("getifaddrs: {}", e))?;

        let mut seen: Vec<(String, bool, bool)> = Vec::new();
        for ifa in addrs {
            if seen.iter().any(|(name, _, _)| *name == ifa.interface_name) {
                continue;
            }
            seen.push((
                ifa.interface_name.clone(),
                ifa.flags.contains(InterfaceFlags::IFF_UP),
                ifa.flags.contains(InterfaceFlags::IFF_LOOPBACK),
            ));
        }

        let chosen = select_uplink(seen.iter().map(|(n, up, lo)| (n.as_str(), *up, *lo)))
            .unwrap_or(FALLBACK_UPLINK)
            .to_string();
        Ok(chosen)
    }

    async fn inspect(&self, name: &str) -> Result<Option<LinkState>, String> {
        let addrs = getifaddrs().map_err(|e| format!("getifaddrs: {}", e))?;

        let mut state: Option<LinkState> = None;
        for ifa in addrs.filter(|ifa| ifa.interface_name == name) {
            let entry = state.get_or_insert_with(LinkState::default);
            entry.up |= ifa.flags.contains(InterfaceFlags::IFF_UP);
            if let Some(v6) = ifa.address.as_ref().and_then(|a| a.as_sockaddr_in6()) {
                entry.ipv6.push(v6.ip());
            }
        }
        Ok(state)
    }

    async fn create_vlan(&self, parent: &str, name: &str, vlan_id: u16) -> Result<(), String> {
        let id = vlan_id.to_string();
        self.ip(&["link", "add", "link", parent, "name", name, "type", "vlan", "id", id.as_str()])
            .await?;
        info!(interface = name, parent, vlan_id, "VLAN interface created");
        Ok(())
    }

    async fn set_up(&self, name: &str) -> Result<(), String> {
        self.ip(&["link", "set", "dev", name, "up"]).await
    }

    async fn add_ipv6(&self, name: &str, cidr: &str) -> Result<(), String> {
        self.ip(&["-6", "addr", "add", cidr, "dev", name]).await
    }

    async fn delete_link(&self, name: &str) -> Result<(), String> {
        self.ip(&["link", "delete", name]).await?;
        info!(interface = name, "VLAN interface removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uplink_skips_loopback_and_virtual_interfaces() {
        let ifaces = [
            ("lo", true, true),
            ("docker0", true, false),
            ("veth12ab", true, false),
            ("br-5f2e", true, false),
            ("eth0", false, false),
            ("enp3s0", true, false),
        ];
        assert_eq!(select_uplink(ifaces), Some("enp3s0"));
    }

    #[test]
    fn uplink_none_when_only_virtual() {
        let ifaces = [("lo", true, true), ("docker0", true, false)];
        assert_eq!(select_uplink(ifaces), None);
    }

    #[tokio::test]
    async fn loopback_is_inspectable() {
        let mgr = IpLinkManager::new(false);
        let state = mgr.inspect("lo").await.unwrap();
        assert!(state.is_some());
        assert!(mgr.inspect("psm-no-such-if0").await.unwrap().is_none());
    }
}
