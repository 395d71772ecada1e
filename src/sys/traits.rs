// src/sys/traits.rs

use async_trait::async_trait;
use std::net::Ipv6Addr;
use tokio::process::Command;

// ==============================================================================
// 1. Link Management (VLAN sub-interfaces)
// ==============================================================================

/// What the kernel currently reports for one interface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkState {
    pub up: bool,
    pub ipv6: Vec<Ipv6Addr>,
}

#[async_trait]
pub trait LinkManager: Send + Sync {
    /// Name of the physical interface new VLANs are stacked on.
    async fn uplink(&self) -> Result<String, String>;

    /// `None` when no interface with this name exists.
    async fn inspect(&self, name: &str) -> Result<Option<LinkState>, String>;

    async fn create_vlan(&self, parent: &str, name: &str, vlan_id: u16) -> Result<(), String>;

    async fn set_up(&self, name: &str) -> Result<(), String>;

    /// `cidr` is the address with its prefix length, e.g. `2001:db8::80/64`.
    async fn add_ipv6(&self, name: &str, cidr: &str) -> Result<(), String>;

    async fn delete_link(&self, name: &str) -> Result<(), String>;
}

// ==============================================================================
// 2. Server Launching
// ==============================================================================

/// Everything needed to start one web server process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Host part of the listen address, already bracketed for IPv6.
    pub listen_host: String,
    pub port: u16,
    pub document_root: String,
}

impl LaunchSpec {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.port)
    }
}

/// Builds the command for a server; the supervisor owns spawning and reaping.
pub trait ServerLauncher: Send + Sync {
    fn command(&self, spec: &LaunchSpec) -> Command;
}
