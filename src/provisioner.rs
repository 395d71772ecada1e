// src/provisioner.rs
//
// One VLAN sub-interface and one IPv6 address per active port.
//
// The lock is held across the `ip` invocations on purpose: allocations are
// rare and holding it keeps "is there an identity for port N" and "does the
// kernel interface exist" from drifting apart mid-operation.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::net::Ipv6Addr;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::ProvisionError;
use crate::model::parse_port;
use crate::sys::{LinkManager, LinkState};

pub const INTERFACE_PREFIX: &str = "vlan";

/// A virtual interface + address bound to one port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkIdentity {
    pub name: String,
    pub vlan_id: u16,
    /// Bare address, no prefix length.
    pub ipv6_address: String,
    pub port: u16,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionerSummary {
    pub ipv6_prefix: String,
    pub active_vlans: usize,
    pub port_mappings: BTreeMap<String, String>,
}

pub fn interface_name(port: u16) -> String {
    format!("{INTERFACE_PREFIX}{port}")
}

/// `2a0e:b107:384:ee25::/64` + 8080 -> `2a0e:b107:384:ee25::8080`.
///
/// The port's decimal digits become the low-order group verbatim.
pub fn derive_address(prefix: &str, port: u16) -> String {
    let base = prefix.replacen("/64", "", 1);
    format!("{}::{}", base.trim_end_matches(':'), port)
}

#[derive(Default)]
struct Identities {
    by_name: HashMap<String, NetworkIdentity>,
    port_index: BTreeMap<u16, String>,
}

impl Identities {
    fn for_port(&self, port: u16) -> Option<&NetworkIdentity> {
        self.port_index.get(&port).and_then(|name| self.by_name.get(name))
    }

    fn insert(&mut self, identity: NetworkIdentity) {
        self.port_index.insert(identity.port, identity.name.clone());
        self.by_name.insert(identity.name.clone(), identity);
    }

    fn remove(&mut self, port: u16) {
        if let Some(name) = self.port_index.remove(&port) {
            self.by_name.remove(&name);
        }
    }
}

pub struct Provisioner {
    ipv6_prefix: String,
    links: Box<dyn LinkManager>,
    state: Mutex<Identities>,
}

impl Provisioner {
    pub fn new(ipv6_prefix: String, links: Box<dyn LinkManager>) -> Self {
        Self {
            ipv6_prefix,
            links,
            state: Mutex::new(Identities::default()),
        }
    }

    /// Returns the identity for `port`, creating the interface if needed.
    ///
    /// A failure part-way through leaves whatever the kernel already has in
    /// place. The next call for the same port inspects the interface and
    /// finishes the missing steps instead of creating it again.
    pub async fn allocate(&self, port: &str) -> Result<NetworkIdentity, ProvisionError> {
        let mut ids = self.state.lock().await;

        let port_num = parse_port(port).map_err(|_| ProvisionError::InvalidPort(port.to_string()))?;
        if let Some(existing) = ids.for_port(port_num) {
            return Ok(existing.clone());
        }

        let ipv6_address = derive_address(&self.ipv6_prefix, port_num);
        let addr: Ipv6Addr = ipv6_address
            .parse()
            .map_err(|_| ProvisionError::InvalidAddress {
                address: ipv6_address.clone(),
            })?;

        let mut identity = NetworkIdentity {
            name: interface_name(port_num),
            vlan_id: port_num,
            ipv6_address,
            port: port_num,
            active: false,
        };

        self.bring_up(&identity, addr).await?;
        identity.active = true;

        debug!(port = port_num, interface = %identity.name, address = %identity.ipv6_address, "network identity active");
        ids.insert(identity.clone());
        Ok(identity)
    }

    async fn bring_up(&self, identity: &NetworkIdentity, addr: Ipv6Addr) -> Result<(), ProvisionError> {
        let name = identity.name.as_str();

        let current = self
            .links
            .inspect(name)
            .await
            .map_err(|reason| ProvisionError::CreateLink {
                name: name.to_string(),
                reason,
            })?;

        let state = match current {
            Some(state) => state,
            None => {
                let parent = self.links.uplink().await.map_err(ProvisionError::Uplink)?;
                self.links
                    .create_vlan(&parent, name, identity.vlan_id)
                    .await
                    .map_err(|reason| ProvisionError::CreateLink {
                        name: name.to_string(),
                        reason,
                    })?;
                LinkState::default()
            }
        };

        if !state.up {
            self.links
                .set_up(name)
                .await
                .map_err(|reason| ProvisionError::LinkUp {
                    name: name.to_string(),
                    reason,
                })?;
        }

        if !state.ipv6.contains(&addr) {
            let cidr = format!("{}/64", identity.ipv6_address);
            self.links
                .add_ipv6(name, &cidr)
                .await
                .map_err(|reason| ProvisionError::AssignAddress {
                    name: name.to_string(),
                    address: cidr.clone(),
                    reason,
                })?;
        }

        Ok(())
    }

    /// Tears down the identity for `port`. Unknown ports are a no-op.
    ///
    /// If the kernel refuses the delete, the identity stays registered so a
    /// later release can retry.
    pub async fn release(&self, port: &str) -> Result<(), ProvisionError> {
        let mut ids = self.state.lock().await;

        let Ok(port_num) = parse_port(port) else {
            return Ok(());
        };
        let Some(identity) = ids.for_port(port_num).cloned() else {
            return Ok(());
        };

        let gone = matches!(self.links.inspect(&identity.name).await, Ok(None));
        if !gone {
            self.links
                .delete_link(&identity.name)
                .await
                .map_err(|reason| ProvisionError::DeleteLink {
                    name: identity.name.clone(),
                    reason,
                })?;
        }

        ids.remove(port_num);
        Ok(())
    }

    pub async fn lookup(&self, port: &str) -> Option<NetworkIdentity> {
        let port_num = parse_port(port).ok()?;
        self.state.lock().await.for_port(port_num).cloned()
    }

    /// Every active identity, ordered by port.
    pub async fn identities(&self) -> Vec<NetworkIdentity> {
        let ids = self.state.lock().await;
        ids.port_index
            .values()
            .filter_map(|name| ids.by_name.get(name))
            .filter(|identity| identity.active)
            .cloned()
            .collect()
    }

    pub async fn summary(&self) -> ProvisionerSummary {
        let ids = self.state.lock().await;
        ProvisionerSummary {
            ipv6_prefix: self.ipv6_prefix.clone(),
            active_vlans: ids.by_name.len(),
            port_mappings: ids
                .port_index
                .iter()
                .map(|(port, name)| (port.to_string(), name.clone()))
                .collect(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::Arc;

    pub(crate) const PREFIX: &str = "2a0e:b107:384:ee25::/64";

    /// In-memory kernel. Records every mutating call.
    #[derive(Default)]
    pub(crate) struct FakeLinks {
        pub kernel: SyncMutex<HashMap<String, LinkState>>,
        pub calls: SyncMutex<Vec<String>>,
        pub fail_step: SyncMutex<Option<&'static str>>,
    }

    impl FakeLinks {
        fn step(&self, step: &'static str, call: String) -> Result<(), String> {
            self.calls.lock().push(call);
            if *self.fail_step.lock() == Some(step) {
                return Err(format!("RTNETLINK answers: {step} refused"));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl LinkManager for Arc<FakeLinks> {
        async fn uplink(&self) -> Result<String, String> {
            Ok("eth0".to_string())
        }

        async fn inspect(&self, name: &str) -> Result<Option<LinkState>, String> {
            Ok(self.kernel.lock().get(name).cloned())
        }

        async fn create_vlan(&self, parent: &str, name: &str, vlan_id: u16) -> Result<(), String> {
            self.step("create", format!("create {parent} {name} {vlan_id}"))?;
            self.kernel.lock().insert(name.to_string(), LinkState::default());
            Ok(())
        }

        async fn set_up(&self, name: &str) -> Result<(), String> {
            self.step("up", format!("up {name}"))?;
            if let Some(state) = self.kernel.lock().get_mut(name) {
                state.up = true;
            }
            Ok(())
        }

        async fn add_ipv6(&self, name: &str, cidr: &str) -> Result<(), String> {
            self.step("addr", format!("addr {name} {cidr}"))?;
            let addr = cidr.trim_end_matches("/64").parse().map_err(|_| "bad cidr".to_string())?;
            if let Some(state) = self.kernel.lock().get_mut(name) {
                state.ipv6.push(addr);
            }
            Ok(())
        }

        async fn delete_link(&self, name: &str) -> Result<(), String> {
            self.step("delete", format!("delete {name}"))?;
            self.kernel.lock().remove(name);
            Ok(())
        }
    }

    pub(crate) fn provisioner() -> (Provisioner, Arc<FakeLinks>) {
        let links = Arc::new(FakeLinks::default());
        (
            Provisioner::new(PREFIX.to_string(), Box::new(links.clone())),
            links,
        )
    }

    #[test]
    fn derivation_matches_reference_values() {
        assert_eq!(derive_address(PREFIX, 8080), "2a0e:b107:384:ee25::8080");
        assert_eq!(derive_address("2001:db8:0:1/64", 443), "2001:db8:0:1::443");
        assert_eq!(interface_name(8080), "vlan8080");
    }

    #[tokio::test]
    async fn allocate_creates_interface_under_uplink() {
        let (prov, links) = provisioner();
        let identity = prov.allocate("8080").await.unwrap();

        assert_eq!(identity.name, "vlan8080");
        assert_eq!(identity.vlan_id, 8080);
        assert_eq!(identity.ipv6_address, "2a0e:b107:384:ee25::8080");
        assert!(identity.active);
        assert_eq!(
            *links.calls.lock(),
            vec![
                "create eth0 vlan8080 8080".to_string(),
                "up vlan8080".to_string(),
                "addr vlan8080 2a0e:b107:384:ee25::8080/64".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn allocate_is_idempotent() {
        let (prov, links) = provisioner();
        let first = prov.allocate("8080").await.unwrap();
        let second = prov.allocate("8080").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(links.calls.lock().len(), 3);
    }

    #[tokio::test]
    async fn invalid_port_is_rejected_before_touching_links() {
        let (prov, links) = provisioner();
        assert_eq!(
            prov.allocate("eighty").await,
            Err(ProvisionError::InvalidPort("eighty".into()))
        );
        assert!(matches!(
            prov.allocate("65535").await,
            Err(ProvisionError::InvalidAddress { .. })
        ));
        assert!(links.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn failed_step_is_reported_and_not_registered() {
        let (prov, links) = provisioner();
        *links.fail_step.lock() = Some("addr");

        let err = prov.allocate("8080").await.unwrap_err();
        assert!(matches!(err, ProvisionError::AssignAddress { .. }));
        assert!(prov.lookup("8080").await.is_none());
        // No rollback: the half-built interface is still there.
        assert!(links.kernel.lock().contains_key("vlan8080"));
    }

    #[tokio::test]
    async fn retry_after_partial_failure_adopts_existing_interface() {
        let (prov, links) = provisioner();
        *links.fail_step.lock() = Some("addr");
        assert!(prov.allocate("8080").await.is_err());

        *links.fail_step.lock() = None;
        links.calls.lock().clear();
        let identity = prov.allocate("8080").await.unwrap();

        assert!(identity.active);
        assert_eq!(
            *links.calls.lock(),
            vec!["addr vlan8080 2a0e:b107:384:ee25::8080/64".to_string()]
        );
    }

    #[tokio::test]
    async fn release_unknown_port_is_a_noop() {
        let (prov, links) = provisioner();
        prov.release("9999").await.unwrap();
        prov.release("garbage").await.unwrap();
        assert!(links.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn release_then_allocate_builds_fresh_identity() {
        let (prov, links) = provisioner();
        prov.allocate("8080").await.unwrap();
        prov.release("8080").await.unwrap();

        assert!(prov.lookup("8080").await.is_none());
        assert!(!links.kernel.lock().contains_key("vlan8080"));

        let again = prov.allocate("8080").await.unwrap();
        assert_eq!(again.name, "vlan8080");
        assert_eq!(links.calls.lock().iter().filter(|c| c.starts_with("create")).count(), 2);
    }

    #[tokio::test]
    async fn failed_delete_keeps_identity_for_retry() {
        let (prov, links) = provisioner();
        prov.allocate("8080").await.unwrap();
        *links.fail_step.lock() = Some("delete");

        assert!(matches!(
            prov.release("8080").await,
            Err(ProvisionError::DeleteLink { .. })
        ));
        assert!(prov.lookup("8080").await.is_some());

        *links.fail_step.lock() = None;
        prov.release("8080").await.unwrap();
        assert!(prov.lookup("8080").await.is_none());
    }

    #[tokio::test]
    async fn summary_reports_prefix_and_mappings() {
        let (prov, _links) = provisioner();
        prov.allocate("8081").await.unwrap();
        prov.allocate("8080").await.unwrap();

        let summary = prov.summary().await;
        assert_eq!(summary.ipv6_prefix, PREFIX);
        assert_eq!(summary.active_vlans, 2);
        assert_eq!(summary.port_mappings["8080"], "vlan8080");

        let ports: Vec<u16> = prov.identities().await.iter().map(|i| i.port).collect();
        assert_eq!(ports, vec![8080, 8081]);
    }

    #[tokio::test]
    async fn concurrent_allocations_each_complete() {
        let (prov, _links) = provisioner();
        let prov = Arc::new(prov);

        let handles: Vec<_> = (8001..=8008)
            .map(|port| {
                let prov = Arc::clone(&prov);
                tokio::spawn(async move { prov.allocate(&port.to_string()).await })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(prov.summary().await.active_vlans, 8);
    }
}
