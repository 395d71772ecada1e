// src/model.rs

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// A managed web server definition.
///
/// `port` is kept as a number in memory but written as a decimal string so
/// existing `config.json` files keep loading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: String,
    pub name: String,
    #[serde(with = "port_string")]
    pub port: u16,
    pub directory: String,
    #[serde(default)]
    pub running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan_interface: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6_address: Option<String>,
}

impl ServerRecord {
    pub fn network(&self) -> Option<NetworkBinding> {
        match (&self.vlan_interface, &self.ipv6_address) {
            (Some(interface), Some(ipv6_address)) => Some(NetworkBinding {
                interface: interface.clone(),
                ipv6_address: ipv6_address.clone(),
            }),
            _ => None,
        }
    }
}

/// The by-value reference a server record keeps to its network identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkBinding {
    pub interface: String,
    pub ipv6_address: String,
}

/// Validated `(name, port, directory)` triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerFields {
    pub name: String,
    pub port: u16,
    pub directory: String,
}

impl ServerFields {
    pub fn parse(name: &str, port: &str, directory: &str) -> Result<Self, ValidationError> {
        if name.is_empty() {
            return Err(ValidationError::MissingField("name"));
        }
        if port.is_empty() {
            return Err(ValidationError::MissingField("port"));
        }
        if directory.is_empty() {
            return Err(ValidationError::MissingField("directory"));
        }
        Ok(Self {
            name: name.to_string(),
            port: parse_port(port)?,
            directory: directory.to_string(),
        })
    }
}

pub fn parse_port(raw: &str) -> Result<u16, ValidationError> {
    match raw.parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(ValidationError::InvalidPort(raw.to_string())),
    }
}

/// Numeric-aware ordering for the opaque ids handed out by the supervisor.
pub fn id_order(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

mod port_string {
    use serde::de::{self, Deserializer};
    use serde::{Deserialize, Serializer};

    pub fn serialize<S: Serializer>(port: &u16, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(port)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(u64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Text(text) => super::parse_port(&text).map_err(de::Error::custom),
            Raw::Number(n) => u16::try_from(n)
                .ok()
                .filter(|p| *p > 0)
                .ok_or_else(|| de::Error::custom(format!("port out of range: {n}"))),
        }
    }
}
