//! Request and response bodies for the control API.

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Body of `POST /servers` and `PUT /servers/{id}`.
///
/// The browser UI sends the port as a string; numbers are accepted too.
#[derive(Debug, Deserialize)]
pub struct ServerRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub port: PortField,
    #[serde(default)]
    pub directory: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum PortField {
    Text(String),
    Number(i64),
}

impl Default for PortField {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

impl PortField {
    pub fn as_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Number(n) => n.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CreateServerResponse {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vlan_interface: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv6_address: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub running: bool,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

/// The password is scrubbed from memory as soon as the request is dropped.
#[derive(Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct LoginRequest {
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub expires_at: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
}
