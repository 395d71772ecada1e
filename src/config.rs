// src/config.rs

use secrecy::Secret;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::error::ConfigError;

pub const DEFAULT_PASSWORD: &str = "admin123";
pub const DEFAULT_IPV6_PREFIX: &str = "2a0e:b107:384:ee25::/64";
const STATE_DIR: &str = ".php-server-manager";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug)]
pub struct ManagerConfig {
    // Control API
    pub listen_addr: SocketAddr,
    pub admin_password: Secret<String>,
    pub password_is_default: bool,
    pub session_ttl_hours: i64,
    pub static_dir: Option<PathBuf>,

    // Persistence
    pub state_path: PathBuf,

    // Network provisioning
    pub ipv6_prefix: String,
    pub vlan_enabled: bool,
    pub use_sudo: bool,

    // Server processes
    pub server_binary: String,
    pub run_as: Option<String>,

    pub log_format: LogFormat,
}

impl ManagerConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup; `load` uses the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let listen_addr = match var("PSM_LISTEN_ADDR") {
            Some(raw) => raw.parse().map_err(|e| ConfigError::Invalid {
                var: "PSM_LISTEN_ADDR",
                reason: format!("{e}"),
            })?,
            None => SocketAddr::from(([0, 0, 0, 0], 80)),
        };

        let (admin_password, password_is_default) = match var("PSM_ADMIN_PASSWORD") {
            Some(password) => (password, false),
            None => (DEFAULT_PASSWORD.to_string(), true),
        };

        let session_ttl_hours = match var("PSM_SESSION_TTL_HOURS") {
            Some(raw) => match raw.parse::<i64>() {
                Ok(hours) if hours > 0 => hours,
                _ => {
                    return Err(ConfigError::Invalid {
                        var: "PSM_SESSION_TTL_HOURS",
                        reason: format!("expected a positive number of hours, got '{raw}'"),
                    });
                }
            },
            None => 24,
        };

        let state_path = match var("PSM_STATE_PATH") {
            Some(path) => PathBuf::from(path),
            None => dirs::home_dir()
                .ok_or(ConfigError::NoHomeDir)?
                .join(STATE_DIR)
                .join("config.json"),
        };

        let ipv6_prefix = var("PSM_IPV6_PREFIX").unwrap_or_else(|| DEFAULT_IPV6_PREFIX.to_string());
        if !ipv6_prefix.ends_with("/64") {
            return Err(ConfigError::Invalid {
                var: "PSM_IPV6_PREFIX",
                reason: format!("expected a /64 prefix, got '{ipv6_prefix}'"),
            });
        }

        let run_as = var("PSM_RUN_AS");
        if let Some(user) = &run_as {
            validate_user(user)?;
        }

        let log_format = match var("PSM_LOG_FORMAT").as_deref() {
            None | Some("pretty") => LogFormat::Pretty,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    var: "PSM_LOG_FORMAT",
                    reason: format!("expected 'pretty' or 'json', got '{other}'"),
                });
            }
        };

        Ok(Self {
            listen_addr,
            admin_password: Secret::new(admin_password),
            password_is_default,
            session_ttl_hours,
            static_dir: var("PSM_STATIC_DIR").map(PathBuf::from),
            state_path,
            ipv6_prefix,
            vlan_enabled: parse_bool(var("PSM_VLAN_ENABLED"), "PSM_VLAN_ENABLED", true)?,
            use_sudo: parse_bool(var("PSM_USE_SUDO"), "PSM_USE_SUDO", true)?,
            server_binary: var("PSM_SERVER_BINARY").unwrap_or_else(|| "frankenphp".to_string()),
            run_as,
            log_format,
        })
    }
}

fn parse_bool(raw: Option<String>, var: &'static str, default: bool) -> Result<bool, ConfigError> {
    match raw.as_deref().map(str::to_ascii_lowercase).as_deref() {
        None => Ok(default),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(other) => Err(ConfigError::Invalid {
            var,
            reason: format!("expected a boolean, got '{other}'"),
        }),
    }
}

/// Zero-Trust: the account must exist before it is handed to `sudo -u`.
fn validate_user(user: &str) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::Invalid {
        var: "PSM_RUN_AS",
        reason,
    };

    if user.starts_with('-') || !user.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(invalid(format!("'{user}' is not a valid user name")));
    }
    match nix::unistd::User::from_name(user) {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(invalid(format!("user '{user}' does not exist"))),
        Err(e) => Err(invalid(format!("failed to look up '{user}': {e}"))),
    }
}
