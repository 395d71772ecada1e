// src/main.rs

use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod auth;
mod config;
mod error;
mod model;
mod provisioner;
mod server;
mod store;
mod supervisor;
mod sys;

use crate::auth::SessionStore;
use crate::config::{LogFormat, ManagerConfig};
use crate::provisioner::Provisioner;
use crate::server::AppState;
use crate::store::{ConfigStore, Persister};
use crate::supervisor::Supervisor;
use crate::sys::launcher::FrankenPhpLauncher;
use crate::sys::link::IpLinkManager;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ==============================================================================
    // 1. Configuration & Logging
    // ==============================================================================

    let config = ManagerConfig::load()?;
    init_tracing(config.log_format);

    if config.password_is_default {
        warn!("PSM_ADMIN_PASSWORD is not set; the control API accepts the default password");
    }

    // ==============================================================================
    // 2. State Recovery
    // ==============================================================================

    // Records come back stopped; no process survives a restart.
    let store = ConfigStore::new(config.state_path.clone());
    let snapshot = store.load().await?;
    info!(
        path = %config.state_path.display(),
        servers = snapshot.servers.len(),
        next_id = snapshot.next_id,
        "configuration loaded"
    );
    let (persister, _writer) = Persister::spawn(store);

    // ==============================================================================
    // 3. Dependency Injection
    // ==============================================================================

    let launcher = FrankenPhpLauncher::new(config.server_binary.clone(), config.run_as.clone());
    let links = IpLinkManager::new(config.use_sudo);

    let state = Arc::new(AppState {
        supervisor: Supervisor::new(snapshot, Arc::new(launcher), persister),
        provisioner: Provisioner::new(config.ipv6_prefix.clone(), Box::new(links)),
        sessions: SessionStore::new(
            config.admin_password,
            chrono::Duration::hours(config.session_ttl_hours),
        ),
        vlan_enabled: config.vlan_enabled,
    });

    // ==============================================================================
    // 4. Control API
    // ==============================================================================

    let app = server::router(Arc::clone(&state), config.static_dir.as_deref());
    let listener = TcpListener::bind(config.listen_addr).await?;

    info!(
        addr = %config.listen_addr,
        vlan_enabled = config.vlan_enabled,
        ipv6_prefix = %config.ipv6_prefix,
        "php-server-manager listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(server::shutdown_signal())
        .await?;

    // ==============================================================================
    // 5. Shutdown
    // ==============================================================================

    let stopped = state.supervisor.stop_all().await;
    state.supervisor.flush().await;
    info!(stopped, "all servers stopped, configuration flushed");

    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(fmt::layer()).init(),
    }
}
