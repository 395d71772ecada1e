// src/store.rs
//
// Durable server definitions. One JSON file, rewritten whole on every save,
// owned by a single writer task so mutators never wait on disk I/O.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::model::ServerRecord;

/// The entire durable state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    #[serde(default, deserialize_with = "nullable_map")]
    pub servers: BTreeMap<String, ServerRecord>,
    #[serde(rename = "nextID", default = "first_id")]
    pub next_id: u64,
}

fn first_id() -> u64 {
    1
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self {
            servers: BTreeMap::new(),
            next_id: first_id(),
        }
    }
}

impl ConfigSnapshot {
    /// Applies the restart rules: nothing is running after a reload, and
    /// `next_id` stays above every id already handed out.
    fn into_reloaded(mut self) -> Self {
        let mut floor = self.next_id.max(1);
        for (key, record) in self.servers.iter_mut() {
            record.running = false;
            record.id.clone_from(key);
            if let Ok(n) = key.parse::<u64>() {
                floor = floor.max(n + 1);
            }
        }
        self.next_id = floor;
        self
    }
}

fn nullable_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, ServerRecord>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the snapshot. A missing file is an empty configuration.
    pub async fn load(&self) -> Result<ConfigSnapshot, StoreError> {
        let data = match fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ConfigSnapshot::default());
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        let snapshot: ConfigSnapshot =
            serde_json::from_slice(&data).map_err(|source| StoreError::Json {
                path: self.path.clone(),
                source,
            })?;

        Ok(snapshot.into_reloaded())
    }

    /// Atomic whole-file rewrite: write a sibling temp file, then rename over.
    pub async fn save(&self, snapshot: &ConfigSnapshot) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.map_err(io_err)?;
            }
        }

        let data = serde_json::to_vec_pretty(snapshot).map_err(|source| StoreError::Json {
            path: self.path.clone(),
            source,
        })?;

        let mut tmp_path = self.path.clone().into_os_string();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);

        fs::write(&tmp_path, &data).await.map_err(io_err)?;
        if let Err(e) = fs::rename(&tmp_path, &self.path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(io_err(e));
        }
        Ok(())
    }
}

enum PersistRequest {
    Save(ConfigSnapshot),
    Flush(oneshot::Sender<()>),
}

/// Handle to the single persistence writer. Cheap to clone.
#[derive(Clone)]
pub struct Persister {
    tx: mpsc::UnboundedSender<PersistRequest>,
}

impl Persister {
    /// Spawns the writer task. It exits once every `Persister` clone is dropped.
    pub fn spawn(store: ConfigStore) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(write_loop(store, rx));
        (Self { tx }, handle)
    }

    /// Queues a snapshot. Never blocks.
    pub fn save(&self, snapshot: ConfigSnapshot) {
        if self.tx.send(PersistRequest::Save(snapshot)).is_err() {
            warn!("persistence writer is gone; snapshot dropped");
        }
    }

    /// Resolves once everything queued before this call has been written.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(PersistRequest::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

async fn write_loop(store: ConfigStore, mut rx: mpsc::UnboundedReceiver<PersistRequest>) {
    while let Some(first) = rx.recv().await {
        let mut latest = None;
        let mut waiters = Vec::new();

        let mut absorb = |req: PersistRequest| match req {
            PersistRequest::Save(snapshot) => latest = Some(snapshot),
            PersistRequest::Flush(ack) => waiters.push(ack),
        };
        absorb(first);
        // Only the newest queued snapshot matters.
        while let Ok(req) = rx.try_recv() {
            absorb(req);
        }

        if let Some(snapshot) = latest {
            match store.save(&snapshot).await {
                Ok(()) => debug!(
                    path = %store.path().display(),
                    servers = snapshot.servers.len(),
                    "configuration saved"
                ),
                Err(e) => warn!(error = %e, "failed to save configuration"),
            }
        }

        for ack in waiters {
            let _ = ack.send(());
        }
    }
}
