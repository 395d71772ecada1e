// src/supervisor.rs
//
// Registry of server definitions plus the table of live child processes.
//
// Every mutation goes through one exclusive lock, and that lock is never
// held across an await or a spawn. A start reserves its slot under the lock
// (so two concurrent starts cannot both win), spawns without it, then
// re-checks that the reservation is still its own before recording the child.
//
// Each running server has a watcher task that owns the `Child`. Stopping is a
// message to the watcher; when the process exits for any reason the watcher
// clears the slot, but only if the slot still carries its generation, so an
// old watcher can never mark a newer process of the same server as stopped.
//
// Every server runs as the leader of its own process group. Killing goes to
// the whole group, so wrappers like `sudo` cannot leave the real server behind.

use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use tokio::process::Child;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::SupervisorError;
use crate::model::{NetworkBinding, ServerFields, ServerRecord, id_order};
use crate::store::{ConfigSnapshot, Persister};
use crate::sys::{LaunchSpec, ServerLauncher};

const WILDCARD_HOST: &str = "0.0.0.0";

/// Sent to a watcher to kill its child; answered once the child is reaped.
type StopRequest = oneshot::Sender<io::Result<()>>;

struct ProcessSlot {
    generation: u64,
    pid: Option<u32>,
    /// `None` while the process is still being spawned.
    stop: Option<oneshot::Sender<StopRequest>>,
}

struct Registry {
    servers: HashMap<String, ServerRecord>,
    processes: HashMap<String, ProcessSlot>,
    next_id: u64,
    next_generation: u64,
}

impl Registry {
    fn snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot {
            servers: self
                .servers
                .iter()
                .map(|(id, record)| (id.clone(), record.clone()))
                .collect(),
            next_id: self.next_id,
        }
    }

    /// Marks `id` stopped and hands back its process slot, if any.
    fn take_process(&mut self, id: &str) -> Option<ProcessSlot> {
        if let Some(record) = self.servers.get_mut(id) {
            record.running = false;
        }
        self.processes.remove(id)
    }

    /// Called by a watcher when its process is gone.
    fn process_exited(&mut self, id: &str, generation: u64) {
        if self.processes.get(id).map(|slot| slot.generation) == Some(generation) {
            self.take_process(id);
        }
    }
}

pub struct Supervisor {
    registry: Arc<Mutex<Registry>>,
    launcher: Arc<dyn ServerLauncher>,
    persister: Persister,
}

impl Supervisor {
    /// Builds the registry from a reloaded snapshot. Nothing is running yet.
    pub fn new(snapshot: ConfigSnapshot, launcher: Arc<dyn ServerLauncher>, persister: Persister) -> Self {
        let servers = snapshot
            .servers
            .into_iter()
            .map(|(id, mut record)| {
                record.running = false;
                (id, record)
            })
            .collect();

        Self {
            registry: Arc::new(Mutex::new(Registry {
                servers,
                processes: HashMap::new(),
                next_id: snapshot.next_id.max(1),
                next_generation: 0,
            })),
            launcher,
            persister,
        }
    }

    pub fn create(&self, name: &str, port: &str, directory: &str) -> Result<String, SupervisorError> {
        let fields = ServerFields::parse(name, port, directory)?;

        let mut reg = self.registry.lock();
        let id = reg.next_id.to_string();
        reg.next_id += 1;
        reg.servers.insert(
            id.clone(),
            ServerRecord {
                id: id.clone(),
                name: fields.name,
                port: fields.port,
                directory: fields.directory,
                running: false,
                vlan_interface: None,
                ipv6_address: None,
            },
        );
        self.persister.save(reg.snapshot());
        Ok(id)
    }

    /// Overwrites name/port/directory. A running server is stopped first and
    /// stays stopped. A port change drops the network binding, which belongs
    /// to the old port.
    ///
    /// Returns the record as it was before the update.
    pub async fn update(
        &self,
        id: &str,
        name: &str,
        port: &str,
        directory: &str,
    ) -> Result<ServerRecord, SupervisorError> {
        let fields = ServerFields::parse(name, port, directory)?;

        let (previous, slot) = {
            let mut reg = self.registry.lock();
            let previous = reg
                .servers
                .get(id)
                .cloned()
                .ok_or_else(|| SupervisorError::NotFound(id.to_string()))?;
            let slot = reg.take_process(id);

            if let Some(record) = reg.servers.get_mut(id) {
                if record.port != fields.port {
                    record.vlan_interface = None;
                    record.ipv6_address = None;
                }
                record.name = fields.name;
                record.port = fields.port;
                record.directory = fields.directory;
            }
            self.persister.save(reg.snapshot());
            (previous, slot)
        };

        if let Some(slot) = slot {
            if let Err(e) = terminate(id, slot).await {
                warn!(server = id, error = %e, "stop before update failed");
            }
        }
        Ok(previous)
    }

    /// Removes the server, killing its process first if it has one.
    ///
    /// Returns the removed record; releasing its network identity is the
    /// caller's job.
    pub async fn delete(&self, id: &str) -> Result<ServerRecord, SupervisorError> {
        let (removed, slot) = {
            let mut reg = self.registry.lock();
            let slot = reg.take_process(id);
            let removed = reg
                .servers
                .remove(id)
                .ok_or_else(|| SupervisorError::NotFound(id.to_string()))?;
            self.persister.save(reg.snapshot());
            (removed, slot)
        };

        if let Some(slot) = slot {
            if let Err(e) = terminate(id, slot).await {
                warn!(server = id, error = %e, "stop before delete failed");
            }
        }
        Ok(removed)
    }

    /// Launches the server process and starts watching it.
    pub async fn start(&self, id: &str) -> Result<(), SupervisorError> {
        let (spec, generation) = {
            let mut reg = self.registry.lock();
            let record = reg
                .servers
                .get(id)
                .ok_or_else(|| SupervisorError::NotFound(id.to_string()))?;
            if record.running {
                return Err(SupervisorError::AlreadyRunning(id.to_string()));
            }

            let spec = LaunchSpec {
                listen_host: record
                    .ipv6_address
                    .as_ref()
                    .map(|addr| format!("[{addr}]"))
                    .unwrap_or_else(|| WILDCARD_HOST.to_string()),
                port: record.port,
                document_root: record.directory.clone(),
            };

            reg.next_generation += 1;
            let generation = reg.next_generation;
            reg.processes.insert(
                id.to_string(),
                ProcessSlot {
                    generation,
                    pid: None,
                    stop: None,
                },
            );
            if let Some(record) = reg.servers.get_mut(id) {
                record.running = true;
            }
            (spec, generation)
        };

        let mut cmd = self.launcher.command(&spec);
        cmd.process_group(0).kill_on_drop(true);
        let spawned = cmd.spawn();

        let mut reg = self.registry.lock();
        let still_ours = reg.processes.get(id).map(|slot| slot.generation) == Some(generation);

        let mut child = match spawned {
            Ok(child) => child,
            Err(source) => {
                if still_ours {
                    reg.take_process(id);
                }
                return Err(SupervisorError::Launch {
                    id: id.to_string(),
                    source,
                });
            }
        };

        if !still_ours {
            drop(reg);
            // Stopped or deleted while we were spawning.
            tokio::spawn(async move {
                let pid = child.id();
                if let Err(e) = kill_process_group(&mut child, pid).await {
                    warn!(pid, error = %e, "failed to kill aborted server process");
                }
            });
            return Err(SupervisorError::StartAborted(id.to_string()));
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let pid = child.id();
        if let Some(slot) = reg.processes.get_mut(id) {
            slot.pid = pid;
            slot.stop = Some(stop_tx);
        }
        drop(reg);

        info!(server = id, pid, listen = %spec.listen_addr(), root = %spec.document_root, "server started");
        tokio::spawn(watch(
            child,
            stop_rx,
            Arc::clone(&self.registry),
            id.to_string(),
            generation,
        ));
        Ok(())
    }

    /// Kills the server process. A missing handle counts as already stopped.
    pub async fn stop(&self, id: &str) -> Result<(), SupervisorError> {
        let slot = {
            let mut reg = self.registry.lock();
            let record = reg
                .servers
                .get(id)
                .ok_or_else(|| SupervisorError::NotFound(id.to_string()))?;
            if !record.running {
                return Err(SupervisorError::NotRunning(id.to_string()));
            }
            reg.take_process(id)
        };

        match slot {
            Some(slot) => terminate(id, slot).await,
            None => Ok(()),
        }
    }

    /// `None` if the server does not exist, otherwise whether it is running.
    pub fn status(&self, id: &str) -> Option<bool> {
        self.registry.lock().servers.get(id).map(|record| record.running)
    }

    pub fn get(&self, id: &str) -> Option<ServerRecord> {
        self.registry.lock().servers.get(id).cloned()
    }

    pub fn pid(&self, id: &str) -> Option<u32> {
        self.registry.lock().processes.get(id).and_then(|slot| slot.pid)
    }

    /// Copies of every record, ordered by id.
    pub fn list_all(&self) -> Vec<ServerRecord> {
        let mut records: Vec<ServerRecord> = self.registry.lock().servers.values().cloned().collect();
        records.sort_by(|a, b| id_order(&a.id, &b.id));
        records
    }

    /// Records which interface/address the server should bind to.
    pub fn attach_network(&self, id: &str, binding: Option<NetworkBinding>) -> Result<(), SupervisorError> {
        let mut reg = self.registry.lock();
        let record = reg
            .servers
            .get_mut(id)
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))?;

        let (interface, address) = match binding {
            Some(binding) => (Some(binding.interface), Some(binding.ipv6_address)),
            None => (None, None),
        };
        record.vlan_interface = interface;
        record.ipv6_address = address;
        self.persister.save(reg.snapshot());
        Ok(())
    }

    /// Stops every running server. Used on shutdown.
    pub async fn stop_all(&self) -> usize {
        let running: Vec<String> = {
            let reg = self.registry.lock();
            reg.servers
                .values()
                .filter(|record| record.running)
                .map(|record| record.id.clone())
                .collect()
        };

        let mut stopped = 0;
        for id in running {
            match self.stop(&id).await {
                Ok(()) => stopped += 1,
                Err(e) => warn!(server = %id, error = %e, "failed to stop server during shutdown"),
            }
        }
        stopped
    }

    pub fn snapshot(&self) -> ConfigSnapshot {
        self.registry.lock().snapshot()
    }

    /// Queues the current state and waits until it is on disk.
    pub async fn flush(&self) {
        self.persister.save(self.snapshot());
        self.persister.flush().await;
    }
}

async fn terminate(id: &str, slot: ProcessSlot) -> Result<(), SupervisorError> {
    // A slot without a stop channel is mid-spawn; `start` notices the slot is
    // gone and kills the child itself.
    let Some(stop) = slot.stop else {
        return Ok(());
    };

    let (ack_tx, ack_rx) = oneshot::channel();
    if stop.send(ack_tx).is_err() {
        // Watcher already reaped the process.
        return Ok(());
    }

    match ack_rx.await {
        Ok(Ok(())) | Err(_) => Ok(()),
        Ok(Err(source)) => Err(SupervisorError::Kill {
            id: id.to_string(),
            source,
        }),
    }
}

/// SIGKILLs the group led by `pid`. A group that no longer exists is fine.
fn signal_group(pid: Option<u32>) -> io::Result<()> {
    let Some(pgid) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return Ok(());
    };
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(io::Error::from(errno)),
    }
}

/// Kills the child together with everything in its process group, then reaps it.
async fn kill_process_group(child: &mut Child, pid: Option<u32>) -> io::Result<()> {
    signal_group(pid)?;
    match child.kill().await {
        Ok(()) => Ok(()),
        // Nothing left to kill.
        Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
        Err(e) => Err(e),
    }
}

async fn watch(
    mut child: Child,
    stop_rx: oneshot::Receiver<StopRequest>,
    registry: Arc<Mutex<Registry>>,
    id: String,
    generation: u64,
) {
    let pid = child.id();

    tokio::select! {
        status = child.wait() => {
            match status {
                Ok(status) => info!(server = %id, pid, %status, "server process exited"),
                Err(e) => warn!(server = %id, pid, error = %e, "failed to wait on server process"),
            }
            // The leader is gone; anything it forked is still in its group.
            if let Err(e) = signal_group(pid) {
                warn!(server = %id, pid, error = %e, "failed to kill leftover server processes");
            }
        },
        Ok(ack) = stop_rx => {
            let result = kill_process_group(&mut child, pid).await;
            debug!(server = %id, pid, "server process killed");
            registry.lock().process_exited(&id, generation);
            let _ = ack.send(result);
            return;
        }
    }

    registry.lock().process_exited(&id, generation);
}
