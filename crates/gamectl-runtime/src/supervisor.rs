//! Per-instance process supervision.
//!
//! The [`Supervisor`] owns the one-to-one relationship between an instance
//! and its OS process. The registry map is the sole arbiter of "at most one
//! live handle per instance": starts reserve the key under the write lock
//! before spawning, and the exit-watch task removes the key under the same
//! lock when the process is reaped. Stop requests and organic exits are
//! disambiguated through that lock as well, so a crash landing in the same
//! instant as a `stop()` is never misclassified.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use gamectl_core::{
    Event, EventBus, Instance, InstanceStatus, InstanceStore, StatusReply, SupervisorError, now_ms,
};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, RwLock, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::logs::{LogLine, LogSink};
use crate::shutdown;

/// Supervisor tuning knobs.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// How long to wait for a graceful exit before forcing a kill.
    pub stop_grace: Duration,
    /// Console command that asks a managed (jar) server to shut down.
    pub stop_command: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(30),
            stop_command: "stop".to_string(),
        }
    }
}

/// Seam between the supervisor and the health daemon.
///
/// The supervisor reports lifecycle edges; the daemon turns them into
/// crash/restart policy. When no hook is attached (unit tests), the edges
/// are simply dropped.
#[async_trait]
pub trait SupervisionHook: Send + Sync {
    /// A process was spawned and registered. `manual` is true for
    /// caller-initiated starts, false for daemon-initiated restarts.
    async fn process_started(&self, instance_id: &str, manual: bool);

    /// A process was reaped. `expected` is true when a stop request
    /// preceded the exit.
    async fn process_exited(&self, instance_id: &str, expected: bool, exit_code: Option<i32>);
}

/// Live binding between an instance and its OS process.
struct ProcessHandle {
    pid: u32,
    /// Command sink; the mutex serializes writers.
    stdin: Arc<Mutex<ChildStdin>>,
    /// Whether graceful shutdown goes through the console (`stop` command)
    /// or an OS signal.
    console_stop: bool,
    /// Set by `stop()` under the registry lock; read by the exit-watch
    /// under the same lock to classify the exit.
    stop_requested: bool,
    /// Resolves once the exit-watch has reaped the process.
    exited_rx: watch::Receiver<bool>,
}

/// Registry slot. `Reserved` holds the key between the admission check and
/// the handle commit so the spawn syscall can happen outside the lock.
enum Slot {
    Reserved,
    Live(ProcessHandle),
}

/// Supervisor for game-server instances.
pub struct Supervisor {
    store: Arc<dyn InstanceStore>,
    bus: Arc<EventBus>,
    logs: Arc<LogSink>,
    registry: Arc<RwLock<HashMap<String, Slot>>>,
    hook: Arc<OnceLock<Arc<dyn SupervisionHook>>>,
    config: SupervisorConfig,
}

/// Everything the exit-watch task needs after `start` returns.
struct ExitWatch {
    registry: Arc<RwLock<HashMap<String, Slot>>>,
    store: Arc<dyn InstanceStore>,
    bus: Arc<EventBus>,
    hook: Arc<OnceLock<Arc<dyn SupervisionHook>>>,
}

impl Supervisor {
    /// Create a supervisor with default configuration.
    #[must_use]
    pub fn new(store: Arc<dyn InstanceStore>, bus: Arc<EventBus>) -> Self {
        Self::with_config(store, bus, SupervisorConfig::default())
    }

    /// Create a supervisor with explicit configuration.
    #[must_use]
    pub fn with_config(
        store: Arc<dyn InstanceStore>,
        bus: Arc<EventBus>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            store,
            bus,
            logs: Arc::new(LogSink::new()),
            registry: Arc::new(RwLock::new(HashMap::new())),
            hook: Arc::new(OnceLock::new()),
            config,
        }
    }

    /// Attach the supervision hook (the daemon). May only be called once.
    pub fn attach_hook(&self, hook: Arc<dyn SupervisionHook>) {
        if self.hook.set(hook).is_err() {
            warn!("Supervision hook already attached; ignoring");
        }
    }

    /// Start an instance by ID. Resets the auto-restart counter.
    pub async fn start(&self, id: &str) -> Result<(), SupervisorError> {
        self.start_internal(id, true).await
    }

    /// Start without resetting the restart counter (daemon restarts).
    pub(crate) async fn start_internal(
        &self,
        id: &str,
        manual: bool,
    ) -> Result<(), SupervisorError> {
        // Admission first: the registry key is the sole arbiter, and a
        // start on a running instance must report AlreadyRunning even when
        // its launch config has gone invalid since the spawn. Reserving
        // before the spawn makes a concurrent start lose immediately; the
        // spawn itself runs outside the lock.
        {
            let mut registry = self.registry.write().await;
            if registry.contains_key(id) {
                return Err(SupervisorError::AlreadyRunning(id.to_string()));
            }
            registry.insert(id.to_string(), Slot::Reserved);
        }

        let instance = match self.store.load(id).await {
            Ok(instance) => instance,
            Err(_) => {
                self.registry.write().await.remove(id);
                return Err(SupervisorError::NotFound(id.to_string()));
            }
        };
        let (program, args) = match validate_launch(&instance) {
            Ok(argv) => argv,
            Err(e) => {
                self.registry.write().await.remove(id);
                return Err(e);
            }
        };

        if let Err(e) = self
            .store
            .update(
                id,
                Box::new(|instance| instance.status = InstanceStatus::Starting),
            )
            .await
        {
            self.registry.write().await.remove(id);
            return Err(e.into());
        }
        self.bus.emit(&Event::ServerStarting {
            instance_id: id.to_string(),
        });

        info!(id = %id, program = %program, "Starting instance");
        let spawned = Command::new(&program)
            .args(&args)
            .current_dir(&instance.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(source) => {
                self.abort_start(id).await;
                return Err(SupervisorError::SpawnFailure {
                    instance_id: id.to_string(),
                    source,
                });
            }
        };

        let Some(pid) = child.id() else {
            // Exited between spawn and here; reap on a detached task.
            tokio::spawn(async move {
                let _ = child.wait().await;
            });
            self.abort_start(id).await;
            return Err(SupervisorError::SpawnFailure {
                instance_id: id.to_string(),
                source: std::io::Error::other("child exited before a PID was observed"),
            });
        };

        let Some(stdin) = child.stdin.take() else {
            let _ = child.start_kill();
            tokio::spawn(async move {
                let _ = child.wait().await;
            });
            self.abort_start(id).await;
            return Err(SupervisorError::Io {
                instance_id: id.to_string(),
                source: std::io::Error::other("child stdin pipe unavailable"),
            });
        };

        self.spawn_output_readers(id, &mut child);

        let (exited_tx, exited_rx) = watch::channel(false);
        let handle = ProcessHandle {
            pid,
            stdin: Arc::new(Mutex::new(stdin)),
            console_stop: instance.launch.accepts_console_stop(),
            stop_requested: false,
            exited_rx,
        };
        self.registry
            .write()
            .await
            .insert(id.to_string(), Slot::Live(handle));

        let persisted = self
            .store
            .update(
                id,
                Box::new(move |instance| {
                    instance.status = InstanceStatus::Running;
                    instance.pid = Some(pid);
                    if manual {
                        instance.restart_attempts = 0;
                    }
                }),
            )
            .await;
        if let Err(e) = persisted {
            warn!(id = %id, error = %e, "Failed to persist running status");
        }
        info!(id = %id, pid = %pid, "Instance running");
        self.bus.emit(&Event::ServerStarted {
            instance_id: id.to_string(),
            pid,
        });

        if let Some(hook) = self.hook.get() {
            hook.process_started(id, manual).await;
        }

        let watcher = ExitWatch {
            registry: Arc::clone(&self.registry),
            store: Arc::clone(&self.store),
            bus: Arc::clone(&self.bus),
            hook: Arc::clone(&self.hook),
        };
        let watch_id = id.to_string();
        tokio::spawn(async move {
            watcher.run(watch_id, child, exited_tx).await;
        });

        Ok(())
    }

    /// Gracefully stop a running instance, escalating to a forced kill
    /// after the grace period. Returns once the process has been reaped.
    pub async fn stop(&self, id: &str) -> Result<(), SupervisorError> {
        let (pid, stdin, console_stop, mut exited_rx) = {
            let mut registry = self.registry.write().await;
            match registry.get_mut(id) {
                Some(Slot::Live(handle)) if !handle.stop_requested => {
                    handle.stop_requested = true;
                    (
                        handle.pid,
                        Arc::clone(&handle.stdin),
                        handle.console_stop,
                        handle.exited_rx.clone(),
                    )
                }
                _ => return Err(SupervisorError::NotRunning(id.to_string())),
            }
        };

        let stopping = self
            .store
            .update(
                id,
                Box::new(|instance| instance.status = InstanceStatus::Stopping),
            )
            .await;
        if let Err(e) = stopping {
            warn!(id = %id, error = %e, "Failed to persist stopping status");
        }
        self.bus.emit(&Event::ServerStopping {
            instance_id: id.to_string(),
        });

        // Graceful request: console command for managed servers, SIGTERM
        // otherwise. A dead stdin pipe falls back to the signal.
        let mut graceful_sent = false;
        if console_stop {
            let mut sink = stdin.lock().await;
            let line = format!("{}\n", self.config.stop_command);
            match sink.write_all(line.as_bytes()).await {
                Ok(()) => {
                    let _ = sink.flush().await;
                    graceful_sent = true;
                }
                Err(e) => debug!(id = %id, error = %e, "Console stop failed; falling back to signal"),
            }
        }
        if !graceful_sent {
            if let Err(e) = shutdown::terminate(pid) {
                warn!(id = %id, pid = %pid, error = %e, "Terminate signal failed");
            }
        }

        // Block until the exit-watch reaps the process.
        let reaped = timeout(self.config.stop_grace, exited_rx.wait_for(|done| *done))
            .await
            .is_err();
        if reaped {
            warn!(
                id = %id,
                pid = %pid,
                grace_secs = self.config.stop_grace.as_secs(),
                "Graceful stop timed out; escalating to forced kill"
            );
            if let Err(e) = shutdown::force_kill(pid) {
                warn!(id = %id, pid = %pid, error = %e, "Forced kill failed");
            }
            let _ = exited_rx.wait_for(|done| *done).await;
        }

        Ok(())
    }

    /// Restart: stop (tolerating an already-stopped instance) then start.
    pub async fn restart(&self, id: &str) -> Result<(), SupervisorError> {
        match self.stop(id).await {
            Ok(()) | Err(SupervisorError::NotRunning(_)) => {}
            Err(e) => return Err(e),
        }
        self.start(id).await
    }

    /// Write one command line to the instance's stdin.
    pub async fn send_command(&self, id: &str, command: &str) -> Result<(), SupervisorError> {
        let stdin = {
            let registry = self.registry.read().await;
            match registry.get(id) {
                Some(Slot::Live(handle)) => Arc::clone(&handle.stdin),
                _ => return Err(SupervisorError::NotRunning(id.to_string())),
            }
        };

        let mut sink = stdin.lock().await;
        let line = format!("{command}\n");
        sink.write_all(line.as_bytes())
            .await
            .map_err(|source| SupervisorError::Io {
                instance_id: id.to_string(),
                source,
            })?;
        sink.flush().await.map_err(|source| SupervisorError::Io {
            instance_id: id.to_string(),
            source,
        })
    }

    /// Current status and PID for an instance.
    pub async fn get_status(&self, id: &str) -> Result<StatusReply, SupervisorError> {
        let instance = self
            .store
            .load(id)
            .await
            .map_err(|_| SupervisorError::NotFound(id.to_string()))?;
        Ok(StatusReply {
            instance_id: instance.id,
            status: instance.status,
            pid: instance.pid,
        })
    }

    /// Last `lines` captured output lines for an instance.
    #[must_use]
    pub fn get_logs(&self, id: &str, lines: usize) -> Vec<LogLine> {
        self.logs.tail(id, lines)
    }

    /// Whether a live handle is registered for the instance.
    pub async fn is_running(&self, id: &str) -> bool {
        matches!(self.registry.read().await.get(id), Some(Slot::Live(_)))
    }

    /// IDs and PIDs of all live instances, for the resource sampler.
    pub async fn running(&self) -> Vec<(String, u32)> {
        self.registry
            .read()
            .await
            .iter()
            .filter_map(|(id, slot)| match slot {
                Slot::Live(handle) => Some((id.clone(), handle.pid)),
                Slot::Reserved => None,
            })
            .collect()
    }

    /// Remove the reservation and revert status after a failed start.
    async fn abort_start(&self, id: &str) {
        self.registry.write().await.remove(id);
        let reverted = self
            .store
            .update(
                id,
                Box::new(|instance| {
                    instance.status = InstanceStatus::Stopped;
                    instance.pid = None;
                }),
            )
            .await;
        if let Err(e) = reverted {
            warn!(id = %id, error = %e, "Failed to revert status after aborted start");
        }
    }

    fn spawn_output_readers(&self, id: &str, child: &mut Child) {
        if let Some(stdout) = child.stdout.take() {
            self.spawn_reader(id, stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            self.spawn_reader(id, stderr);
        }
    }

    fn spawn_reader<R>(&self, id: &str, stream: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let logs = Arc::clone(&self.logs);
        let bus = Arc::clone(&self.bus);
        let id = id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(text)) = lines.next_line().await {
                logs.push(&id, &text);
                bus.emit(&Event::ServerLog {
                    instance_id: id.clone(),
                    line: text,
                });
            }
            debug!(id = %id, "output reader task exiting");
        });
    }
}

impl ExitWatch {
    /// Owns the child, blocks on `wait()`, and classifies the exit under
    /// the registry lock. Removing the handle here, after the process is
    /// fully reaped, is what makes a follow-up `start()` safe.
    async fn run(self, id: String, mut child: Child, exited_tx: watch::Sender<bool>) {
        let status = child.wait().await;
        let exit_code = status.as_ref().ok().and_then(std::process::ExitStatus::code);

        let expected = {
            let mut registry = self.registry.write().await;
            match registry.remove(&id) {
                Some(Slot::Live(handle)) => handle.stop_requested,
                _ => false,
            }
        };
        debug!(id = %id, ?exit_code, expected, "Instance process reaped");

        let persisted = self
            .store
            .update(
                &id,
                Box::new(move |instance| {
                    instance.pid = None;
                    if expected {
                        instance.status = InstanceStatus::Stopped;
                    } else {
                        instance.status = InstanceStatus::Crashed;
                        instance.last_crash_ms = Some(now_ms());
                    }
                }),
            )
            .await;
        if let Err(e) = persisted {
            warn!(id = %id, error = %e, "Instance record missing at exit");
        }

        if expected {
            self.bus.emit(&Event::ServerStopped {
                instance_id: id.clone(),
            });
        }

        // Unblocks stop() before the hook runs so the caller returns as
        // soon as the registry and store reflect the exit.
        let _ = exited_tx.send(true);

        if let Some(hook) = self.hook.get() {
            hook.process_exited(&id, expected, exit_code).await;
        }
    }
}

/// Check the launch configuration and produce argv.
fn validate_launch(instance: &Instance) -> Result<(String, Vec<String>), SupervisorError> {
    use gamectl_core::LaunchSpec;

    let invalid = |reason: String| SupervisorError::InvalidConfig {
        instance_id: instance.id.clone(),
        reason,
    };

    match &instance.launch {
        LaunchSpec::Jar {
            java_path,
            jar_path,
            ..
        } => {
            if !java_path.exists() {
                return Err(invalid(format!(
                    "java executable not found: {}",
                    java_path.display()
                )));
            }
            if !jar_path.exists() {
                return Err(invalid(format!(
                    "server jar not found: {}",
                    jar_path.display()
                )));
            }
        }
        LaunchSpec::Custom { .. } => {}
    }

    instance
        .launch
        .argv()
        .ok_or_else(|| invalid("empty custom command line".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gamectl_core::{LaunchSpec, MemoryInstanceStore};
    use std::path::PathBuf;

    fn harness() -> (Arc<MemoryInstanceStore>, Arc<EventBus>, Arc<Supervisor>) {
        let store = Arc::new(MemoryInstanceStore::new());
        let bus = Arc::new(EventBus::new());
        let supervisor = Arc::new(Supervisor::new(
            store.clone() as Arc<dyn InstanceStore>,
            Arc::clone(&bus),
        ));
        (store, bus, supervisor)
    }

    fn custom(id: &str, command_line: &str) -> Instance {
        Instance::new(
            id,
            id,
            LaunchSpec::Custom {
                command_line: command_line.to_string(),
            },
            std::env::temp_dir(),
        )
    }

    #[tokio::test]
    async fn start_unknown_instance_is_not_found() {
        let (_, _, supervisor) = harness();
        assert!(matches!(
            supervisor.start("ghost").await,
            Err(SupervisorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn stop_without_handle_is_not_running() {
        let (store, _, supervisor) = harness();
        store.save(&custom("a", "./srv")).await.unwrap();
        assert!(matches!(
            supervisor.stop("a").await,
            Err(SupervisorError::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn send_command_without_handle_is_not_running() {
        let (store, _, supervisor) = harness();
        store.save(&custom("a", "./srv")).await.unwrap();
        assert!(matches!(
            supervisor.send_command("a", "say hi").await,
            Err(SupervisorError::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn start_with_empty_command_is_invalid_config() {
        let (store, _, supervisor) = harness();
        store.save(&custom("a", "   ")).await.unwrap();
        assert!(matches!(
            supervisor.start("a").await,
            Err(SupervisorError::InvalidConfig { .. })
        ));
        // Failed validation must not leave a reservation behind.
        assert!(!supervisor.is_running("a").await);
    }

    #[tokio::test]
    async fn start_with_missing_jar_is_invalid_config() {
        let (store, _, supervisor) = harness();
        let instance = Instance::new(
            "a",
            "a",
            LaunchSpec::Jar {
                java_path: PathBuf::from("/definitely/not/java"),
                jar_path: PathBuf::from("/definitely/not/server.jar"),
                memory_min_mb: 256,
                memory_max_mb: 512,
                extra_args: vec![],
            },
            std::env::temp_dir(),
        );
        store.save(&instance).await.unwrap();
        assert!(matches!(
            supervisor.start("a").await,
            Err(SupervisorError::InvalidConfig { .. })
        ));
    }

    #[tokio::test]
    async fn failed_spawn_reverts_registry_and_status() {
        let (store, _, supervisor) = harness();
        store
            .save(&custom("a", "/definitely/not/a/binary"))
            .await
            .unwrap();

        assert!(matches!(
            supervisor.start("a").await,
            Err(SupervisorError::SpawnFailure { .. })
        ));
        assert!(!supervisor.is_running("a").await);
        let instance = store.load("a").await.unwrap();
        assert_eq!(instance.status, InstanceStatus::Stopped);
        assert!(instance.pid.is_none());
    }
}
