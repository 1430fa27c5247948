//! Health monitor daemon.
//!
//! The daemon plugs into the supervisor as its [`SupervisionHook`]: it
//! turns unexpected exits into crash events and bounded automatic
//! restarts, and runs the periodic resource sampler over all live
//! instances. Restart bookkeeping lives on the instance record itself so
//! attempts survive the daemon's own lifecycle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use gamectl_core::{Event, EventBus, InstanceStore, SupervisorError};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::resources::ResourceSampler;
use crate::supervisor::{SupervisionHook, Supervisor};

/// Daemon tuning knobs.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Delay before an automatic restart attempt.
    pub restart_delay: Duration,
    /// Interval between resource sampling ticks.
    pub sample_interval: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            restart_delay: Duration::from_secs(5),
            sample_interval: Duration::from_secs(10),
        }
    }
}

/// Health monitor over the supervisor's instances.
pub struct Daemon {
    supervisor: Arc<Supervisor>,
    store: Arc<dyn InstanceStore>,
    bus: Arc<EventBus>,
    config: DaemonConfig,
    shutdown: CancellationToken,
}

impl Daemon {
    /// Create the daemon and attach it to the supervisor as its hook.
    #[must_use]
    pub fn attach(
        supervisor: Arc<Supervisor>,
        store: Arc<dyn InstanceStore>,
        bus: Arc<EventBus>,
        config: DaemonConfig,
    ) -> Arc<Self> {
        let daemon = Arc::new(Self {
            supervisor: Arc::clone(&supervisor),
            store,
            bus,
            config,
            shutdown: CancellationToken::new(),
        });
        supervisor.attach_hook(Arc::clone(&daemon) as Arc<dyn SupervisionHook>);
        daemon
    }

    /// Spawn the periodic resource sampler. Runs until [`Self::shutdown`].
    pub fn spawn_sampler(self: &Arc<Self>) {
        let daemon = Arc::clone(self);
        tokio::spawn(async move {
            let mut sampler = ResourceSampler::new();
            let mut ticker = tokio::time::interval(daemon.config.sample_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = daemon.shutdown.cancelled() => break,
                    _ = ticker.tick() => daemon.sample_once(&mut sampler).await,
                }
            }
            debug!("resource sampler task exiting");
        });
    }

    /// Cancel the sampler and any pending restart timers.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn sample_once(&self, sampler: &mut ResourceSampler) {
        let running = self.supervisor.running().await;
        if running.is_empty() {
            return;
        }

        for (id, snapshot) in sampler.sample(&running) {
            let sample = snapshot.clone();
            if let Err(e) = self
                .store
                .update(&id, Box::new(move |instance| instance.resources = Some(sample)))
                .await
            {
                debug!(id = %id, error = %e, "Skipping sample for unknown instance");
            }
            self.bus.emit(&Event::ResourceUsage {
                instance_id: id,
                cpu_percent: snapshot.cpu_percent,
                memory_bytes: snapshot.memory_bytes,
            });
        }
    }

    /// Classify a crash and schedule a restart if policy allows.
    async fn handle_crash(&self, id: &str, exit_code: Option<i32>) {
        // The restart decision and the attempt increment happen inside one
        // store update, so a concurrent sampler or exit write cannot wedge
        // in between and lose the counter.
        let restarting = Arc::new(AtomicBool::new(false));
        let decision = Arc::clone(&restarting);
        let instance = match self
            .store
            .update(
                id,
                Box::new(move |instance| {
                    if instance.auto_restart
                        && instance.restart_attempts < instance.max_restart_attempts
                    {
                        instance.restart_attempts += 1;
                        decision.store(true, Ordering::SeqCst);
                    }
                }),
            )
            .await
        {
            Ok(instance) => instance,
            Err(e) => {
                warn!(id = %id, error = %e, "Crashed instance has no record; cannot apply restart policy");
                return;
            }
        };

        let will_restart = restarting.load(Ordering::SeqCst);
        let attempts = instance.restart_attempts;
        let max_attempts = instance.max_restart_attempts;

        warn!(
            id = %id,
            ?exit_code,
            attempts,
            max_attempts,
            will_restart,
            "Instance crashed"
        );
        self.bus.emit(&Event::ServerCrashed {
            instance_id: id.to_string(),
            exit_code,
            restart_attempts: attempts,
            max_restart_attempts: max_attempts,
            will_restart,
        });

        if will_restart {
            self.schedule_restart(id, attempts);
        } else if instance.auto_restart {
            error!(id = %id, attempts, "Restart attempts exhausted; giving up");
            self.bus.emit(&Event::ServerRestartFailed {
                instance_id: id.to_string(),
                attempts,
            });
        }
    }

    fn schedule_restart(&self, id: &str, attempt: u32) {
        let supervisor = Arc::clone(&self.supervisor);
        let store = Arc::clone(&self.store);
        let bus = Arc::clone(&self.bus);
        let delay = self.config.restart_delay;
        let shutdown = self.shutdown.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                () = shutdown.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
            // auto_restart may have been disabled while the timer ran;
            // that is the only way to call off a scheduled restart.
            match store.load(&id).await {
                Ok(instance) if instance.auto_restart => {}
                _ => {
                    info!(id = %id, "Scheduled restart called off");
                    return;
                }
            }
            info!(id = %id, attempt, "Attempting automatic restart");
            match supervisor.start_internal(&id, false).await {
                Ok(()) => {}
                // A manual start won the race during the backoff. The
                // instance is healthy, so this is not a restart failure.
                Err(SupervisorError::AlreadyRunning(_)) => {
                    info!(id = %id, "Instance already running; scheduled restart skipped");
                }
                Err(e) => {
                    warn!(id = %id, attempt, error = %e, "Automatic restart failed");
                    bus.emit(&Event::ServerRestartFailed {
                        instance_id: id,
                        attempts: attempt,
                    });
                }
            }
        });
    }
}

#[async_trait]
impl SupervisionHook for Daemon {
    async fn process_started(&self, instance_id: &str, manual: bool) {
        debug!(id = %instance_id, manual, "Instance started");
    }

    async fn process_exited(&self, instance_id: &str, expected: bool, exit_code: Option<i32>) {
        if expected {
            debug!(id = %instance_id, "Instance stopped as requested");
        } else {
            self.handle_crash(instance_id, exit_code).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gamectl_core::{EventKind, FnHandler, Instance, LaunchSpec, MemoryInstanceStore};
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn harness(config: DaemonConfig) -> (Arc<MemoryInstanceStore>, Arc<EventBus>, Arc<Daemon>) {
        let store = Arc::new(MemoryInstanceStore::new());
        let bus = Arc::new(EventBus::new());
        let supervisor = Arc::new(Supervisor::new(
            store.clone() as Arc<dyn InstanceStore>,
            Arc::clone(&bus),
        ));
        let daemon = Daemon::attach(
            supervisor,
            store.clone() as Arc<dyn InstanceStore>,
            Arc::clone(&bus),
            config,
        );
        (store, bus, daemon)
    }

    fn instance(id: &str, auto_restart: bool, max_attempts: u32) -> Instance {
        let mut instance = Instance::new(
            id,
            id,
            LaunchSpec::Custom {
                command_line: "sleep 30".to_string(),
            },
            std::env::temp_dir(),
        );
        instance.auto_restart = auto_restart;
        instance.max_restart_attempts = max_attempts;
        instance
    }

    fn capture(bus: &EventBus, kind: EventKind) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        bus.subscribe(
            kind,
            Arc::new(FnHandler(move |event| {
                let _ = tx.send(event);
            })),
        );
        rx
    }

    #[tokio::test]
    async fn crash_without_auto_restart_is_reported_and_not_retried() {
        let (store, bus, daemon) = harness(DaemonConfig::default());
        store.save(&instance("a", false, 3)).await.unwrap();
        let mut crashed = capture(&bus, EventKind::ServerCrashed);

        daemon.process_exited("a", false, Some(1)).await;

        let event = timeout(Duration::from_secs(1), crashed.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            Event::ServerCrashed {
                will_restart,
                restart_attempts,
                exit_code,
                ..
            } => {
                assert!(!will_restart);
                assert_eq!(restart_attempts, 0);
                assert_eq!(exit_code, Some(1));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(store.load("a").await.unwrap().restart_attempts, 0);
    }

    #[tokio::test]
    async fn crash_with_auto_restart_increments_attempts() {
        let (store, bus, daemon) = harness(DaemonConfig {
            restart_delay: Duration::from_secs(60),
            ..DaemonConfig::default()
        });
        store.save(&instance("a", true, 3)).await.unwrap();
        let mut crashed = capture(&bus, EventKind::ServerCrashed);

        daemon.process_exited("a", false, None).await;

        let event = timeout(Duration::from_secs(1), crashed.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            Event::ServerCrashed {
                will_restart,
                restart_attempts,
                max_restart_attempts,
                ..
            } => {
                assert!(will_restart);
                assert_eq!(restart_attempts, 1);
                assert_eq!(max_restart_attempts, 3);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(store.load("a").await.unwrap().restart_attempts, 1);
    }

    #[tokio::test]
    async fn exhausted_attempts_emit_restart_failed() {
        let (store, bus, daemon) = harness(DaemonConfig::default());
        let mut record = instance("a", true, 2);
        record.restart_attempts = 2;
        store.save(&record).await.unwrap();
        let mut failed = capture(&bus, EventKind::ServerRestartFailed);

        daemon.process_exited("a", false, Some(137)).await;

        let event = timeout(Duration::from_secs(1), failed.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            Event::ServerRestartFailed { attempts, .. } => assert_eq!(attempts, 2),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn manual_start_during_backoff_is_not_a_restart_failure() {
        let (store, bus, daemon) = harness(DaemonConfig {
            restart_delay: Duration::from_millis(300),
            ..DaemonConfig::default()
        });
        store.save(&instance("a", true, 3)).await.unwrap();
        let mut failed = capture(&bus, EventKind::ServerRestartFailed);

        // Crash schedules a restart; a manual start beats the timer.
        daemon.process_exited("a", false, Some(1)).await;
        daemon.supervisor.start("a").await.unwrap();

        // The scheduled attempt finds the instance running and must not
        // report a terminal restart failure.
        assert!(
            timeout(Duration::from_millis(800), failed.recv())
                .await
                .is_err()
        );
        assert!(daemon.supervisor.is_running("a").await);

        daemon.supervisor.stop("a").await.unwrap();
    }

    #[tokio::test]
    async fn expected_exits_do_not_trigger_crash_handling() {
        let (store, bus, daemon) = harness(DaemonConfig::default());
        store.save(&instance("a", true, 3)).await.unwrap();
        let mut crashed = capture(&bus, EventKind::ServerCrashed);

        daemon.process_exited("a", true, Some(0)).await;

        assert!(
            timeout(Duration::from_millis(200), crashed.recv())
                .await
                .is_err()
        );
        assert_eq!(store.load("a").await.unwrap().restart_attempts, 0);
    }
}
