//! Batch operation coordinator.
//!
//! Applies one lifecycle action across many instances without a single
//! failure aborting the batch. Validation happens synchronously at submit
//! time; execution runs on its own task, one target at a time with a short
//! pause between targets to bound host load. Per-target outcomes and
//! progress are observable both through the operation record and through
//! `batch:progress` / `batch:complete` events.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use gamectl_core::{BatchError, Event, EventBus, InstanceStore, SupervisorError, now_ms};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::supervisor::Supervisor;

/// The closed set of batch-applicable lifecycle actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchKind {
    Start,
    Stop,
    Restart,
    Delete,
}

impl std::str::FromStr for BatchKind {
    type Err = BatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "restart" => Ok(Self::Restart),
            "delete" => Ok(Self::Delete),
            other => Err(BatchError::Validation(format!(
                "unknown batch operation '{other}'"
            ))),
        }
    }
}

/// Lifecycle of one batch operation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Running,
    Completed,
    Failed,
    PartialSuccess,
    Cancelled,
}

impl BatchStatus {
    /// Wire name carried in `batch:complete` events.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::PartialSuccess => "partial_success",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Outcome for one target within a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One batch operation: identity, targets, live progress and results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOperation {
    pub id: String,
    pub kind: BatchKind,
    /// Targets in submission order; execution follows this order.
    pub targets: Vec<String>,
    pub status: BatchStatus,
    /// Percent complete, 0–100, monotonically non-decreasing.
    pub progress: u8,
    /// Per-target outcomes, filled in as execution proceeds.
    pub results: HashMap<String, TargetResult>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    /// Top-level failure summary, set when every target failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchOperation {
    fn new(kind: BatchKind, targets: Vec<String>) -> Self {
        let now = now_ms();
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            targets,
            status: BatchStatus::Pending,
            progress: 0,
            results: HashMap::new(),
            created_at_ms: now,
            updated_at_ms: now,
            error: None,
        }
    }
}

/// Coordinator tuning knobs.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Pause between consecutive targets.
    pub target_pause: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            target_pause: Duration::from_secs(1),
        }
    }
}

/// Coordinator over batch lifecycle operations.
pub struct BatchCoordinator {
    supervisor: Arc<Supervisor>,
    store: Arc<dyn InstanceStore>,
    bus: Arc<EventBus>,
    operations: RwLock<HashMap<String, BatchOperation>>,
    config: BatchConfig,
}

impl BatchCoordinator {
    #[must_use]
    pub fn new(
        supervisor: Arc<Supervisor>,
        store: Arc<dyn InstanceStore>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self::with_config(supervisor, store, bus, BatchConfig::default())
    }

    #[must_use]
    pub fn with_config(
        supervisor: Arc<Supervisor>,
        store: Arc<dyn InstanceStore>,
        bus: Arc<EventBus>,
        config: BatchConfig,
    ) -> Self {
        Self {
            supervisor,
            store,
            bus,
            operations: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Validate and enqueue a batch. Validation failures return before any
    /// record is created; on success the operation ID is returned and
    /// execution proceeds asynchronously.
    pub async fn submit(
        self: &Arc<Self>,
        kind: BatchKind,
        targets: Vec<String>,
    ) -> Result<String, BatchError> {
        if targets.is_empty() {
            return Err(BatchError::Validation(
                "batch requires at least one target".to_string(),
            ));
        }
        for target in &targets {
            if !self.store.exists(target).await {
                return Err(BatchError::TargetNotFound(target.clone()));
            }
        }

        let operation = BatchOperation::new(kind, targets);
        let id = operation.id.clone();
        info!(
            operation_id = %id,
            kind = ?kind,
            targets = operation.targets.len(),
            "Batch submitted"
        );
        self.operations
            .write()
            .await
            .insert(id.clone(), operation);

        let coordinator = Arc::clone(self);
        let operation_id = id.clone();
        tokio::spawn(async move {
            coordinator.execute(operation_id).await;
        });

        Ok(id)
    }

    /// Look up one operation record by ID.
    pub async fn get_operation(&self, id: &str) -> Result<BatchOperation, BatchError> {
        self.operations
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| BatchError::OperationNotFound(id.to_string()))
    }

    /// All operation records, newest first.
    pub async fn list_operations(&self) -> Vec<BatchOperation> {
        let mut operations: Vec<BatchOperation> =
            self.operations.read().await.values().cloned().collect();
        operations.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
        operations
    }

    /// Cancel a batch that has not started executing. Running batches run
    /// to completion; there is no mid-flight cancellation.
    pub async fn cancel(&self, id: &str) -> Result<(), BatchError> {
        {
            let mut operations = self.operations.write().await;
            let operation = operations
                .get_mut(id)
                .ok_or_else(|| BatchError::OperationNotFound(id.to_string()))?;
            match operation.status {
                BatchStatus::Pending => {
                    operation.status = BatchStatus::Cancelled;
                    operation.updated_at_ms = now_ms();
                }
                state => {
                    return Err(BatchError::InvalidState {
                        id: id.to_string(),
                        state: state.label().to_string(),
                        reason: "only pending operations can be cancelled".to_string(),
                    });
                }
            }
        }
        info!(operation_id = %id, "Batch cancelled before execution");
        self.bus.emit(&Event::BatchComplete {
            operation_id: id.to_string(),
            status: BatchStatus::Cancelled.label().to_string(),
            succeeded: 0,
            failed: 0,
        });
        Ok(())
    }

    async fn execute(self: Arc<Self>, id: String) {
        // Claim the record; a cancel that won the race leaves it untouched.
        let (kind, targets) = {
            let mut operations = self.operations.write().await;
            let Some(operation) = operations.get_mut(&id) else {
                return;
            };
            if operation.status != BatchStatus::Pending {
                return;
            }
            operation.status = BatchStatus::Running;
            operation.updated_at_ms = now_ms();
            (operation.kind, operation.targets.clone())
        };

        let total = targets.len();
        let mut succeeded: u32 = 0;
        let mut failed: u32 = 0;

        for (index, target) in targets.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.config.target_pause).await;
            }

            let outcome = self.apply(kind, target).await;
            match &outcome {
                Ok(()) => succeeded += 1,
                Err(e) => {
                    warn!(operation_id = %id, target = %target, error = %e, "Batch target failed");
                    failed += 1;
                }
            }

            let completed = index + 1;
            #[allow(clippy::cast_possible_truncation)]
            let progress = ((completed * 100) / total) as u8;
            {
                let mut operations = self.operations.write().await;
                if let Some(operation) = operations.get_mut(&id) {
                    operation.results.insert(
                        target.clone(),
                        TargetResult {
                            success: outcome.is_ok(),
                            error: outcome.err().map(|e| e.to_string()),
                        },
                    );
                    operation.progress = progress;
                    operation.updated_at_ms = now_ms();
                }
            }
            #[allow(clippy::cast_possible_truncation)]
            self.bus.emit(&Event::BatchProgress {
                operation_id: id.clone(),
                progress,
                completed: completed as u32,
                total: total as u32,
            });
        }

        let status = if failed == 0 {
            BatchStatus::Completed
        } else if succeeded == 0 {
            BatchStatus::Failed
        } else {
            BatchStatus::PartialSuccess
        };
        {
            let mut operations = self.operations.write().await;
            if let Some(operation) = operations.get_mut(&id) {
                operation.status = status;
                operation.progress = 100;
                operation.updated_at_ms = now_ms();
                if status == BatchStatus::Failed {
                    operation.error = Some(format!("all {total} targets failed"));
                }
            }
        }
        info!(
            operation_id = %id,
            status = status.label(),
            succeeded,
            failed,
            "Batch finished"
        );
        self.bus.emit(&Event::BatchComplete {
            operation_id: id,
            status: status.label().to_string(),
            succeeded,
            failed,
        });
    }

    /// Apply one lifecycle action to one target. `Delete` stops a running
    /// instance first and tolerates one that is already down.
    async fn apply(&self, kind: BatchKind, target: &str) -> Result<(), SupervisorError> {
        match kind {
            BatchKind::Start => self.supervisor.start(target).await,
            BatchKind::Stop => self.supervisor.stop(target).await,
            BatchKind::Restart => self.supervisor.restart(target).await,
            BatchKind::Delete => {
                match self.supervisor.stop(target).await {
                    Ok(()) | Err(SupervisorError::NotRunning(_)) => {}
                    Err(e) => return Err(e),
                }
                self.store.remove(target).await.map_err(Into::into)
            }
        }
    }
}
