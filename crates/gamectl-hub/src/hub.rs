//! Client registry and fan-out with per-client backpressure isolation.
//!
//! The hub subscribes to the whole event bus and relays matching events to
//! every connected client through a bounded per-client queue. Enqueueing is
//! always non-blocking: a full queue marks the client unresponsive and the
//! hub drops it on the spot, so one slow consumer never delays delivery to
//! the others or the emitting task.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gamectl_core::{Event, EventBus, EventHandler};
use gamectl_runtime::Supervisor;
use tokio::sync::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::protocol::{ClientMessage, Outbound, Reply};

/// Hub tuning knobs.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Outbound queue capacity per client.
    pub queue_capacity: usize,
    /// Interval between liveness pings on idle connections.
    pub ping_interval: Duration,
    /// Close the connection after this long without inbound traffic.
    pub idle_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            ping_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Registry entry for one connected client.
struct ClientEntry {
    queue: mpsc::Sender<Outbound>,
    /// Instance IDs this client wants scoped events for. Events without an
    /// instance scope are delivered regardless.
    subscriptions: HashSet<String>,
    cancel: CancellationToken,
}

/// What a transport adapter gets back from [`Hub::register`].
pub struct ClientHandle {
    pub id: String,
    /// Drained by exactly one write pump.
    pub queue: mpsc::Receiver<Outbound>,
    /// Fires when the hub force-drops the client.
    pub cancel: CancellationToken,
}

/// Fan-out hub over all connected realtime clients.
pub struct Hub {
    supervisor: Arc<Supervisor>,
    clients: RwLock<HashMap<String, ClientEntry>>,
    config: HubConfig,
}

impl Hub {
    /// Create the hub and wire it into the event bus as a subscriber for
    /// every event kind.
    #[must_use]
    pub fn attach(supervisor: Arc<Supervisor>, bus: &EventBus, config: HubConfig) -> Arc<Self> {
        let hub = Arc::new(Self {
            supervisor,
            clients: RwLock::new(HashMap::new()),
            config,
        });
        bus.subscribe_all(Arc::clone(&hub) as Arc<dyn EventHandler>);
        hub
    }

    #[must_use]
    pub const fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Add a client with an empty subscription set.
    pub async fn register(&self) -> ClientHandle {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(self.config.queue_capacity);
        let cancel = CancellationToken::new();
        self.clients.write().await.insert(
            id.clone(),
            ClientEntry {
                queue: tx,
                subscriptions: HashSet::new(),
                cancel: cancel.clone(),
            },
        );
        info!(client = %id, "Hub client registered");
        ClientHandle { id, queue: rx, cancel }
    }

    /// Remove a client. Safe to call twice; the second call is a no-op.
    pub async fn unregister(&self, id: &str) -> bool {
        let removed = self.clients.write().await.remove(id);
        if let Some(entry) = &removed {
            entry.cancel.cancel();
            info!(client = %id, "Hub client unregistered");
        }
        removed.is_some()
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Add an instance to a client's subscription set.
    pub async fn subscribe(&self, client_id: &str, instance_id: &str) {
        if let Some(entry) = self.clients.write().await.get_mut(client_id) {
            entry.subscriptions.insert(instance_id.to_string());
        }
    }

    /// Remove an instance from a client's subscription set.
    pub async fn unsubscribe(&self, client_id: &str, instance_id: &str) {
        if let Some(entry) = self.clients.write().await.get_mut(client_id) {
            entry.subscriptions.remove(instance_id);
        }
    }

    /// Deliver an event to every client whose subscriptions match.
    ///
    /// Instance-scoped events go to clients subscribed to that instance;
    /// events without a scope (batch progress) go to everyone. A client
    /// whose queue is full is dropped immediately.
    pub async fn broadcast(&self, event: &Event) {
        let scope = event.instance_id();
        let mut dropped: Vec<String> = Vec::new();
        {
            let clients = self.clients.read().await;
            for (id, entry) in clients.iter() {
                let wants = scope.is_none_or(|instance| entry.subscriptions.contains(instance));
                if !wants {
                    continue;
                }
                match entry.queue.try_send(Outbound::Event(event.clone())) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!(
                            client = %id,
                            event = event.event_name(),
                            "Client queue full; dropping unresponsive client"
                        );
                        dropped.push(id.clone());
                    }
                    Err(TrySendError::Closed(_)) => dropped.push(id.clone()),
                }
            }
        }
        for id in dropped {
            self.unregister(&id).await;
        }
    }

    /// Queue a direct reply for one client.
    pub async fn push(&self, client_id: &str, reply: Reply) {
        let sender = {
            let clients = self.clients.read().await;
            clients.get(client_id).map(|entry| entry.queue.clone())
        };
        let Some(sender) = sender else { return };
        if sender.try_send(Outbound::Reply(reply)).is_err() {
            self.unregister(client_id).await;
        }
    }

    /// Dispatch one inbound client frame.
    pub async fn handle_message(&self, client_id: &str, message: ClientMessage) {
        match message {
            ClientMessage::Subscribe { instance_id } => {
                self.subscribe(client_id, &instance_id).await;
            }
            ClientMessage::Unsubscribe { instance_id } => {
                self.unsubscribe(client_id, &instance_id).await;
            }
            ClientMessage::SendCommand {
                instance_id,
                command,
            } => {
                if let Err(e) = self.supervisor.send_command(&instance_id, &command).await {
                    self.push(
                        client_id,
                        Reply::Error {
                            error: e.to_string(),
                        },
                    )
                    .await;
                }
            }
            ClientMessage::GetStatus { instance_id } => {
                match self.supervisor.get_status(&instance_id).await {
                    Ok(status) => self.push(client_id, status.into()).await,
                    Err(e) => {
                        self.push(
                            client_id,
                            Reply::Error {
                                error: e.to_string(),
                            },
                        )
                        .await;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl EventHandler for Hub {
    async fn handle(&self, event: Event) {
        self.broadcast(&event).await;
    }
}
