//! Minimal control-plane server: supervises one custom instance and serves
//! the hub's WebSocket endpoint on `127.0.0.1:8080/ws`.
//!
//! ```sh
//! cargo run -p gamectl-hub --example serve
//! websocat ws://127.0.0.1:8080/ws
//! > {"type":"subscribe","instance_id":"demo"}
//! > {"type":"get_status","instance_id":"demo"}
//! ```

use std::sync::Arc;

use anyhow::Result;
use gamectl_core::{EventBus, Instance, InstanceStore, LaunchSpec, MemoryInstanceStore};
use gamectl_hub::{Hub, HubConfig, router};
use gamectl_runtime::daemon::{Daemon, DaemonConfig};
use gamectl_runtime::supervisor::Supervisor;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let store = MemoryInstanceStore::with_instances([Instance::new(
        "demo",
        "Demo Server",
        LaunchSpec::Custom {
            command_line: "sleep 3600".to_string(),
        },
        std::env::temp_dir(),
    )
    .with_auto_restart(3)]);

    let bus = Arc::new(EventBus::new());
    let supervisor = Arc::new(Supervisor::new(
        Arc::clone(&store) as Arc<dyn InstanceStore>,
        Arc::clone(&bus),
    ));
    let daemon = Daemon::attach(
        Arc::clone(&supervisor),
        Arc::clone(&store) as Arc<dyn InstanceStore>,
        Arc::clone(&bus),
        DaemonConfig::default(),
    );
    daemon.spawn_sampler();

    let hub = Hub::attach(Arc::clone(&supervisor), &bus, HubConfig::default());

    supervisor.start("demo").await?;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
    info!(addr = %listener.local_addr()?, "Serving hub WebSocket at /ws");
    axum::serve(listener, router(hub)).await?;
    Ok(())
}
