//! End-to-end WebSocket adapter tests against a real bound server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use gamectl_core::{Event, EventBus, Instance, InstanceStore, LaunchSpec, MemoryInstanceStore};
use gamectl_hub::{Hub, HubConfig, router};
use gamectl_runtime::Supervisor;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type ClientSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Bind the hub's router on an ephemeral port and return where it lives.
async fn serve(config: HubConfig) -> (SocketAddr, Arc<Hub>, Arc<EventBus>) {
    let store = MemoryInstanceStore::with_instances([Instance::new(
        "lobby",
        "lobby",
        LaunchSpec::Custom {
            command_line: "./srv".to_string(),
        },
        std::env::temp_dir(),
    )]);
    let bus = Arc::new(EventBus::new());
    let supervisor = Arc::new(Supervisor::new(
        store as Arc<dyn InstanceStore>,
        Arc::clone(&bus),
    ));
    let hub = Hub::attach(supervisor, &bus, config);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(Arc::clone(&hub));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, hub, bus)
}

async fn connect(addr: SocketAddr) -> ClientSocket {
    let (socket, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    socket
}

/// Next JSON text frame, skipping liveness pings.
async fn next_json(socket: &mut ClientSocket) -> Value {
    loop {
        let frame = timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("frame within deadline")
            .expect("socket still open")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn send_json(socket: &mut ClientSocket, value: &Value) {
    socket
        .send(Message::Text(value.to_string()))
        .await
        .unwrap();
}

#[tokio::test]
async fn status_query_round_trip_over_websocket() {
    let (addr, hub, bus) = serve(HubConfig::default()).await;
    let mut socket = connect(addr).await;

    send_json(
        &mut socket,
        &json!({"type": "subscribe", "instance_id": "lobby"}),
    )
    .await;
    send_json(
        &mut socket,
        &json!({"type": "get_status", "instance_id": "lobby"}),
    )
    .await;

    let reply = next_json(&mut socket).await;
    assert_eq!(reply["type"], "status");
    assert_eq!(reply["instance_id"], "lobby");
    assert_eq!(reply["status"], "stopped");

    // Inbound frames are handled in order, so the status reply proves the
    // subscribe before it took effect; a scoped event emitted now must
    // reach this socket.
    bus.emit(&Event::ServerLog {
        instance_id: "lobby".to_string(),
        line: "player joined".to_string(),
    });
    let event = next_json(&mut socket).await;
    assert_eq!(event["type"], "server_log");
    assert_eq!(event["instance_id"], "lobby");
    assert_eq!(event["line"], "player joined");

    assert_eq!(hub.client_count().await, 1);
    socket.close(None).await.unwrap();
}

#[tokio::test]
async fn unknown_status_target_is_answered_with_an_error_frame() {
    let (addr, _hub, _bus) = serve(HubConfig::default()).await;
    let mut socket = connect(addr).await;

    send_json(
        &mut socket,
        &json!({"type": "get_status", "instance_id": "ghost"}),
    )
    .await;

    let reply = next_json(&mut socket).await;
    assert_eq!(reply["type"], "error");
    assert!(reply["error"].as_str().unwrap().contains("ghost"));

    socket.close(None).await.unwrap();
}

#[tokio::test]
async fn silent_client_is_disconnected_after_idle_timeout() {
    let (addr, hub, _bus) = serve(HubConfig {
        idle_timeout: Duration::from_millis(300),
        ping_interval: Duration::from_secs(60),
        ..HubConfig::default()
    })
    .await;
    let mut socket = connect(addr).await;

    // Send nothing; the server must end the session on its own.
    let closed = timeout(Duration::from_secs(5), async {
        loop {
            match socket.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "server never closed the idle connection");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while hub.client_count().await != 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "idle client never unregistered"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
