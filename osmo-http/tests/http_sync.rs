//! End-to-end sync between two coordinators over the HTTP/SSE transport.

use std::sync::Arc;
use std::time::Duration;

use osmo_engine::change::Value;
use osmo_engine::coordinator::Coordinator;
use osmo_engine::memory::MemoryLedger;
use osmo_engine::SiteId;
use osmo_engine::Transport;
use osmo_http::{HttpClientConfig, HttpServerConfig, HttpServerTransport, HttpSseTransport};

fn site(byte: u8) -> SiteId {
    SiteId([byte; 16])
}

macro_rules! wait_for {
    ($what:expr, $cond:expr) => {{
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if $cond {
                break;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {}", $what);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }};
}

struct Host {
    ledger: Arc<MemoryLedger>,
    coordinator: Coordinator,
}

fn host(id: u8) -> Host {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let ledger = Arc::new(MemoryLedger::new(site(id)));
    let coordinator = Coordinator::new(ledger.clone());
    Host { ledger, coordinator }
}

fn quick_client(base_url: String) -> HttpClientConfig {
    HttpClientConfig {
        initial_backoff: Duration::from_millis(100),
        max_backoff: Duration::from_secs(2),
        ..HttpClientConfig::new(base_url)
    }
}

#[tokio::test]
async fn bidirectional_sync_over_http() {
    let server = host(0xbb);
    let client = host(0xaa);

    // Pre-seed both sides so the initial catch-up carries data both ways.
    server.ledger.write("notes", b"s1", "body", Value::Text("from server".into())).await;
    server.ledger.write("notes", b"s2", "body", Value::Text("also server".into())).await;
    client.ledger.write("notes", b"c1", "body", Value::Text("from client".into())).await;

    let server_transport = HttpServerTransport::new(HttpServerConfig {
        ping_interval: Duration::from_millis(100),
        ..HttpServerConfig::default()
    });
    let addr = server_transport
        .serve("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    server.coordinator.attach(server_transport.clone()).await.unwrap();
    server.coordinator.start().await.unwrap();

    let client_transport = HttpSseTransport::new(quick_client(format!("http://{addr}")));
    client.coordinator.attach(client_transport.clone()).await.unwrap();
    client.coordinator.start().await.unwrap();

    wait_for!("full convergence", {
        client.ledger.record_count().await == 3 && server.ledger.record_count().await == 3
    });
    assert!(client_transport.connected());

    // Live writes flow in both directions after catch-up.
    client.ledger.write("notes", b"c2", "body", Value::Integer(1)).await;
    client.coordinator.check_local_changes().await.unwrap();
    wait_for!("live client write reaches server", server.ledger.record_count().await == 4);

    server.ledger.write("notes", b"s3", "body", Value::Integer(2)).await;
    server.coordinator.check_local_changes().await.unwrap();
    wait_for!("live server write reaches client", client.ledger.record_count().await == 4);

    let server_cursor = server.coordinator.own_cursor().await;
    wait_for!(
        "cursors agree",
        client.coordinator.own_cursor().await == server_cursor
    );
}

#[tokio::test]
async fn server_notices_vanished_client() {
    let server = host(0xbb);
    let client = host(0xaa);

    let server_transport = HttpServerTransport::new(HttpServerConfig {
        ping_interval: Duration::from_millis(50),
        ..HttpServerConfig::default()
    });
    let addr = server_transport
        .serve("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    server.coordinator.attach(server_transport.clone()).await.unwrap();
    server.coordinator.start().await.unwrap();

    let client_transport = HttpSseTransport::new(quick_client(format!("http://{addr}")));
    client.coordinator.attach(client_transport.clone()).await.unwrap();
    client.coordinator.start().await.unwrap();

    wait_for!(
        "client registered on server",
        server.coordinator.peer_ids().await == vec![site(0xaa).to_string()]
    );

    // Kill the client; the server's ping probe reaps the dead stream.
    client.coordinator.stop().await;
    wait_for!(
        "server forgets the client",
        server.coordinator.peer_ids().await.is_empty()
    );
}

#[tokio::test]
async fn client_reconnects_with_backoff() {
    let server = host(0xbb);
    let client = host(0xaa);
    server.ledger.write("notes", b"s1", "body", Value::Integer(7)).await;

    // Reserve a port, then start the client before anything listens on it.
    let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);

    let client_transport = HttpSseTransport::new(quick_client(format!("http://{addr}")));
    client.coordinator.attach(client_transport.clone()).await.unwrap();
    client.coordinator.start().await.unwrap();
    assert!(!client_transport.connected());
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Now bring the server up on that address; the client's backoff loop
    // finds it and completes the handshake.
    let server_transport = HttpServerTransport::new(HttpServerConfig {
        ping_interval: Duration::from_millis(100),
        ..HttpServerConfig::default()
    });
    server_transport.serve(addr).await.unwrap();
    server.coordinator.attach(server_transport.clone()).await.unwrap();
    server.coordinator.start().await.unwrap();

    wait_for!("late server sync", client.ledger.record_count().await == 1);
    assert!(client_transport.connected());
}
