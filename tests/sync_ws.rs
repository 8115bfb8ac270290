//! End-to-end sync over real WebSocket sockets on ephemeral ports.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tabula::schema::{FieldDef, RowMap, TableDefinition, WorkspaceDefinition};
use tabula::server::{router, RoomConfig, RoomPolicy, RoomRegistry};
use tabula::sync::{sync, SyncExtension, SyncProvider, SyncStatus, SyncTarget};
use tabula::table::RowRead;
use tabula::{ActorId, RowId, Substrate, Workspace};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

fn definition() -> WorkspaceDefinition {
    WorkspaceDefinition::new("shared").with_table(
        TableDefinition::new(
            "posts",
            vec![
                FieldDef::text("title"),
                FieldDef::integer("views").with_default(json!(0)),
            ],
        )
        .unwrap(),
    )
}

fn row(value: Value) -> RowMap {
    value.as_object().unwrap().clone()
}

async fn start_server(auth_token: Option<&str>) -> (u16, JoinHandle<()>) {
    let registry = Arc::new(RoomRegistry::new(
        RoomPolicy::Open,
        RoomConfig::default(),
        auth_token.map(str::to_string),
    ));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let app = router(registry);
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (port, handle)
}

fn target(port: u16, workspace_id: &str) -> SyncTarget {
    SyncTarget {
        url: format!("ws://127.0.0.1:{port}/workspaces/{workspace_id}/sync"),
        token: None,
    }
}

/// Poll until `predicate` holds, or panic after `timeout`.
async fn wait_until(timeout: Duration, what: &str, predicate: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !predicate() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_two_clients_converge_over_websocket() {
    let (port, server) = start_server(None).await;

    let a = Workspace::create(definition())
        .unwrap()
        .with_extension("sync", sync(move |id| async move { Ok(target(port, &id)) }))
        .unwrap();
    let b = Workspace::create(definition())
        .unwrap()
        .with_extension("sync", sync(move |id| async move { Ok(target(port, &id)) }))
        .unwrap();

    tokio::time::timeout(Duration::from_secs(10), a.when_ready())
        .await
        .expect("client a connects")
        .unwrap();
    tokio::time::timeout(Duration::from_secs(10), b.when_ready())
        .await
        .expect("client b connects")
        .unwrap();

    a.table("posts")
        .unwrap()
        .upsert(row(json!({"id": "p1", "title": "Hello", "views": 0})))
        .unwrap();

    let b_posts = b.table("posts").unwrap().clone();
    wait_until(Duration::from_secs(10), "row replicates to b", move || {
        b_posts.has(&RowId::new("p1").unwrap())
    })
    .await;

    let read = b.table("posts").unwrap().get(&RowId::new("p1").unwrap());
    let RowRead::Valid { row } = read else {
        panic!("expected replicated row, got {read:?}");
    };
    assert_eq!(row["title"], json!("Hello"));

    a.destroy().await.unwrap();
    b.destroy().await.unwrap();
    server.abort();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sync_status_acks_track_local_versions() {
    let (port, server) = start_server(None).await;

    let substrate = Substrate::new(ActorId::generate());
    let provider = SyncProvider::new("acks", &substrate, move |id| async move {
        Ok(target(port, &id))
    });
    provider.connect();

    let mut status_rx = provider.subscribe_status();
    tokio::time::timeout(
        Duration::from_secs(10),
        status_rx.wait_for(|s| *s == SyncStatus::Connected),
    )
    .await
    .expect("provider connects")
    .unwrap();

    // The handshake probe carries version 0; once echoed, nothing local
    // is outstanding.
    let p = provider.clone();
    wait_until(Duration::from_secs(5), "initial ack", move || {
        !p.has_local_changes()
    })
    .await;
    assert_eq!(provider.local_version(), 0);
    assert_eq!(provider.acked_version(), 0);

    // A local write bumps the version and is acked after the echo.
    let store = tabula::YkvStore::open(&substrate, "kv");
    store.set("theme", json!("dark"));
    assert_eq!(provider.local_version(), 1);
    assert!(provider.has_local_changes());

    let p = provider.clone();
    wait_until(Duration::from_secs(5), "write acked", move || {
        !p.has_local_changes()
    })
    .await;
    assert_eq!(provider.acked_version(), 1);

    provider.destroy().await;
    server.abort();
}

/// Minimal sync peer speaking just enough of the protocol: step 1 on
/// join, step 2 for step 1, apply/ack updates, echo tag-102 frames.
/// Unlike the axum server, its connection task dies with the returned
/// handle, so tests can sever live sockets.
async fn mini_server() -> (u16, JoinHandle<()>) {
    use futures_util::{SinkExt, StreamExt};
    use tabula::sync::protocol::{self, Frame};
    use tabula::CommitOrigin;
    use tokio_tungstenite::tungstenite::Message;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        let substrate = Substrate::new(ActorId::generate());
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let Ok(socket) = tokio_tungstenite::accept_async(stream).await else {
                continue;
            };
            let (mut sink, mut reader) = socket.split();
            let step1 = protocol::sync_step1(&substrate.state_vector()).unwrap();
            let _ = sink.send(Message::Binary(step1)).await;
            while let Some(Ok(message)) = reader.next().await {
                let Message::Binary(bytes) = message else {
                    continue;
                };
                let reply = match protocol::decode_frame(&bytes) {
                    Ok(Frame::SyncStep1(sv)) => {
                        Some(protocol::sync_step2(substrate.encode_diff(&sv).unwrap()))
                    }
                    Ok(Frame::SyncStep2(update)) | Ok(Frame::Update(update)) => {
                        substrate
                            .apply_update(&update, CommitOrigin::Remote)
                            .unwrap();
                        None
                    }
                    Ok(Frame::SyncStatus(_)) => Some(bytes),
                    _ => None,
                };
                if let Some(reply) = reply {
                    if sink.send(Message::Binary(reply)).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
    (port, handle)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reconnect_after_server_drop() {
    let (port, server) = mini_server().await;
    let current_port = Arc::new(AtomicU16::new(port));

    let substrate = Substrate::new(ActorId::generate());
    let auth_port = Arc::clone(&current_port);
    let provider = SyncProvider::new("reconnect", &substrate, move |id| {
        let port = auth_port.load(Ordering::SeqCst);
        async move { Ok(target(port, &id)) }
    });

    let statuses: Arc<Mutex<Vec<SyncStatus>>> = Arc::new(Mutex::new(Vec::new()));
    let statuses_in_cb = Arc::clone(&statuses);
    provider.observe_status(move |status| {
        statuses_in_cb.lock().push(status);
    });

    provider.connect();
    let mut status_rx = provider.subscribe_status();
    tokio::time::timeout(
        Duration::from_secs(10),
        status_rx.wait_for(|s| *s == SyncStatus::Connected),
    )
    .await
    .expect("first connection")
    .unwrap();

    // Kill the server: the provider must observe the failure and start
    // cycling through Error → Connecting.
    server.abort();
    let seen = Arc::clone(&statuses);
    wait_until(Duration::from_secs(10), "error after drop", move || {
        seen.lock().contains(&SyncStatus::Error)
    })
    .await;

    // Bring a fresh server up on a new port and point the auth callback
    // at it; the backoff loop reconnects on its own.
    let (new_port, new_server) = mini_server().await;
    current_port.store(new_port, Ordering::SeqCst);
    tokio::time::timeout(
        Duration::from_secs(15),
        status_rx.wait_for(|s| *s == SyncStatus::Connected),
    )
    .await
    .expect("reconnects to the replacement server")
    .unwrap();

    // The full journey passed through a reconnect cycle.
    let history = statuses.lock().clone();
    let first_connected = history.iter().position(|s| *s == SyncStatus::Connected).unwrap();
    assert!(history[first_connected..].contains(&SyncStatus::Error));
    assert!(history[first_connected..]
        .iter()
        .filter(|s| **s == SyncStatus::Connected)
        .count() >= 2 || *history.last().unwrap() == SyncStatus::Connected);

    provider.destroy().await;
    new_server.abort();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_disconnect_is_immediate_and_reconnect_explicit() {
    let (port, server) = start_server(None).await;

    let substrate = Substrate::new(ActorId::generate());
    let provider = SyncProvider::new("manual", &substrate, move |id| async move {
        Ok(target(port, &id))
    });
    provider.connect();
    let mut status_rx = provider.subscribe_status();
    tokio::time::timeout(
        Duration::from_secs(10),
        status_rx.wait_for(|s| *s == SyncStatus::Connected),
    )
    .await
    .expect("connects")
    .unwrap();

    provider.disconnect();
    assert_eq!(provider.status(), SyncStatus::Offline);

    provider.connect();
    tokio::time::timeout(
        Duration::from_secs(10),
        status_rx.wait_for(|s| *s == SyncStatus::Connected),
    )
    .await
    .expect("reconnects on demand")
    .unwrap();

    provider.destroy().await;
    server.abort();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_token_is_rejected() {
    let (port, server) = start_server(Some("sesame")).await;

    let substrate = Substrate::new(ActorId::generate());
    let provider = SyncProvider::new("locked", &substrate, move |id| async move {
        Ok(target(port, &id)) // no token
    });
    provider.connect();

    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_ne!(provider.status(), SyncStatus::Connected);

    // Supplying the right token makes the same room reachable.
    let provider_ok = SyncProvider::new("locked", &substrate, move |id| async move {
        Ok(SyncTarget {
            url: format!("ws://127.0.0.1:{port}/workspaces/{id}/sync"),
            token: Some("sesame".to_string()),
        })
    });
    provider_ok.connect();
    let mut status_rx = provider_ok.subscribe_status();
    tokio::time::timeout(
        Duration::from_secs(10),
        status_rx.wait_for(|s| *s == SyncStatus::Connected),
    )
    .await
    .expect("token-bearing provider connects")
    .unwrap();

    provider.destroy().await;
    provider_ok.destroy().await;
    server.abort();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sync_extension_exports_are_reachable() {
    let (port, server) = start_server(None).await;

    let workspace = Workspace::create(definition())
        .unwrap()
        .with_extension("sync", sync(move |id| async move { Ok(target(port, &id)) }))
        .unwrap();
    workspace.when_ready().await.unwrap();

    let sync_ext = workspace.extension::<SyncExtension>("sync").unwrap();
    assert_eq!(sync_ext.status(), SyncStatus::Connected);

    workspace.destroy().await.unwrap();
    server.abort();
}
