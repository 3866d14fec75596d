//! End-to-end relay over real sockets

use futures::{SinkExt, StreamExt};
use pretty_assertions::assert_eq;
use sacmes_core::{AckStatus, ChannelRole, Identity, RelayConfig, RelayHub, ServerMessage};
use sacmes_test_utils::{test_config, test_hub, FixedAnalyzer, SAMPLE_FILE};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WITHIN: Duration = Duration::from_secs(5);

struct Relay {
    addr: SocketAddr,
    hub: Arc<RelayHub>,
    _stop: oneshot::Sender<()>,
}

fn start(config: RelayConfig) -> Relay {
    let hub = test_hub(config, Arc::new(FixedAnalyzer(7.5)));
    let (stop, stopped) = oneshot::channel::<()>();
    let (addr, _server) = sacmes_server::spawn(
        Arc::clone(&hub),
        "127.0.0.1:0".parse().unwrap(),
        async move {
            let _ = stopped.await;
        },
    )
    .unwrap();
    Relay {
        addr,
        hub,
        _stop: stop,
    }
}

async fn open(relay: &Relay, path: &str) -> Client {
    let (ws, _) = connect_async(format!("ws://{}/{path}", relay.addr))
        .await
        .unwrap();
    ws
}

async fn send(ws: &mut Client, value: serde_json::Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

async fn next(ws: &mut Client) -> Option<ServerMessage> {
    loop {
        let frame = tokio::time::timeout(WITHIN, ws.next()).await.ok()??;
        match frame.ok()? {
            Message::Text(text) => return Some(serde_json::from_str(&text).unwrap()),
            Message::Close(_) => return None,
            _ => continue,
        }
    }
}

async fn next_matching<F>(ws: &mut Client, mut pred: F) -> Option<ServerMessage>
where
    F: FnMut(&ServerMessage) -> bool,
{
    while let Some(msg) = next(ws).await {
        if pred(&msg) {
            return Some(msg);
        }
    }
    None
}

async fn connect_agent(relay: &Relay, identity: &str) -> Client {
    let mut agent = open(relay, "agent").await;
    send(&mut agent, json!({ "type": "connect", "identity": identity })).await;
    assert!(matches!(
        next(&mut agent).await,
        Some(ServerMessage::SessionAssigned { .. })
    ));
    agent
}

#[tokio::test]
async fn file_flows_from_agent_to_viewer() {
    let relay = start(test_config(2));
    let mut agent = connect_agent(&relay, "lab-1").await;

    let mut viewer = open(&relay, "viewer").await;
    send(&mut viewer, json!({ "type": "join-monitor", "identity": "lab-1" })).await;
    assert!(matches!(
        next(&mut viewer).await,
        Some(ServerMessage::AgentStatus { connected: true, .. })
    ));
    assert!(matches!(
        next(&mut viewer).await,
        Some(ServerMessage::HistoricalReplay { ref results, .. }) if results.is_empty()
    ));

    send(
        &mut viewer,
        json!({
            "type": "start-session",
            "analysisParams": { "frequencies": [10, 20], "numFiles": 4 },
            "filters": { "handle": "h", "rangeStart": 1, "rangeEnd": 4 }
        }),
    )
    .await;
    assert!(matches!(
        next(&mut viewer).await,
        Some(ServerMessage::SessionStartAck { status: AckStatus::Success, .. })
    ));
    match next(&mut agent).await {
        Some(ServerMessage::SetFilters { filters }) => {
            assert_eq!(filters.handle, "h");
            assert_eq!(filters.ack_timeout_secs, Some(60));
            assert_eq!(filters.max_file_bytes, Some(10 * 1024 * 1024));
        }
        other => panic!("expected set-filters, got {other:?}"),
    }

    send(
        &mut agent,
        json!({ "type": "file-data", "filename": "h_10Hz_1.txt", "content": SAMPLE_FILE }),
    )
    .await;
    let ack = next_matching(&mut agent, |m| {
        matches!(m, ServerMessage::FileProcessingComplete { .. })
    })
    .await;
    assert_eq!(
        ack,
        Some(ServerMessage::FileProcessingComplete {
            filename: "h_10Hz_1.txt".into()
        })
    );
    match next_matching(&mut viewer, |m| matches!(m, ServerMessage::AnalysisUpdate { .. })).await {
        Some(ServerMessage::AnalysisUpdate { filename, result, .. }) => {
            assert_eq!(filename, "h_10Hz_1.txt");
            assert_eq!(result.value, 7.5);
        }
        other => panic!("expected analysis-update, got {other:?}"),
    }
}

#[tokio::test]
async fn second_live_agent_is_rejected_and_closed() {
    let relay = start(test_config(1));
    let _first = connect_agent(&relay, "lab-1").await;

    let mut second = open(&relay, "agent").await;
    send(&mut second, json!({ "type": "connect", "identity": "lab-1" })).await;
    assert!(matches!(
        next(&mut second).await,
        Some(ServerMessage::ConnectionRejected { .. })
    ));
    assert_eq!(next(&mut second).await, None);
    assert_eq!(relay.hub.registry().len(), 1);
}

#[tokio::test]
async fn malformed_frames_get_an_error_and_keep_the_socket() {
    let relay = start(test_config(1));
    let mut viewer = open(&relay, "viewer").await;

    send(&mut viewer, json!({ "type": "no-such-thing" })).await;
    assert!(matches!(next(&mut viewer).await, Some(ServerMessage::Error { .. })));

    send(&mut viewer, json!({ "type": "stop-session" })).await;
    assert_eq!(
        next(&mut viewer).await,
        Some(ServerMessage::Error {
            message: "join-monitor first".into()
        })
    );

    send(&mut viewer, json!({ "type": "join-monitor", "identity": "lab-9" })).await;
    assert!(matches!(
        next(&mut viewer).await,
        Some(ServerMessage::AgentStatus { connected: false, .. })
    ));
}

#[tokio::test]
async fn file_before_connect_is_refused() {
    let relay = start(test_config(1));
    let mut agent = open(&relay, "agent").await;
    send(
        &mut agent,
        json!({ "type": "file-data", "filename": "h_10Hz_1.txt", "content": "1 2" }),
    )
    .await;
    assert_eq!(
        next(&mut agent).await,
        Some(ServerMessage::Error {
            message: "file-data before connect".into()
        })
    );
}

#[tokio::test]
async fn agents_need_the_bearer_token_when_configured() {
    let relay = start(test_config(1).with_auth_token("s3cret"));
    let url = format!("ws://{}/agent", relay.addr);

    assert!(connect_async(url.as_str()).await.is_err());

    let mut request = url.as_str().into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Authorization", "Bearer s3cret".parse().unwrap());
    let (mut agent, _) = connect_async(request).await.unwrap();
    send(&mut agent, json!({ "type": "connect", "identity": "lab-1" })).await;
    assert!(matches!(
        next(&mut agent).await,
        Some(ServerMessage::SessionAssigned { .. })
    ));

    // viewers are not gated
    let _viewer = open(&relay, "viewer").await;
}

#[tokio::test]
async fn health_reports_connection_counts() {
    let relay = start(test_config(3));
    let _agent = connect_agent(&relay, "lab-1").await;

    let reply = warp::test::request()
        .method("GET")
        .path("/health")
        .reply(&sacmes_server::routes(Arc::clone(&relay.hub)))
        .await;
    assert_eq!(reply.status(), 200);
    let body: serde_json::Value = serde_json::from_slice(reply.body()).unwrap();
    assert_eq!(body["agents"], 1);
    assert_eq!(body["dispatchTotal"], 3);
}

#[tokio::test]
async fn silent_agent_is_dropped_so_its_identity_can_reconnect() {
    let relay = start(test_config(1).with_heartbeat(Duration::from_secs(1), Duration::from_secs(2)));
    // connected, then never read again: pings go unanswered
    let silent = connect_agent(&relay, "lab-1").await;

    let mut early = open(&relay, "agent").await;
    send(&mut early, json!({ "type": "connect", "identity": "lab-1" })).await;
    assert!(matches!(
        next(&mut early).await,
        Some(ServerMessage::ConnectionRejected { .. })
    ));

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!relay.hub.registry().is_connected(&Identity::new("lab-1")));
    let _back = connect_agent(&relay, "lab-1").await;
    drop(silent);
}

#[tokio::test]
async fn answered_pings_keep_an_idle_agent_connected() {
    let relay = start(test_config(1).with_heartbeat(Duration::from_secs(1), Duration::from_secs(2)));
    let mut agent = connect_agent(&relay, "lab-1").await;

    let mut pings = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(4);
    while let Ok(frame) = tokio::time::timeout_at(deadline, agent.next()).await {
        match frame {
            Some(Ok(Message::Ping(_))) => pings += 1,
            Some(Ok(Message::Text(_))) => {}
            other => panic!("socket ended while idle: {other:?}"),
        }
    }
    assert!(pings >= 2, "saw {pings} pings");
    assert_eq!(relay.hub.connections().count(ChannelRole::Agent), 1);
}
