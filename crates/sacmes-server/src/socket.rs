//! Per-socket loops for agents and viewers
//!
//! Every socket is split: a writer task drains the hub channel into JSON
//! text frames while the reader loop parses inbound frames and calls the
//! hub. Malformed frames get an `error` reply and the loop continues.
//!
//! The writer also pings on the configured heartbeat. A socket that sends
//! nothing at all, not even a pong, for the liveness timeout is closed,
//! which drops its channel and lets the identity reconnect.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use sacmes_core::{
    AgentMessage, ChannelHandle, ChannelId, ChannelRole, Identity, RelayError, RelayHub,
    ServerMessage, ViewerMessage,
};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use warp::ws::{Message, WebSocket};

/// How long a fresh agent socket may stay silent before `connect`
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a refused socket gets to flush `connection-rejected`
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

fn spawn_writer(
    mut sink: WsSink,
    mut outbound: mpsc::Receiver<ServerMessage>,
    channel: ChannelId,
    heartbeat: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let heartbeat = heartbeat.max(Duration::from_secs(1));
        let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let msg = tokio::select! {
                msg = outbound.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
                _ = ping.tick() => {
                    if let Err(e) = sink.send(Message::ping(Vec::new())).await {
                        tracing::debug!(channel = %channel, "ping failed: {e}");
                        break;
                    }
                    continue;
                }
            };
            let last = matches!(msg, ServerMessage::ConnectionRejected { .. });
            let text = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!(channel = %channel, kind = msg.kind(), "encode failed: {e}");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::text(text)).await {
                tracing::debug!(channel = %channel, "socket write failed: {e}");
                break;
            }
            if last {
                let _ = sink.send(Message::close()).await;
                break;
            }
        }
    })
}

async fn finish_writer(mut writer: JoinHandle<()>, flush: bool) {
    if flush && tokio::time::timeout(FLUSH_TIMEOUT, &mut writer).await.is_ok() {
        return;
    }
    writer.abort();
}

/// Next inbound frame, or `None` when the peer stayed silent for `limit`
async fn next_within(
    stream: &mut WsStream,
    limit: Duration,
) -> Option<Option<Result<Message, warp::Error>>> {
    tokio::time::timeout(limit, stream.next()).await.ok()
}

async fn reply(channel: &ChannelHandle, error: &RelayError) {
    if let Err(e) = channel.send(RelayHub::error_reply(error)).await {
        tracing::debug!(channel = %channel.id(), "error reply lost: {e}");
    }
}

enum Frame<T> {
    Message(T),
    Skip,
    Closed,
}

async fn decode<T: DeserializeOwned>(
    frame: Option<Result<Message, warp::Error>>,
    channel: &ChannelHandle,
) -> Frame<T> {
    let msg = match frame {
        Some(Ok(msg)) => msg,
        Some(Err(e)) => {
            tracing::debug!(channel = %channel.id(), "socket read failed: {e}");
            return Frame::Closed;
        }
        None => return Frame::Closed,
    };
    if msg.is_close() {
        return Frame::Closed;
    }
    let Ok(text) = msg.to_str() else {
        if msg.is_binary() {
            reply(
                channel,
                &RelayError::Protocol("binary frames are not supported".to_string()),
            )
            .await;
        }
        return Frame::Skip;
    };
    match serde_json::from_str(text) {
        Ok(parsed) => Frame::Message(parsed),
        Err(e) => {
            tracing::debug!(channel = %channel.id(), "unparseable frame: {e}");
            reply(channel, &RelayError::Protocol(format!("invalid message: {e}"))).await;
            Frame::Skip
        }
    }
}

/// Drive one agent socket until it closes
pub async fn agent_session(ws: WebSocket, hub: Arc<RelayHub>) {
    let (sink, mut stream) = ws.split();
    let (channel, outbound) = hub.open_channel(ChannelRole::Agent);
    let writer = spawn_writer(sink, outbound, channel.id(), hub.config().heartbeat());
    let liveness = hub.config().liveness_timeout();
    let mut identity: Option<Identity> = None;
    let mut refused = false;

    loop {
        let limit = if identity.is_some() { liveness } else { CONNECT_TIMEOUT };
        let Some(frame) = next_within(&mut stream, limit).await else {
            match &identity {
                Some(id) => {
                    tracing::warn!(identity = %id, channel = %channel.id(), "agent silent for {limit:?}, closing");
                }
                None => tracing::warn!(channel = %channel.id(), "no connect within {limit:?}"),
            }
            break;
        };
        let msg = match decode::<AgentMessage>(frame, &channel).await {
            Frame::Message(msg) => msg,
            Frame::Skip => continue,
            Frame::Closed => break,
        };

        match msg {
            AgentMessage::Connect { identity: raw } => {
                if identity.is_some() {
                    reply(&channel, &RelayError::Protocol("already connected".to_string())).await;
                    continue;
                }
                match hub.agent_connected(&raw, &channel).await {
                    Ok((id, session)) => {
                        tracing::info!(identity = %id, session = %session, channel = %channel.id(), "agent connected");
                        identity = Some(id);
                    }
                    Err(e) => {
                        tracing::warn!(identity = %raw, channel = %channel.id(), "agent refused: {e}");
                        refused = true;
                        break;
                    }
                }
            }
            AgentMessage::FileData { filename, content } => {
                let Some(id) = identity.as_ref() else {
                    reply(&channel, &RelayError::Protocol("file-data before connect".to_string()))
                        .await;
                    continue;
                };
                match hub.file_received(id, channel.id(), filename, content).await {
                    // analysis runs detached; the ack reaches whoever holds the identity
                    Ok(_analysis) => {}
                    // already answered with file-validation-error
                    Err(RelayError::Validation(_)) => {}
                    Err(e) => {
                        tracing::warn!(identity = %id, "file-data failed: {e}");
                        reply(&channel, &e).await;
                        if e.closes_channel() {
                            break;
                        }
                    }
                }
            }
        }
    }

    finish_writer(writer, refused).await;
    match identity {
        Some(id) => {
            if hub.agent_disconnected(&id, channel.id()).is_some() {
                tracing::info!(identity = %id, channel = %channel.id(), "agent disconnected, grace timer armed");
            }
        }
        None => hub.close_channel(channel.id()),
    }
}

/// Drive one viewer socket until it closes
pub async fn viewer_session(ws: WebSocket, hub: Arc<RelayHub>) {
    let (sink, mut stream) = ws.split();
    let (channel, outbound) = hub.open_channel(ChannelRole::Viewer);
    let writer = spawn_writer(sink, outbound, channel.id(), hub.config().heartbeat());
    let liveness = hub.config().liveness_timeout();
    let mut joined: Option<Identity> = None;

    loop {
        let Some(frame) = next_within(&mut stream, liveness).await else {
            tracing::debug!(viewer = %channel.id(), "viewer silent for {liveness:?}, closing");
            break;
        };
        let msg = match decode::<ViewerMessage>(frame, &channel).await {
            Frame::Message(msg) => msg,
            Frame::Skip => continue,
            Frame::Closed => break,
        };

        match msg {
            ViewerMessage::JoinMonitor { identity: raw } => {
                if let Some(previous) = joined.take() {
                    let _ = hub.viewer_left(&previous, channel.id());
                }
                match hub.viewer_joined(&raw, &channel).await {
                    Ok(id) => joined = Some(id),
                    Err(e) => reply(&channel, &e).await,
                }
            }
            ViewerMessage::StartSession {
                analysis_params,
                filters,
            } => {
                let Some(id) = joined.as_ref() else {
                    reply(&channel, &RelayError::Protocol("join-monitor first".to_string())).await;
                    continue;
                };
                if let Err(e) = hub.start_session(id, &channel, analysis_params, filters).await {
                    tracing::info!(identity = %id, "start-session refused: {e}");
                }
            }
            ViewerMessage::StopSession => {
                let Some(id) = joined.as_ref() else {
                    reply(&channel, &RelayError::Protocol("join-monitor first".to_string())).await;
                    continue;
                };
                if let Err(e) = hub.stop_session(id).await {
                    reply(&channel, &e).await;
                }
            }
        }
    }

    finish_writer(writer, false).await;
    if let Some(id) = joined {
        let _ = hub.viewer_left(&id, channel.id());
        tracing::debug!(identity = %id, viewer = %channel.id(), "viewer left");
    }
    hub.close_channel(channel.id());
}
