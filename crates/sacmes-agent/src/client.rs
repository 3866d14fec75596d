//! WebSocket connection to the relay, with reconnection

use crate::config::AgentConfig;
use crate::delivery::{Control, DeliveryLoop, RunOutcome};
use crate::error::{AgentError, AgentResult};
use futures::{SinkExt, StreamExt};
use sacmes_core::{AgentMessage, Identity, ServerMessage, SessionId, CHANNEL_BUFFER};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long the server may take to answer `connect`
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Long-running agent: connect, stream files, reconnect
#[derive(Debug)]
pub struct AgentClient {
    config: AgentConfig,
    identity: Identity,
    delivery: DeliveryLoop,
    session: Option<SessionId>,
}

impl AgentClient {
    /// Client for `identity` watching `config.watch_dir`
    #[must_use]
    pub fn new(config: AgentConfig, identity: Identity) -> Self {
        let delivery = DeliveryLoop::new(config.watch_dir.clone(), config.delivery.clone());
        Self {
            config,
            identity,
            delivery,
            session: None,
        }
    }

    /// Delivery state (filters, delivered set, pacing)
    #[must_use]
    pub fn delivery(&self) -> &DeliveryLoop {
        &self.delivery
    }

    /// Session of the current or last connection
    #[must_use]
    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    /// Run until reconnection attempts are exhausted
    ///
    /// Filters and the delivered set survive reconnects; the server does
    /// not resend `set-filters` after a reconnect.
    pub async fn run(&mut self) -> AgentResult<()> {
        let mut failures = 0u32;
        loop {
            match self.connect().await {
                Ok((socket, session)) => {
                    failures = 0;
                    self.session = Some(session);
                    tracing::info!(identity = %self.identity, session = %session, "connected to relay");
                    let outcome = self.stream(socket).await;
                    tracing::warn!(identity = %self.identity, ?outcome, "connection lost");
                }
                Err(e) if e.is_transient() => {
                    failures += 1;
                    tracing::warn!(attempt = failures, "connect failed: {e}");
                    if !self.config.reconnect.allows(failures) {
                        return Err(AgentError::GaveUp(failures));
                    }
                }
                Err(e) => return Err(e),
            }
            let delay = self.config.reconnect.jittered(failures.max(1));
            tracing::debug!(?delay, "reconnecting");
            tokio::time::sleep(delay).await;
        }
    }

    async fn connect(&self) -> AgentResult<(Socket, SessionId)> {
        let mut request = self.config.server_url.as_str().into_client_request()?;
        if let Some(token) = &self.config.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| AgentError::Config(format!("token is not a valid header: {e}")))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        let (mut socket, _) = connect_async(request).await?;

        let hello = AgentMessage::Connect {
            identity: self.identity.as_str().to_string(),
        };
        let hello =
            serde_json::to_string(&hello).map_err(|e| AgentError::Protocol(e.to_string()))?;
        socket.send(Message::Text(hello)).await?;

        loop {
            let frame = tokio::time::timeout(HANDSHAKE_TIMEOUT, socket.next())
                .await
                .map_err(|_| AgentError::Protocol("no session-assigned".to_string()))?
                .ok_or(AgentError::Closed)??;
            let text = match frame {
                Message::Text(text) => text,
                Message::Close(_) => return Err(AgentError::Closed),
                _ => continue,
            };
            match serde_json::from_str::<ServerMessage>(&text) {
                Ok(ServerMessage::SessionAssigned { session_id }) => return Ok((socket, session_id)),
                Ok(ServerMessage::ConnectionRejected { reason }) => {
                    return Err(AgentError::Rejected(reason))
                }
                Ok(other) => tracing::debug!(kind = other.kind(), "ignored before session-assigned"),
                Err(e) => tracing::debug!("unparseable frame: {e}"),
            }
        }
    }

    async fn stream(&mut self, socket: Socket) -> RunOutcome {
        let (mut sink, mut source) = socket.split();
        let (outbound, mut outbound_rx) = mpsc::channel::<AgentMessage>(CHANNEL_BUFFER);
        let (pong_tx, mut pong_rx) = mpsc::channel::<Vec<u8>>(4);
        let (control_tx, mut control) = mpsc::channel::<Control>(CHANNEL_BUFFER);
        let liveness = self.config.liveness_timeout;

        let writer = tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    msg = outbound_rx.recv() => {
                        let Some(msg) = msg else { break };
                        match serde_json::to_string(&msg) {
                            Ok(text) => Message::Text(text),
                            Err(e) => {
                                tracing::error!("encode failed: {e}");
                                continue;
                            }
                        }
                    }
                    Some(payload) = pong_rx.recv() => Message::Pong(payload),
                };
                if let Err(e) = sink.send(frame).await {
                    tracing::debug!("socket write failed: {e}");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader = tokio::spawn(async move {
            loop {
                let Ok(frame) = tokio::time::timeout(liveness, source.next()).await else {
                    tracing::warn!("relay silent for {liveness:?}, dropping connection");
                    break;
                };
                let Some(frame) = frame else { break };
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Ping(payload)) => {
                        let _ = pong_tx.try_send(payload);
                        continue;
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::debug!("socket read failed: {e}");
                        break;
                    }
                };
                let msg: ServerMessage = match serde_json::from_str(&text) {
                    Ok(msg) => msg,
                    Err(e) => {
                        tracing::warn!("unparseable server frame: {e}");
                        continue;
                    }
                };
                if let ServerMessage::Error { message } = &msg {
                    tracing::warn!(%message, "server reported an error");
                }
                if let Some(ctl) = Control::from_server(msg) {
                    if control_tx.send(ctl).await.is_err() {
                        break;
                    }
                }
            }
        });

        let mut sink = outbound;
        let outcome = self.delivery.serve(&mut sink, &mut control).await;
        reader.abort();
        writer.abort();
        outcome
    }
}
