//! # Gateway Bridge Transport
//!
//! Talks to an upstream gateway process that holds the actual channel-network
//! session. Push updates arrive over a WebSocket; reconciliation, state and
//! resolution are plain JSON over HTTP.
//!
//! ## Wire format
//! - WebSocket: after connecting the client sends `{"subscribe":[ids]}`. The
//!   gateway answers with frames like
//!   `{"channel_id":N,"kind":"new"|"edit"|"delete","message":{..},"deleted_ids":[..]}`.
//! - `POST difference` with `{channel_id, access_token, cursor, limit}` answers
//!   `{"status":"page","items":[..],"cursor":N}` or
//!   `{"status":"too_long","baseline":N}`. `429` carries `{"retry_after":S}`.
//! - `GET state` answers `{"cursor":N}`.
//! - `GET resolve?identifier=X` answers `{id,title,access_token}`; `404` when
//!   the channel is unknown, `422` when it is not a broadcast channel.
//!
//! The WebSocket is reconnected with exponential back-off. Only the initial
//! state probe in `connect` is fatal.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};
use tokio_util::sync::CancellationToken;

use crate::core::model::{ChannelId, ChannelIdentity, Cursor};
use crate::retrieve::ApiClient;
use crate::upstream::{
    ChannelCatalog, Difference, PushEvent, PushPayload, RawItem, ResolveError, ResolvedChannel, TransportError,
    UpstreamTransport,
};

const PUSH_BUFFER: usize = 1024;
const DEFAULT_RETRY_AFTER_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub http_url: String,
    pub ws_url: String,
    /// Opaque bearer token for the gateway, if it wants one.
    pub token: Option<String>,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            http_url: "http://127.0.0.1:8088".into(),
            ws_url: "ws://127.0.0.1:8088/updates".into(),
            token: None,
            reconnect_base_delay: Duration::from_millis(1000),
            reconnect_max_delay: Duration::from_millis(60_000),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum FrameKind {
    New,
    Edit,
    Delete,
}

#[derive(Debug, Deserialize)]
struct BridgeFrame {
    channel_id: ChannelId,
    kind: FrameKind,
    #[serde(default)]
    message: Option<RawItem>,
    #[serde(default)]
    deleted_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum DifferenceBody {
    Page {
        #[serde(default)]
        items: Vec<RawItem>,
        cursor: Cursor,
    },
    TooLong {
        baseline: Cursor,
    },
}

#[derive(Serialize)]
struct DifferenceRequest<'a> {
    channel_id: ChannelId,
    access_token: &'a str,
    cursor: Cursor,
    limit: u32,
}

#[derive(Deserialize)]
struct StateBody {
    cursor: Cursor,
}

#[derive(Deserialize)]
struct RetryAfter {
    retry_after: u64,
}

/// Parses one WebSocket text frame into a push event.
pub fn parse_frame(text: &str) -> Result<PushEvent, TransportError> {
    let frame: BridgeFrame =
        serde_json::from_str(text).map_err(|e| TransportError::Protocol(format!("bad push frame: {}", e)))?;
    let payload = match frame.kind {
        FrameKind::New => PushPayload::NewMessage(
            frame.message.ok_or_else(|| TransportError::Protocol("'new' frame without message".into()))?,
        ),
        FrameKind::Edit => PushPayload::Edited(
            frame.message.ok_or_else(|| TransportError::Protocol("'edit' frame without message".into()))?,
        ),
        FrameKind::Delete => PushPayload::Deleted { item_ids: frame.deleted_ids },
    };
    Ok(PushEvent { channel_id: frame.channel_id, payload })
}

/// Wait requested by a `429`: the `Retry-After` header (delta seconds), then a
/// `retry_after` field in the JSON body, then the default.
fn retry_after(headers: &HeaderMap, body: &str) -> Duration {
    let from_header = headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    let secs = from_header
        .or_else(|| serde_json::from_str::<RetryAfter>(body).ok().map(|r| r.retry_after))
        .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
    Duration::from_secs(secs)
}

fn request_error(e: anyhow::Error) -> TransportError {
    TransportError::Request(e.to_string())
}

/// # Bridge Transport
///
/// Implements both `UpstreamTransport` and `ChannelCatalog`.
pub struct BridgeTransport {
    http: ApiClient,
    config: BridgeConfig,
    connected: Arc<AtomicBool>,
    /// Cancelled once, by `disconnect`.
    closed: CancellationToken,
    /// Token of the running WebSocket task, if any.
    subscription: Mutex<Option<CancellationToken>>,
}

impl BridgeTransport {
    /// Builds the transport and probes the gateway once. Failure here means
    /// the process cannot do anything useful.
    pub async fn connect(config: BridgeConfig) -> Result<Self, TransportError> {
        // Rate limits must reach the poller untouched, so no middleware retries.
        let http = ApiClient::new(&config.http_url, config.token.clone(), 0).map_err(request_error)?;
        let transport = Self {
            http,
            config,
            connected: Arc::new(AtomicBool::new(false)),
            closed: CancellationToken::new(),
            subscription: Mutex::new(None),
        };
        let cursor = transport.current_state().await?;
        log::info!("Connected to upstream gateway {} (state cursor {})", transport.config.http_url, cursor);
        Ok(transport)
    }

    async fn get_state(&self) -> Result<Cursor, TransportError> {
        let response = self.http.get::<serde_json::Value>("state", &[]).await.map_err(request_error)?;
        if !response.success {
            return Err(TransportError::Http { status: response.status, body: response.error_text().to_string() });
        }
        let body: StateBody = serde_json::from_value(response.data.unwrap_or_default())
            .map_err(|e| TransportError::Protocol(format!("bad state body: {}", e)))?;
        Ok(body.cursor)
    }
}

/// Runs one WebSocket subscription until `stop` fires or the receiver is
/// dropped, reconnecting with exponential back-off in between.
async fn run_push_stream(
    config: BridgeConfig,
    channels: Vec<ChannelId>,
    tx: mpsc::Sender<PushEvent>,
    connected: Arc<AtomicBool>,
    stop: CancellationToken,
) {
    let mut delay = config.reconnect_base_delay;

    loop {
        log::info!("Connecting to push stream: {}", config.ws_url);

        let opened = tokio::select! {
            _ = stop.cancelled() => return,
            opened = open_socket(&config) => opened,
        };

        match opened {
            Ok(ws_stream) => {
                let (mut write, mut read) = ws_stream.split();
                let msg = json!({ "subscribe": channels }).to_string();
                log::debug!("Sending upstream: {}", msg);

                if let Err(e) = write.send(WsMessage::Text(msg.into())).await {
                    log::error!("Failed to send subscribe: {}", e);
                } else {
                    log::info!("Connected to push stream");
                    connected.store(true, Ordering::SeqCst);
                    delay = config.reconnect_base_delay;

                    loop {
                        tokio::select! {
                            _ = stop.cancelled() => {
                                let _ = write.close().await;
                                connected.store(false, Ordering::SeqCst);
                                return;
                            }
                            next = read.next() => match next {
                                Some(Ok(WsMessage::Text(text))) => match parse_frame(&text) {
                                    Ok(event) => {
                                        if tx.send(event).await.is_err() {
                                            // Nobody listens any more.
                                            let _ = write.close().await;
                                            connected.store(false, Ordering::SeqCst);
                                            return;
                                        }
                                    }
                                    Err(e) => log::warn!("{}", e),
                                },
                                Some(Ok(WsMessage::Close(frame))) => {
                                    log::warn!("Push stream closed by gateway: {:?}", frame);
                                    break;
                                }
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    log::error!("Push stream error: {}", e);
                                    break;
                                }
                                None => {
                                    log::warn!("Push stream ended");
                                    break;
                                }
                            },
                        }
                    }
                }
            }
            Err(e) => log::error!("Failed to connect to push stream: {}", e),
        }

        connected.store(false, Ordering::SeqCst);
        log::info!("Reconnecting push stream in {}ms", delay.as_millis());
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(config.reconnect_max_delay);
    }
}

async fn open_socket(
    config: &BridgeConfig,
) -> anyhow::Result<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
> {
    let mut request = config.ws_url.as_str().into_client_request()?;
    if let Some(token) = &config.token {
        request
            .headers_mut()
            .insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {}", token))?);
    }
    let (ws_stream, _) = connect_async(request).await?;
    Ok(ws_stream)
}

#[async_trait]
impl UpstreamTransport for BridgeTransport {
    async fn subscribe(&self, channels: &[ChannelId]) -> Result<mpsc::Receiver<PushEvent>, TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Disconnected);
        }

        let stop = self.closed.child_token();
        if let Some(previous) = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(stop.clone())
        {
            previous.cancel();
        }

        let (tx, rx) = mpsc::channel(PUSH_BUFFER);
        tokio::spawn(run_push_stream(
            self.config.clone(),
            channels.to_vec(),
            tx,
            self.connected.clone(),
            stop,
        ));
        Ok(rx)
    }

    async fn get_difference(
        &self,
        channel: &ChannelIdentity,
        cursor: Cursor,
        limit: u32,
    ) -> Result<Difference, TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Disconnected);
        }
        let request = DifferenceRequest {
            channel_id: channel.id,
            access_token: &channel.access_token,
            cursor,
            limit,
        };
        let response = self
            .http
            .post::<serde_json::Value, _>("difference", &request)
            .await
            .map_err(request_error)?;

        if response.status == 429 {
            return Err(TransportError::RateLimited { wait: retry_after(&response.headers, response.error_text()) });
        }
        if !response.success {
            return Err(TransportError::Http { status: response.status, body: response.error_text().to_string() });
        }

        let body: DifferenceBody = serde_json::from_value(response.data.unwrap_or_default())
            .map_err(|e| TransportError::Protocol(format!("bad difference body: {}", e)))?;
        Ok(match body {
            DifferenceBody::Page { items, cursor } => Difference::Page { items, cursor },
            DifferenceBody::TooLong { baseline } => Difference::TooLong { baseline },
        })
    }

    async fn current_state(&self) -> Result<Cursor, TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Disconnected);
        }
        self.get_state().await
    }

    async fn is_connected(&self) -> bool {
        !self.closed.is_cancelled() && self.connected.load(Ordering::SeqCst)
    }

    async fn ping(&self) -> Result<(), TransportError> {
        self.current_state().await.map(|_| ())
    }

    async fn disconnect(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        log::info!("Disconnecting from upstream gateway");
        self.closed.cancel();
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn closed(&self) {
        self.closed.cancelled().await;
    }
}

#[async_trait]
impl ChannelCatalog for BridgeTransport {
    async fn resolve(&self, identifier: &str) -> Result<ResolvedChannel, ResolveError> {
        let response = self
            .http
            .get::<ResolvedChannel>("resolve", &[("identifier", identifier)])
            .await
            .map_err(|e| ResolveError::Transport(request_error(e)))?;

        match response.status {
            404 => Err(ResolveError::NotFound(identifier.to_string())),
            422 => Err(ResolveError::NotAChannel(identifier.to_string())),
            _ if !response.success => Err(ResolveError::Transport(TransportError::Http {
                status: response.status,
                body: response.error_text().to_string(),
            })),
            _ => response.data.ok_or_else(|| {
                ResolveError::Transport(TransportError::Protocol("empty resolve body".into()))
            }),
        }
    }
}
