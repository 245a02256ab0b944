//! Ethereum JSON-RPC log subscription over websocket
//!
//! Opens a socket per subscription, issues `eth_subscribe("logs", filter)` and
//! forwards `eth_subscription` notifications until the socket ends. Every way
//! the socket can end is reported on the error channel with a classified
//! [`CloseReason`].

use async_trait::async_trait;
use futures_util::{SinkExt, Stream, StreamExt};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};

use super::events::{ChainLog, CloseReason, EventSource, LogFilter, LogSubscription, SubscriptionError};
use crate::types::{Result, TollgateError};

const SUBSCRIBE_REQUEST_ID: u64 = 1;

/// Websocket event source configuration
#[derive(Debug, Clone)]
pub struct WsSourceConfig {
    /// JSON-RPC websocket URL
    pub url: String,
    /// Ping interval for keepalive
    pub ping_interval: Duration,
    /// How long to wait for connect + subscription confirmation
    pub subscribe_timeout: Duration,
    /// Buffered logs per subscription
    pub log_buffer: usize,
}

impl Default for WsSourceConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8546".to_string(),
            ping_interval: Duration::from_secs(30),
            subscribe_timeout: Duration::from_secs(15),
            log_buffer: 64,
        }
    }
}

pub struct EthWsEventSource {
    config: WsSourceConfig,
}

impl EthWsEventSource {
    pub fn new(config: WsSourceConfig) -> Self {
        Self { config }
    }
}

#[derive(Debug, Deserialize)]
struct RpcMessage {
    #[serde(default)]
    id: Option<JsonValue>,
    #[serde(default)]
    result: Option<JsonValue>,
    #[serde(default)]
    error: Option<RpcError>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<NotificationParams>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct NotificationParams {
    subscription: String,
    result: JsonValue,
}

enum Inbound {
    Log(ChainLog),
    Error(String),
    Ignore,
}

fn parse_inbound(text: &str, subscription_id: &str) -> Inbound {
    let message: RpcMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            debug!(error = %e, "Ignoring non JSON-RPC frame");
            return Inbound::Ignore;
        }
    };

    if let Some(error) = message.error {
        return Inbound::Error(format!("{} ({})", error.message, error.code));
    }
    if message.method.as_deref() != Some("eth_subscription") {
        return Inbound::Ignore;
    }
    match message.params {
        Some(params) if params.subscription == subscription_id => {
            match serde_json::from_value::<ChainLog>(params.result) {
                Ok(log) => Inbound::Log(log),
                Err(e) => Inbound::Error(format!("malformed log notification: {}", e)),
            }
        }
        _ => Inbound::Ignore,
    }
}

fn classify_ws_error(err: &tungstenite::Error) -> CloseReason {
    match err {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            CloseReason::Normal
        }
        tungstenite::Error::Tls(_) => CloseReason::TlsHandshake,
        _ => CloseReason::Abnormal,
    }
}

async fn await_subscription_id<S>(read: &mut S) -> Result<String>
where
    S: Stream<Item = std::result::Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(frame) = read.next().await {
        match frame? {
            Message::Text(text) => {
                let Ok(message) = serde_json::from_str::<RpcMessage>(&text) else {
                    continue;
                };
                if message.id.as_ref().and_then(JsonValue::as_u64) != Some(SUBSCRIBE_REQUEST_ID) {
                    continue;
                }
                if let Some(error) = message.error {
                    return Err(TollgateError::Subscription(format!(
                        "eth_subscribe rejected: {} ({})",
                        error.message, error.code
                    )));
                }
                return message
                    .result
                    .as_ref()
                    .and_then(JsonValue::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| {
                        TollgateError::Subscription("eth_subscribe returned no id".into())
                    });
            }
            Message::Close(frame) => {
                return Err(TollgateError::Subscription(format!(
                    "closed before subscription confirmed: {:?}",
                    frame
                )));
            }
            _ => {}
        }
    }
    Err(TollgateError::Subscription(
        "stream ended before subscription confirmed".into(),
    ))
}

#[async_trait]
impl EventSource for EthWsEventSource {
    async fn subscribe(&self, filter: &LogFilter) -> Result<LogSubscription> {
        let timeout = self.config.subscribe_timeout;

        let (ws_stream, _) = tokio::time::timeout(timeout, connect_async(self.config.url.as_str()))
            .await
            .map_err(|_| TollgateError::Subscription(format!("connect to {} timed out", self.config.url)))??;
        let (mut write, mut read) = ws_stream.split();

        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": SUBSCRIBE_REQUEST_ID,
            "method": "eth_subscribe",
            "params": ["logs", filter],
        });
        write.send(Message::Text(request.to_string())).await?;

        let subscription_id = tokio::time::timeout(timeout, await_subscription_id(&mut read))
            .await
            .map_err(|_| TollgateError::Subscription("eth_subscribe timed out".into()))??;
        info!(url = %self.config.url, subscription = %subscription_id, "Subscribed to contract logs");

        let (log_tx, log_rx) = mpsc::channel(self.config.log_buffer);
        let (err_tx, err_rx) = mpsc::channel(8);
        let ping_every = self.config.ping_interval;

        let task = tokio::spawn(async move {
            let mut ping = tokio::time::interval(ping_every);
            ping.tick().await;

            let closed = loop {
                tokio::select! {
                    _ = ping.tick() => {
                        if let Err(e) = write.send(Message::Ping(vec![])).await {
                            break SubscriptionError {
                                reason: classify_ws_error(&e),
                                message: format!("ping failed: {}", e),
                            };
                        }
                    }

                    frame = read.next() => match frame {
                        Some(Ok(Message::Text(text))) => match parse_inbound(&text, &subscription_id) {
                            Inbound::Log(log) => {
                                if log_tx.send(log).await.is_err() {
                                    // Subscriber went away
                                    let _ = write.close().await;
                                    return;
                                }
                            }
                            Inbound::Error(message) => {
                                warn!(error = %message, "Node reported a subscription error");
                                let _ = err_tx
                                    .send(SubscriptionError {
                                        reason: CloseReason::Rpc(message.clone()),
                                        message,
                                    })
                                    .await;
                            }
                            Inbound::Ignore => {}
                        },
                        Some(Ok(Message::Close(frame))) => {
                            let (reason, message) = match frame {
                                Some(frame) => (
                                    CloseReason::from_code(u16::from(frame.code)),
                                    frame.reason.to_string(),
                                ),
                                // 1005: closed without a status code
                                None => (CloseReason::from_code(1005), String::new()),
                            };
                            break SubscriptionError { reason, message };
                        }
                        Some(Ok(Message::Pong(_))) => debug!("Received pong"),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            break SubscriptionError {
                                reason: classify_ws_error(&e),
                                message: e.to_string(),
                            };
                        }
                        None => {
                            break SubscriptionError {
                                reason: CloseReason::Abnormal,
                                message: "stream ended without close frame".into(),
                            };
                        }
                    }
                }
            };

            debug!(reason = %closed.reason, "Log subscription ended");
            let _ = err_tx.send(closed).await;
        });

        Ok(LogSubscription::new(log_rx, err_rx, Some(task)))
    }
}
