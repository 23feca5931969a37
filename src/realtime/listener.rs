//! WebSocket transport feeding backend change notifications into a [`ChangeFeed`]

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::config::{DeskOptions, MIN_SWEEP_INTERVAL};
use crate::error::Error;
use crate::realtime::{Channel, ChangeFeed};

/// How a socket session ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// The backend closed the connection
    Closed,

    /// Shutdown was requested
    Stopped,
}

/// Joins a `postgres_changes` channel and publishes every change it delivers
pub struct ChangeListener {
    url: String,
    channel: Channel,
    feed: ChangeFeed,
    heartbeat_interval: Duration,
    reconnect_interval: Duration,
    max_reconnect_interval: Duration,
}

impl ChangeListener {
    /// Create a listener for the socket at `url` (see [`crate::realtime::websocket_url`])
    pub fn new(url: &str, channel: Channel, feed: ChangeFeed, options: &DeskOptions) -> Self {
        Self {
            url: url.to_string(),
            channel,
            feed,
            heartbeat_interval: options.heartbeat_interval.max(MIN_SWEEP_INTERVAL),
            reconnect_interval: options.reconnect_interval.max(MIN_SWEEP_INTERVAL),
            max_reconnect_interval: options.max_reconnect_interval,
        }
    }

    /// The channel this listener joins
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Keep a session open until `shutdown` turns true or its sender is dropped
    ///
    /// Dropped connections are retried with a delay that grows by half each
    /// failed attempt, up to the configured maximum.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut delay = self.reconnect_interval;

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.session(&mut shutdown).await {
                Ok(SessionEnd::Stopped) => break,
                Ok(SessionEnd::Closed) => {
                    delay = self.reconnect_interval;
                    log::warn!("Realtime connection closed, reconnecting in {:?}", delay);
                }
                Err(e) => {
                    log::error!("Realtime connection error: {}, reconnecting in {:?}", e, delay);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            delay = delay.mul_f64(1.5).min(self.max_reconnect_interval);
        }
        log::info!("Realtime listener stopped");
    }

    async fn session(&self, shutdown: &mut watch::Receiver<bool>) -> Result<SessionEnd, Error> {
        log::info!("Connecting to realtime channel {}", self.channel.topic);
        let (stream, _) = connect_async(self.url.as_str()).await?;
        let (mut write, mut read) = stream.split();

        write.send(Message::Text(self.channel.join.to_string())).await?;
        log::debug!("Sent join for {}", self.channel.topic);

        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        // the first tick completes immediately
        heartbeat.tick().await;
        let mut next_ref: u64 = 2;

        loop {
            tokio::select! {
                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => self.forward(&text),
                    Some(Ok(Message::Close(_))) | None => return Ok(SessionEnd::Closed),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },
                _ = heartbeat.tick() => {
                    let message = json!({
                        "topic": "phoenix",
                        "event": "heartbeat",
                        "payload": {},
                        "ref": next_ref.to_string(),
                    });
                    next_ref += 1;
                    write.send(Message::Text(message.to_string())).await?;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        if let Err(e) = write.send(Message::Close(None)).await {
                            log::debug!("Error closing realtime socket: {}", e);
                        }
                        return Ok(SessionEnd::Stopped);
                    }
                }
            }
        }
    }

    /// Publish change notifications; other channel traffic is only logged
    fn forward(&self, text: &str) {
        let message: Value = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Unreadable realtime message: {}", e);
                return;
            }
        };
        let event = message.get("event").and_then(Value::as_str).unwrap_or_default();
        let payload = message.get("payload").cloned().unwrap_or(Value::Null);

        match event {
            "postgres_changes" | "INSERT" | "UPDATE" | "DELETE" => {
                match self.feed.publish_payload(&payload) {
                    Ok(reached) => log::debug!("Change published to {} subscribers", reached),
                    Err(e) => log::warn!("Ignoring change notification: {}", e),
                }
            }
            "phx_reply" => {
                if payload.get("status").and_then(Value::as_str) != Some("ok") {
                    log::warn!("Realtime request rejected: {}", payload);
                }
            }
            "phx_error" | "phx_close" => log::warn!("Realtime channel {}: {}", event, payload),
            _ => log::trace!("Realtime {} message ignored", event),
        }
    }
}
