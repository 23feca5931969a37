//! Table change notifications
//!
//! Change events arrive either from the backend's `postgres_changes` channel
//! or from [`crate::postgrest::MemoryGateway`]. They are fanned out to
//! per-table subscribers through a [`ChangeFeed`].

mod listener;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::error::Error;

pub use listener::ChangeListener;

/// Realtime event types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RealtimeEventType {
    /// Insert operation
    #[serde(rename = "INSERT")]
    Insert,

    /// Update operation
    #[serde(rename = "UPDATE")]
    Update,

    /// Delete operation
    #[serde(rename = "DELETE")]
    Delete,
}

/// A single row change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// The schema
    pub schema: String,

    /// The table
    pub table: String,

    /// Commit timestamp
    pub commit_timestamp: String,

    /// Event type
    #[serde(rename = "eventType")]
    pub event_type: RealtimeEventType,

    /// Row after the operation
    pub new: Option<Value>,

    /// Row before the operation
    pub old: Option<Value>,
}

impl ChangeEvent {
    /// Decode the payload of a `postgres_changes` message
    ///
    /// Accepts both the `data`/`record`/`old_record` shape and the older
    /// `eventType`/`new`/`old` one.
    pub fn from_postgres_changes(payload: &Value) -> Result<Self, Error> {
        let data = payload.get("data").unwrap_or(payload);

        let event_type = data
            .get("type")
            .or_else(|| data.get("eventType"))
            .cloned()
            .ok_or_else(|| Error::realtime("change payload has no event type"))?;
        let event_type: RealtimeEventType = serde_json::from_value(event_type)
            .map_err(|e| Error::realtime(format!("unknown change type: {}", e)))?;

        let text = |key: &str| {
            data.get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_default()
        };
        let row = |keys: &[&str]| {
            keys.iter()
                .filter_map(|key| data.get(*key))
                .find(|value| value.as_object().map(|o| !o.is_empty()).unwrap_or(false))
                .cloned()
        };

        let table = text("table");
        if table.is_empty() {
            return Err(Error::realtime("change payload has no table"));
        }

        Ok(Self {
            schema: text("schema"),
            table,
            commit_timestamp: text("commit_timestamp"),
            event_type,
            new: row(&["record", "new"]),
            old: row(&["old_record", "old"]),
        })
    }

    /// The id of the changed row, from the new or old image
    pub fn row_id(&self) -> Option<i64> {
        self.new
            .as_ref()
            .or(self.old.as_ref())
            .and_then(|row| row.get("id"))
            .and_then(Value::as_i64)
    }
}

/// What a subscriber receives
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// A change to the subscribed table
    Change(ChangeEvent),

    /// The subscriber fell behind and this many events were dropped
    Missed(u64),
}

impl Delivery {
    pub fn into_change(self) -> Option<ChangeEvent> {
        match self {
            Delivery::Change(event) => Some(event),
            Delivery::Missed(_) => None,
        }
    }
}

/// Broadcast hub for change events
#[derive(Debug, Clone)]
pub struct ChangeFeed {
    sender: broadcast::Sender<ChangeEvent>,
}

impl ChangeFeed {
    /// Create a feed buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event; returns the number of subscribers reached
    pub fn publish(&self, event: ChangeEvent) -> usize {
        // no subscribers is not an error
        self.sender.send(event).unwrap_or(0)
    }

    /// Decode and publish a backend `postgres_changes` payload
    pub fn publish_payload(&self, payload: &Value) -> Result<usize, Error> {
        let event = ChangeEvent::from_postgres_changes(payload)?;
        Ok(self.publish(event))
    }

    /// Subscribe to changes of one table
    pub fn subscribe(&self, table: &str) -> TableSubscription {
        TableSubscription {
            table: table.to_string(),
            receiver: self.sender.subscribe(),
        }
    }
}

/// Receiver filtered to one table
pub struct TableSubscription {
    table: String,
    receiver: broadcast::Receiver<ChangeEvent>,
}

impl TableSubscription {
    /// The table this subscription follows
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Wait for the next delivery; `None` once the feed is gone
    pub async fn recv(&mut self) -> Option<Delivery> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.table == self.table => return Some(Delivery::Change(event)),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    return Some(Delivery::Missed(count))
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Realtime channel subscription
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    /// The channel topic
    pub topic: String,

    /// The `phx_join` message that subscribes to the tables
    pub join: Value,
}

/// Builder for a `postgres_changes` channel
#[derive(Debug, Clone)]
pub struct ChannelBuilder {
    schema: String,
    tables: Vec<String>,
}

impl ChannelBuilder {
    pub fn new(schema: &str) -> Self {
        Self {
            schema: schema.to_string(),
            tables: Vec::new(),
        }
    }

    /// Subscribe to a specific table
    pub fn table(mut self, table: &str) -> Self {
        self.tables.push(table.to_string());
        self
    }

    /// Build the channel
    pub fn build(self) -> Channel {
        let tables = if self.tables.is_empty() {
            "*".to_string()
        } else {
            self.tables.join(",")
        };
        let topic = format!("realtime:{}:{}", self.schema, tables);

        let changes: Vec<Value> = if self.tables.is_empty() {
            vec![json!({ "event": "*", "schema": self.schema })]
        } else {
            self.tables
                .iter()
                .map(|table| json!({ "event": "*", "schema": self.schema, "table": table }))
                .collect()
        };

        let join = json!({
            "topic": topic,
            "event": "phx_join",
            "payload": { "config": { "postgres_changes": changes } },
            "ref": "1",
        });

        Channel { topic, join }
    }
}

/// WebSocket endpoint of the backend's realtime service
pub fn websocket_url(url: &str, key: &str) -> String {
    let url = url.replace("http://", "ws://").replace("https://", "wss://");
    format!("{}/realtime/v1/websocket?apikey={}&vsn=1.0.0", url, key)
}
