// --- WebSocket "now playing" hub ----------------------------------------------
//
// Every connected client gets its own receiver on a broadcast channel. A slow
// client lags and loses messages; it never slows the playout loop down.
//
// The most recent now-playing message is retained so a client that connects
// mid-item learns what is on air without waiting for the next transition.
//
// `WsLogLayer` mirrors tracing events onto the same channel as `log` messages,
// which turns /api/ws into a live debug console.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::field::{Field, Visit};
use tracing::{debug, info, warn, Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;
use uuid::Uuid;

use crate::events::EventSink;

const PING_PERIOD: Duration = Duration::from_secs(54);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubMessage {
    Connection { status: String, message: String },
    CurrentlyPlaying { file_id: String, started_time: i64 },
    Error { message: String },
    Log {
        level: String,
        target: String,
        message: String,
        fields: Map<String, Value>,
    },
}

#[derive(Clone)]
pub struct WsHub {
    tx: broadcast::Sender<HubMessage>,
    last: Arc<Mutex<Option<HubMessage>>>,
}

impl WsHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        info!(capacity, "websocket hub initialized");
        Self {
            tx,
            last: Arc::new(Mutex::new(None)),
        }
    }

    pub fn client_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubMessage> {
        self.tx.subscribe()
    }

    /// A tracing layer that forwards every event to connected clients.
    pub fn log_layer(&self) -> WsLogLayer {
        WsLogLayer {
            tx: self.tx.clone(),
        }
    }

    pub fn last_now_playing(&self) -> Option<HubMessage> {
        self.last.lock().ok().and_then(|g| g.clone())
    }

    /// Drive one upgraded connection until the client goes away.
    pub async fn serve_socket(self, mut socket: WebSocket) {
        let session = Uuid::new_v4();
        let mut rx = self.subscribe();
        info!(%session, total_clients = self.client_count(), "websocket client connected");

        let welcome = HubMessage::Connection {
            status: "connected".into(),
            message: "Connected to channelcast websocket".into(),
        };
        if send_json(&mut socket, &welcome).await.is_err() {
            return;
        }
        if let Some(current) = self.last_now_playing() {
            if send_json(&mut socket, &current).await.is_err() {
                return;
            }
        }

        let mut ping = tokio::time::interval(PING_PERIOD);
        ping.tick().await;

        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Ok(m) => {
                        if send_json(&mut socket, &m).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(%session, "websocket client lagged by {n} messages (dropping)");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                incoming = socket.recv() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        debug!(%session, message = %text, "websocket message from client");
                        if serde_json::from_str::<serde_json::Value>(&text).is_err() {
                            let err = HubMessage::Error { message: "Invalid message format".into() };
                            if send_json(&mut socket, &err).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(%session, "websocket read error: {e}");
                        break;
                    }
                },
                _ = ping.tick() => {
                    if socket.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }

        info!(%session, "websocket connection closed");
    }
}

async fn send_json(socket: &mut WebSocket, msg: &HubMessage) -> Result<(), axum::Error> {
    let text = serde_json::to_string(msg).map_err(axum::Error::new)?;
    socket.send(Message::Text(text)).await
}

impl EventSink for WsHub {
    fn notify_now_playing(&self, catalog_id: &str, started_at_unix: i64) {
        let msg = HubMessage::CurrentlyPlaying {
            file_id: catalog_id.to_string(),
            started_time: started_at_unix,
        };
        if let Ok(mut last) = self.last.lock() {
            *last = Some(msg.clone());
        }
        // No receivers is not an error here; the message is retained above.
        match self.tx.send(msg) {
            Ok(n) => debug!(file_id = %catalog_id, clients = n, "broadcast currently_playing"),
            Err(_) => debug!(file_id = %catalog_id, "no websocket clients connected"),
        }
    }
}

// --- log forwarding -------------------------------------------------------------

/// Broadcasts log events as `HubMessage::Log`.
///
/// Sending on a broadcast channel never waits: with no clients the event is
/// discarded, and a client that falls behind loses the oldest lines.
#[derive(Clone)]
pub struct WsLogLayer {
    tx: broadcast::Sender<HubMessage>,
}

#[derive(Default)]
struct FieldCollector {
    message: String,
    fields: Map<String, Value>,
}

impl FieldCollector {
    fn put(&mut self, field: &Field, value: Value) {
        if field.name() == "message" {
            self.message = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
        } else {
            self.fields.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for FieldCollector {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, Value::from(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.put(field, Value::from(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.put(field, Value::from(format!("{value:?}")));
    }
}

impl<S: Subscriber> Layer<S> for WsLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if self.tx.receiver_count() == 0 {
            return;
        }
        let meta = event.metadata();
        let mut collected = FieldCollector::default();
        event.record(&mut collected);
        let _ = self.tx.send(HubMessage::Log {
            level: meta.level().as_str().to_ascii_lowercase(),
            target: meta.target().to_string(),
            message: collected.message,
            fields: collected.fields,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_playing_serializes_with_type_tag() {
        let msg = HubMessage::CurrentlyPlaying {
            file_id: "abc".into(),
            started_time: 1_700_000_000,
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            v,
            serde_json::json!({"type": "currently_playing", "file_id": "abc", "started_time": 1_700_000_000})
        );
    }

    #[tokio::test]
    async fn notify_reaches_subscribers_and_is_retained() {
        let hub = WsHub::new(16);
        let mut rx = hub.subscribe();

        hub.notify_now_playing("abc", 42);

        let got = rx.recv().await.unwrap();
        assert_eq!(
            got,
            HubMessage::CurrentlyPlaying {
                file_id: "abc".into(),
                started_time: 42
            }
        );
        assert_eq!(hub.last_now_playing(), Some(got));
    }

    #[test]
    fn log_events_reach_subscribers_with_fields() {
        use tracing_subscriber::layer::SubscriberExt;

        let hub = WsHub::new(16);
        let mut rx = hub.subscribe();
        let subscriber = tracing_subscriber::registry().with(hub.log_layer());
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(file_id = "abc", bytes = 42u64, "feed stalled");
        });

        match rx.try_recv().unwrap() {
            HubMessage::Log {
                level,
                message,
                fields,
                ..
            } => {
                assert_eq!(level, "warn");
                assert_eq!(message, "feed stalled");
                assert_eq!(fields.get("file_id"), Some(&Value::from("abc")));
                assert_eq!(fields.get("bytes"), Some(&Value::from(42u64)));
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn slow_log_reader_loses_oldest_lines() {
        use tracing_subscriber::layer::SubscriberExt;

        let hub = WsHub::new(2);
        let mut rx = hub.subscribe();
        let subscriber = tracing_subscriber::registry().with(hub.log_layer());
        tracing::subscriber::with_default(subscriber, || {
            for i in 0..5 {
                tracing::info!(i, "line");
            }
        });

        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(3))
        ));
        assert!(matches!(rx.try_recv(), Ok(HubMessage::Log { .. })));
    }

    #[test]
    fn logging_without_clients_is_dropped() {
        use tracing_subscriber::layer::SubscriberExt;

        let hub = WsHub::new(2);
        let subscriber = tracing_subscriber::registry().with(hub.log_layer());
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("nobody is listening");
        });
        let mut rx = hub.subscribe();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn notify_without_clients_does_not_fail() {
        let hub = WsHub::new(4);
        hub.notify_now_playing("abc", 1);
        hub.notify_now_playing("def", 2);
        assert!(matches!(
            hub.last_now_playing(),
            Some(HubMessage::CurrentlyPlaying { ref file_id, .. }) if file_id == "def"
        ));
    }
}
