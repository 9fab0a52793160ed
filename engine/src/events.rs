/// Receiver of "now playing" notifications.
///
/// Called from the playout loop right after a history record is opened, so
/// implementations must return immediately (queue the message, never wait on
/// a client).
pub trait EventSink: Send + Sync {
    fn notify_now_playing(&self, catalog_id: &str, started_at_unix: i64);
}

/// Sink for headless runs and tests.
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn notify_now_playing(&self, _catalog_id: &str, _started_at_unix: i64) {}
}
