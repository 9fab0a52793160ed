// --- Playout coordinator ----------------------------------------------------
//
// The consumer loop is the only writer of "what is playing now". One item is
// in flight at a time:
//
//   next pending queue item
//     -> else refill from the schedule (populating it from the catalog once)
//     -> else back off and try again
//   open history, notify listeners, feed the transcoder
//   race: skip request | stop | feed result
//
// A failed item is still marked played. Retrying it in place would wedge the
// channel on one bad file; the schedule brings it round again later anyway.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::catalog::exists_on_disk;
use crate::db::{rfc3339, unix_now, Store};
use crate::error::{PlayoutError, Result};
use crate::events::EventSink;
use crate::feeder::{MediaFeed, TranscoderDiagnostics};
use crate::history::Finish;
use crate::queue::QueueItem;

#[derive(Debug, Clone)]
pub struct PlayoutSettings {
    /// Wait when there is nothing at all to play.
    pub idle_backoff: Duration,
    /// Wait after a failed item before picking the next one.
    pub failure_backoff: Duration,
    /// Gap after an item completes normally.
    pub transition_pause: Duration,
    pub skip_ack_timeout: Duration,
    pub stop_timeout: Duration,
}

impl Default for PlayoutSettings {
    fn default() -> Self {
        Self {
            idle_backoff: Duration::from_secs(5),
            failure_backoff: Duration::from_secs(2),
            transition_pause: Duration::from_secs(1),
            skip_ack_timeout: Duration::from_secs(2),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlayerState {
    Stopped,
    Idle,
    Feeding,
    Failed,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NowPlaying {
    pub queue_id: i64,
    pub history_id: Option<i64>,
    pub catalog_id: String,
    pub path: String,
    pub is_ad: bool,
    pub started_at: i64,
    pub started_at_rfc3339: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlayerStatus {
    pub state: PlayerState,
    pub running: bool,
    pub loop_alive: bool,
    pub current: Option<NowPlaying>,
    pub elapsed_seconds: Option<i64>,
    pub transcoder: TranscoderDiagnostics,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SkippedItem {
    pub queue_id: i64,
    pub catalog_id: String,
}

struct SkipRequest {
    /// `true` when the item was cut short, `false` when it had already ended.
    ack: oneshot::Sender<bool>,
}

struct InFlight {
    now: NowPlaying,
    skip: Option<oneshot::Sender<SkipRequest>>,
}

struct Running {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

enum Ended {
    Skip(Option<SkipRequest>),
    Stop,
    Fed(Result<crate::feeder::FeedOutcome>),
}

enum PlayResult {
    Completed,
    Skipped,
    Failed(PlayoutError),
    Stopped,
}

struct Shared {
    store: Store,
    feed: Arc<dyn MediaFeed>,
    events: Arc<dyn EventSink>,
    settings: PlayoutSettings,
    in_flight: Mutex<Option<InFlight>>,
    active: AtomicBool,
    loop_alive: AtomicBool,
    last_error: StdMutex<Option<String>>,
}

pub struct Coordinator {
    shared: Arc<Shared>,
    lifecycle: Mutex<Option<Running>>,
}

impl Coordinator {
    pub fn new(
        store: Store,
        feed: Arc<dyn MediaFeed>,
        events: Arc<dyn EventSink>,
        settings: PlayoutSettings,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                feed,
                events,
                settings,
                in_flight: Mutex::new(None),
                active: AtomicBool::new(false),
                loop_alive: AtomicBool::new(false),
                last_error: StdMutex::new(None),
            }),
            lifecycle: Mutex::new(None),
        }
    }

    /// Start the transcoder, then the consumer loop.
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if let Some(r) = lifecycle.as_ref() {
            if !r.handle.is_finished() {
                return Err(PlayoutError::AlreadyRunning);
            }
        }
        // A loop that died on its own leaves its slot behind.
        *lifecycle = None;

        match self.shared.feed.start().await {
            Ok(()) | Err(PlayoutError::AlreadyRunning) => {}
            Err(e) => {
                let e = match e {
                    PlayoutError::SubprocessFailure(_) => e,
                    other => PlayoutError::SubprocessFailure(other.to_string()),
                };
                error!("transcoder failed to start: {e}");
                self.shared.set_last_error(Some(e.to_string()));
                return Err(e);
            }
        }
        self.shared.set_last_error(None);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shared.active.store(true, Ordering::SeqCst);
        self.shared.loop_alive.store(true, Ordering::SeqCst);
        let handle = tokio::spawn(consume(self.shared.clone(), shutdown_rx));
        *lifecycle = Some(Running {
            shutdown: shutdown_tx,
            handle,
        });
        info!("playout started");
        Ok(())
    }

    /// Stop the loop and the transcoder. The item in flight stays queued.
    pub async fn stop(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(mut running) = lifecycle.take() else {
            return Err(PlayoutError::NotRunning);
        };
        self.shared.active.store(false, Ordering::SeqCst);

        let _ = running.shutdown.send(true);
        self.shared.feed.stop().await;

        if tokio::time::timeout(self.shared.settings.stop_timeout, &mut running.handle)
            .await
            .is_err()
        {
            warn!(
                timeout_secs = self.shared.settings.stop_timeout.as_secs(),
                "playout loop did not exit in time; aborting"
            );
            running.handle.abort();
            self.shared.in_flight.lock().await.take();
            self.shared.loop_alive.store(false, Ordering::SeqCst);
        }
        info!("playout stopped");
        Ok(())
    }

    /// Ask the play-step to drop the current item.
    pub async fn skip(&self) -> Result<SkippedItem> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let skipped = {
            let mut slot = self.shared.in_flight.lock().await;
            let current = slot.as_mut().ok_or(PlayoutError::NothingPlaying)?;
            let tx = current.skip.take().ok_or(PlayoutError::NothingPlaying)?;
            if tx.send(SkipRequest { ack: ack_tx }).is_err() {
                return Err(PlayoutError::NothingPlaying);
            }
            SkippedItem {
                queue_id: current.now.queue_id,
                catalog_id: current.now.catalog_id.clone(),
            }
        };
        info!(queue_id = skipped.queue_id, file_id = %skipped.catalog_id, "skip requested");

        match tokio::time::timeout(self.shared.settings.skip_ack_timeout, ack_rx).await {
            Ok(Ok(true)) => Ok(skipped),
            Ok(Ok(false)) => {
                info!(queue_id = skipped.queue_id, "item ended before the skip took effect");
                Err(PlayoutError::NothingPlaying)
            }
            Ok(Err(_)) => Err(PlayoutError::Timeout(
                "play step ended before acknowledging the skip".into(),
            )),
            Err(_) => Err(PlayoutError::Timeout(format!(
                "skip not acknowledged within {:?}",
                self.shared.settings.skip_ack_timeout
            ))),
        }
    }

    pub async fn now_playing(&self) -> Option<NowPlaying> {
        self.shared.in_flight.lock().await.as_ref().map(|f| f.now.clone())
    }

    pub async fn status(&self) -> PlayerStatus {
        let current = self.now_playing().await;
        let running = self.shared.active.load(Ordering::SeqCst);
        let loop_alive = self.shared.loop_alive.load(Ordering::SeqCst);
        let state = match (running, loop_alive, current.is_some()) {
            (false, _, _) => PlayerState::Stopped,
            (true, false, _) => PlayerState::Failed,
            (true, true, true) => PlayerState::Feeding,
            (true, true, false) => PlayerState::Idle,
        };
        let now = unix_now();
        PlayerStatus {
            state,
            running,
            loop_alive,
            elapsed_seconds: current.as_ref().map(|c| (now - c.started_at).max(0)),
            current,
            transcoder: self.shared.feed.diagnostics(),
            last_error: self.shared.last_error(),
        }
    }
}

// --- consumer loop ----------------------------------------------------------

async fn consume(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    info!("playout loop started");
    loop {
        if *shutdown.borrow() {
            break;
        }

        if !shared.feed.is_alive() {
            let diag = shared.feed.diagnostics();
            warn!(
                exit_status = diag.exit_status.as_deref().unwrap_or("unknown"),
                last_stderr = diag.last_stderr.as_deref().unwrap_or(""),
                "transcoder is gone; restarting"
            );
            shared.feed.stop().await;
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = shared.feed.start().await {
                error!("transcoder restart failed, playout loop exiting: {e}");
                shared.set_last_error(Some(format!("transcoder restart failed: {e}")));
                break;
            }
        }

        let item = match shared.store.run(next_or_autofill).await {
            Ok(item) => item,
            Err(e) => {
                warn!(reason = e.reason(), "nothing to play: {e}");
                if pause(shared.settings.idle_backoff, &mut shutdown).await {
                    break;
                }
                continue;
            }
        };

        match shared.play(item, &mut shutdown).await {
            PlayResult::Completed => {
                if pause(shared.settings.transition_pause, &mut shutdown).await {
                    break;
                }
            }
            PlayResult::Skipped => {}
            PlayResult::Failed(e) => {
                debug!(reason = e.reason(), "backing off after failed item");
                if pause(shared.settings.failure_backoff, &mut shutdown).await {
                    break;
                }
            }
            PlayResult::Stopped => break,
        }
    }
    shared.loop_alive.store(false, Ordering::SeqCst);
    info!("playout loop exited");
}

/// Sleep for `d`. Returns true when a stop arrived instead.
async fn pause(d: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(d) => *shutdown.borrow(),
        _ = shutdown.changed() => true,
    }
}

/// Next pending queue item, refilling the queue from the schedule when empty.
fn next_or_autofill(store: &Store) -> Result<QueueItem> {
    if let Some(item) = store.queue().next_pending()? {
        return Ok(item);
    }

    let scheduled = match store.schedule().next()? {
        Some(s) => s,
        None => {
            let playable: Vec<_> = store
                .catalog()
                .list()?
                .into_iter()
                .filter(|e| {
                    let ok = exists_on_disk(&e.path);
                    if !ok {
                        warn!(file_id = %e.id, path = %e.path, "cataloged file is gone from disk; not scheduling");
                    }
                    ok
                })
                .collect();
            if playable.is_empty() {
                return Err(PlayoutError::NoPlayableContent(
                    "queue and schedule are empty and no cataloged file exists on disk".into(),
                ));
            }
            let added = store.schedule().populate(&playable)?;
            info!(added, "schedule was empty; populated from catalog");
            store.schedule().next()?.ok_or_else(|| {
                PlayoutError::NoPlayableContent("schedule still empty after population".into())
            })?
        }
    };

    let entry = store
        .catalog()
        .get(&scheduled.catalog_id)?
        .ok_or_else(|| PlayoutError::NotCataloged(scheduled.catalog_id.clone()))?;
    if !exists_on_disk(&entry.path) {
        return Err(PlayoutError::FileMissing(entry.path));
    }

    let item = store.queue().enqueue(&entry.id, false)?;
    info!(
        queue_id = item.id,
        file_id = %entry.id,
        schedule_position = scheduled.position,
        "queue refilled from schedule"
    );
    Ok(item)
}

impl Shared {
    fn set_last_error(&self, err: Option<String>) {
        if let Ok(mut last) = self.last_error.lock() {
            *last = err;
        }
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|l| l.clone())
    }

    async fn play(&self, item: QueueItem, shutdown: &mut watch::Receiver<bool>) -> PlayResult {
        let lookup = item.catalog_id.clone();
        let entry = match self.store.run(move |s| s.catalog().get(&lookup)).await {
            Ok(Some(e)) => e,
            Ok(None) => {
                let err = PlayoutError::NotCataloged(item.catalog_id.clone());
                return self.fail(&item, None, err).await;
            }
            Err(e) => return self.fail(&item, None, e).await,
        };

        let started_at = unix_now();
        let (catalog_id, is_ad) = (item.catalog_id.clone(), item.is_ad);
        let history_id = match self
            .store
            .run(move |s| s.history().start(&catalog_id, is_ad, started_at))
            .await
        {
            Ok(rec) => Some(rec.id),
            Err(e) => {
                error!(queue_id = item.id, "failed to open history record: {e}");
                None
            }
        };

        info!(
            queue_id = item.id,
            history_id = ?history_id,
            file_id = %item.catalog_id,
            path = %entry.path,
            is_ad = item.is_ad,
            "now playing"
        );
        self.events.notify_now_playing(&item.catalog_id, started_at);

        let (skip_tx, mut skip_rx) = oneshot::channel::<SkipRequest>();
        *self.in_flight.lock().await = Some(InFlight {
            now: NowPlaying {
                queue_id: item.id,
                history_id,
                catalog_id: item.catalog_id.clone(),
                path: entry.path.clone(),
                is_ad: item.is_ad,
                started_at,
                started_at_rfc3339: rfc3339(started_at),
            },
            skip: Some(skip_tx),
        });

        let path = PathBuf::from(&entry.path);
        let mut feed = self.feed.feed(&path);
        let ended = tokio::select! {
            biased;
            req = &mut skip_rx => Ended::Skip(req.ok()),
            _ = shutdown.changed() => Ended::Stop,
            out = &mut feed => Ended::Fed(out),
        };
        // Dropping the feed future abandons whatever is still being written.
        drop(feed);
        self.in_flight.lock().await.take();
        let late_skip = match &ended {
            Ended::Skip(_) => None,
            _ => skip_rx.try_recv().ok(),
        };

        let elapsed = (unix_now() - started_at).max(0);
        match ended {
            Ended::Skip(req) => {
                self.finish(history_id, Finish::Skipped).await;
                self.mark_played(item.id).await;
                info!(queue_id = item.id, file_id = %item.catalog_id, elapsed_secs = elapsed, "item skipped");
                if let Some(req) = req {
                    let _ = req.ack.send(true);
                }
                PlayResult::Skipped
            }
            Ended::Stop => {
                self.finish(history_id, Finish::Stopped).await;
                info!(queue_id = item.id, file_id = %item.catalog_id, "stopped mid-item; it stays queued");
                PlayResult::Stopped
            }
            Ended::Fed(out) => {
                let result = match out.and_then(|o| o.into_result(&path)) {
                    Ok(bytes) => {
                        self.finish(history_id, Finish::Completed).await;
                        self.mark_played(item.id).await;
                        info!(
                            queue_id = item.id,
                            file_id = %item.catalog_id,
                            bytes,
                            elapsed_secs = elapsed,
                            "item completed"
                        );
                        PlayResult::Completed
                    }
                    Err(e) => self.fail(&item, history_id, e).await,
                };
                // The item ended on its own; nothing was skipped.
                if let Some(req) = late_skip {
                    let _ = req.ack.send(false);
                }
                result
            }
        }
    }

    async fn fail(&self, item: &QueueItem, history_id: Option<i64>, err: PlayoutError) -> PlayResult {
        if err.is_playback_failure() {
            warn!(queue_id = item.id, file_id = %item.catalog_id, reason = err.reason(), "playback failed: {err}");
        } else {
            error!(queue_id = item.id, file_id = %item.catalog_id, reason = err.reason(), "playback failed: {err}");
        }
        self.finish(history_id, Finish::Failed(err.to_string())).await;
        // Marked played even on failure so the loop cannot spin on this item.
        self.mark_played(item.id).await;
        PlayResult::Failed(err)
    }

    async fn finish(&self, history_id: Option<i64>, how: Finish) {
        let Some(id) = history_id else {
            return;
        };
        if let Err(e) = self.store.run(move |s| s.history().finish(id, &how)).await {
            error!(history_id = id, "failed to finalize history record: {e}");
        }
    }

    async fn mark_played(&self, queue_id: i64) {
        if let Err(e) = self.store.run(move |s| s.queue().mark_played(queue_id)).await {
            error!(queue_id, "failed to mark queue item played: {e}");
        }
    }
}
