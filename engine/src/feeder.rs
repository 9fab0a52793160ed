// --- Pipeline feeder (ffmpeg) -------------------------------------------------
//
// One long-lived ffmpeg reads MPEG-TS on stdin in real time (`-re`) and writes
// a rolling HLS window. Files are pushed into that single stdin back to back,
// so the output stream never restarts between items.
//
// Task group per transcoder instance:
//   - delivery worker: takes feed requests off a bounded channel and streams
//     one file at a time into the sink
//   - stderr observer: classifies ffmpeg's log lines and keeps a short tail
//   - stdout observer
//   - exit watcher: owns the Child, records the exit status, flips `alive`
//
// The sink lives behind an async mutex. The worker holds it for the whole file;
// stop() signals the worker first and only then takes the lock to close stdin,
// so nothing is ever written after the sink is closed.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::db::{rfc3339, unix_now};
use crate::error::{PlayoutError, Result};

const CHUNK_SIZE: usize = 32 * 1024;
const WRITE_BUFFER: usize = 256 * 1024;
const FLUSH_EVERY: u64 = 1024 * 1024;
const REQUEST_QUEUE: usize = 5;
const STDERR_TAIL: usize = 80;

/// Where and how the HLS window is written.
#[derive(Debug, Clone)]
pub struct HlsOutput {
    pub dir: PathBuf,
    pub segment_secs: u32,
    pub list_size: u32,
}

#[derive(Debug, Clone)]
pub struct TranscoderCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl TranscoderCommand {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Stream-copy MPEG-TS from stdin into a rolling HLS playlist.
    pub fn hls(ffmpeg: &str, out: &HlsOutput) -> Self {
        let segment = out.dir.join("segment_%03d.ts");
        let playlist = out.dir.join("stream.m3u8");
        Self::new(
            ffmpeg,
            [
                "-hide_banner".to_string(),
                "-re".into(),
                "-f".into(),
                "mpegts".into(),
                "-i".into(),
                "pipe:0".into(),
                "-c".into(),
                "copy".into(),
                "-f".into(),
                "hls".into(),
                "-hls_time".into(),
                out.segment_secs.to_string(),
                "-hls_list_size".into(),
                out.list_size.to_string(),
                "-hls_flags".into(),
                "delete_segments+append_list".into(),
                "-hls_segment_filename".into(),
                segment.to_string_lossy().to_string(),
                playlist.to_string_lossy().to_string(),
            ],
        )
    }
}

#[derive(Debug, Clone)]
pub struct FeederConfig {
    pub command: TranscoderCommand,
    /// Created before the transcoder is spawned.
    pub output_dir: Option<PathBuf>,
    /// Longest a single read+write step may take before the feed times out.
    pub progress_deadline: Duration,
    /// How long `feed` waits for room on the request channel.
    pub send_timeout: Duration,
    /// How long `stop` waits for ffmpeg to exit after EOF before killing it.
    pub stop_grace: Duration,
}

impl FeederConfig {
    pub fn hls(ffmpeg: &str, out: HlsOutput, progress_deadline: Duration) -> Self {
        Self {
            command: TranscoderCommand::hls(ffmpeg, &out),
            output_dir: Some(out.dir),
            progress_deadline,
            send_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
pub enum FeedOutcome {
    Success { bytes_written: u64 },
    Timeout,
    Failure(FeedFailure),
}

#[derive(Debug)]
pub enum FeedFailure {
    FileMissing(String),
    Read(std::io::Error),
    SinkClosed(String),
}

impl FeedOutcome {
    /// Collapse into the error taxonomy the playout loop works with.
    pub fn into_result(self, path: &Path) -> Result<u64> {
        match self {
            FeedOutcome::Success { bytes_written } => Ok(bytes_written),
            FeedOutcome::Timeout => Err(PlayoutError::Timeout(format!(
                "transcoder stopped accepting bytes for {}",
                path.display()
            ))),
            FeedOutcome::Failure(FeedFailure::FileMissing(p)) => Err(PlayoutError::FileMissing(p)),
            FeedOutcome::Failure(FeedFailure::Read(e)) => Err(PlayoutError::Io(e)),
            FeedOutcome::Failure(FeedFailure::SinkClosed(msg)) => {
                Err(PlayoutError::SubprocessFailure(format!("transcoder input closed: {msg}")))
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct TranscoderDiagnostics {
    pub pid: Option<u32>,
    pub alive: bool,
    pub started_at: Option<String>,
    pub exit_status: Option<String>,
    pub last_stderr: Option<String>,
}

/// The transcoder seam the playout loop drives.
#[async_trait]
pub trait MediaFeed: Send + Sync {
    async fn start(&self) -> Result<()>;

    /// Stream one file. Returns once the file is fully accepted, failed, or
    /// stalled. Dropping the returned future abandons the file at the next
    /// chunk boundary.
    async fn feed(&self, path: &Path) -> Result<FeedOutcome>;

    async fn stop(&self);

    fn is_alive(&self) -> bool;

    fn diagnostics(&self) -> TranscoderDiagnostics;
}

// --- stderr classification -----------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StderrClass {
    Error,
    Warning,
    Progress,
    Info,
    Other,
}

pub fn classify_stderr_line(line: &str) -> StderrClass {
    let lc = line.to_ascii_lowercase();
    if lc.contains("error") || lc.contains("failed") {
        StderrClass::Error
    } else if lc.contains("warning") {
        StderrClass::Warning
    } else if line.contains("frame=") || line.contains("time=") {
        StderrClass::Progress
    } else if line.contains("Input #")
        || line.contains("Output #")
        || line.contains("Stream #")
        || line.contains("Duration:")
        || line.contains("Opening")
    {
        StderrClass::Info
    } else {
        StderrClass::Other
    }
}

/// Most useful recent line for an operator: the last non-empty line that is
/// not progress chatter or a pipe-teardown echo.
pub fn last_stderr_summary(tail: &VecDeque<String>) -> Option<String> {
    for line in tail.iter().rev() {
        let t = line.trim();
        if t.is_empty() {
            continue;
        }
        let lc = t.to_ascii_lowercase();
        if lc.contains("broken pipe") || classify_stderr_line(t) == StderrClass::Progress {
            continue;
        }
        return Some(t.to_string());
    }
    tail.back().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

// --- Feeder ---------------------------------------------------------------------

type Sink = Arc<Mutex<Option<BufWriter<ChildStdin>>>>;

#[derive(Default)]
struct DiagState {
    pid: Option<u32>,
    started_at: Option<i64>,
    exit_status: Option<String>,
    stderr_tail: VecDeque<String>,
}

struct FeedRequest {
    path: PathBuf,
    reply: oneshot::Sender<FeedOutcome>,
}

struct Running {
    requests: mpsc::Sender<FeedRequest>,
    shutdown: watch::Sender<bool>,
    kill: Option<oneshot::Sender<()>>,
    exit_watcher: JoinHandle<()>,
    worker: JoinHandle<()>,
    observers: Vec<JoinHandle<()>>,
}

pub struct Feeder {
    cfg: FeederConfig,
    running: Mutex<Option<Running>>,
    sink: Sink,
    alive: Arc<AtomicBool>,
    diag: Arc<StdMutex<DiagState>>,
}

impl Feeder {
    pub fn new(cfg: FeederConfig) -> Self {
        Self {
            cfg,
            running: Mutex::new(None),
            sink: Arc::new(Mutex::new(None)),
            alive: Arc::new(AtomicBool::new(false)),
            diag: Arc::new(StdMutex::new(DiagState::default())),
        }
    }

    async fn teardown(&self, mut running: Running) {
        let _ = running.shutdown.send(true);

        // Blocks until the worker lets go of the sink.
        if let Some(mut writer) = self.sink.lock().await.take() {
            let _ = tokio::time::timeout(Duration::from_secs(1), writer.flush()).await;
            drop(writer);
            debug!("transcoder stdin closed");
        }

        if tokio::time::timeout(self.cfg.stop_grace, &mut running.exit_watcher)
            .await
            .is_err()
        {
            warn!(
                grace_ms = self.cfg.stop_grace.as_millis() as u64,
                "transcoder did not exit after EOF; killing"
            );
            if let Some(kill) = running.kill.take() {
                let _ = kill.send(());
            }
            let _ = (&mut running.exit_watcher).await;
        }

        let _ = running.worker.await;
        for mut task in running.observers {
            if tokio::time::timeout(Duration::from_secs(1), &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }
        self.alive.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaFeed for Feeder {
    async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if let Some(old) = running.take() {
            if self.is_alive() {
                *running = Some(old);
                return Err(PlayoutError::AlreadyRunning);
            }
            // Previous instance already exited; reap its tasks first.
            self.teardown(old).await;
        }

        if let Some(dir) = &self.cfg.output_dir {
            tokio::fs::create_dir_all(dir).await?;
        }

        let program = &self.cfg.command.program;
        let mut child = Command::new(program)
            .args(&self.cfg.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PlayoutError::SubprocessFailure(format!("failed to spawn {program}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PlayoutError::SubprocessFailure("transcoder stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PlayoutError::SubprocessFailure("transcoder stdout unavailable".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| PlayoutError::SubprocessFailure("transcoder stderr unavailable".into()))?;
        let pid = child.id();

        if let Ok(mut d) = self.diag.lock() {
            *d = DiagState {
                pid,
                started_at: Some(unix_now()),
                ..DiagState::default()
            };
        }
        *self.sink.lock().await = Some(BufWriter::with_capacity(WRITE_BUFFER, stdin));
        self.alive.store(true, Ordering::SeqCst);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (req_tx, req_rx) = mpsc::channel(REQUEST_QUEUE);
        let (kill_tx, kill_rx) = oneshot::channel();

        let exit_watcher = tokio::spawn(watch_exit(child, kill_rx, self.alive.clone(), self.diag.clone()));
        let observers = vec![
            tokio::spawn(observe_stderr(stderr, self.diag.clone())),
            tokio::spawn(observe_stdout(stdout)),
        ];
        let worker = tokio::spawn(delivery_worker(
            req_rx,
            self.sink.clone(),
            self.cfg.progress_deadline,
            shutdown_rx,
        ));

        info!(pid = ?pid, program = %program, "transcoder started");
        *running = Some(Running {
            requests: req_tx,
            shutdown: shutdown_tx,
            kill: Some(kill_tx),
            exit_watcher,
            worker,
            observers,
        });
        Ok(())
    }

    async fn feed(&self, path: &Path) -> Result<FeedOutcome> {
        let requests = match self.running.lock().await.as_ref() {
            Some(r) => r.requests.clone(),
            None => {
                return Err(PlayoutError::SubprocessFailure("transcoder is not running".into()));
            }
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let req = FeedRequest {
            path: path.to_path_buf(),
            reply: reply_tx,
        };
        match tokio::time::timeout(self.cfg.send_timeout, requests.send(req)).await {
            Err(_) => {
                return Err(PlayoutError::Timeout(format!(
                    "delivery worker did not accept {} within {:?}",
                    path.display(),
                    self.cfg.send_timeout
                )));
            }
            Ok(Err(_)) => {
                return Err(PlayoutError::SubprocessFailure("delivery worker has stopped".into()));
            }
            Ok(Ok(())) => {}
        }

        reply_rx
            .await
            .map_err(|_| PlayoutError::SubprocessFailure("delivery worker dropped the request".into()))
    }

    async fn stop(&self) {
        let mut running = self.running.lock().await;
        let Some(current) = running.take() else {
            return;
        };
        self.teardown(current).await;
        info!("transcoder stopped");
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn diagnostics(&self) -> TranscoderDiagnostics {
        let alive = self.is_alive();
        match self.diag.lock() {
            Ok(d) => TranscoderDiagnostics {
                pid: d.pid,
                alive,
                started_at: d.started_at.and_then(rfc3339),
                exit_status: d.exit_status.clone(),
                last_stderr: last_stderr_summary(&d.stderr_tail),
            },
            Err(_) => TranscoderDiagnostics {
                alive,
                ..TranscoderDiagnostics::default()
            },
        }
    }
}

// --- task group ------------------------------------------------------------------

async fn watch_exit(
    mut child: Child,
    kill: oneshot::Receiver<()>,
    alive: Arc<AtomicBool>,
    diag: Arc<StdMutex<DiagState>>,
) {
    // A dropped kill sender (Feeder gone) also kills the process.
    let status = tokio::select! {
        s = child.wait() => s,
        _ = kill => {
            let _ = child.start_kill();
            child.wait().await
        }
    };
    alive.store(false, Ordering::SeqCst);

    let summary = match &status {
        Ok(s) => s.to_string(),
        Err(e) => format!("wait failed: {e}"),
    };
    if let Ok(mut d) = diag.lock() {
        d.exit_status = Some(summary.clone());
    }
    match status {
        Ok(s) if s.success() => info!(status = %summary, "transcoder exited"),
        _ => warn!(status = %summary, "transcoder exited abnormally"),
    }
}

async fn observe_stderr(stderr: impl AsyncRead + Unpin, diag: Arc<StdMutex<DiagState>>) {
    let mut lines = BufReader::new(stderr).lines();
    let mut count: u64 = 0;
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("failed reading transcoder stderr: {e}");
                break;
            }
        };
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        count += 1;

        match classify_stderr_line(&line) {
            StderrClass::Error => error!(ffmpeg_stderr = %line, "ffmpeg error"),
            StderrClass::Warning => warn!(ffmpeg_stderr = %line, "ffmpeg warning"),
            StderrClass::Progress => debug!(ffmpeg_stderr = %line, "ffmpeg progress"),
            StderrClass::Info => info!(ffmpeg_stderr = %line, "ffmpeg"),
            StderrClass::Other => debug!(ffmpeg_stderr = %line, "ffmpeg stderr"),
        }

        if let Ok(mut d) = diag.lock() {
            if d.stderr_tail.len() >= STDERR_TAIL {
                d.stderr_tail.pop_front();
            }
            d.stderr_tail.push_back(line);
        }
    }
    debug!(stderr_lines = count, "stderr observer stopped");
}

async fn observe_stdout(stdout: impl AsyncRead + Unpin) {
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.trim().is_empty() {
            debug!(ffmpeg_stdout = %line.trim(), "ffmpeg stdout");
        }
    }
}

enum Delivery {
    Done(FeedOutcome),
    Abandoned { bytes: u64 },
    Shutdown,
}

enum StepError {
    Read(std::io::Error),
    Write(std::io::Error),
}

async fn delivery_worker(
    mut requests: mpsc::Receiver<FeedRequest>,
    sink: Sink,
    deadline: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let req = tokio::select! {
            r = requests.recv() => match r {
                Some(r) => r,
                None => break,
            },
            _ = shutdown.changed() => break,
        };
        let FeedRequest { path, reply } = req;
        if reply.is_closed() {
            debug!(path = %path.display(), "feed request withdrawn before start");
            continue;
        }

        debug!(path = %path.display(), "feeding file");
        match stream_file(&path, &sink, deadline, &reply, &mut shutdown).await {
            Delivery::Done(outcome) => {
                match &outcome {
                    FeedOutcome::Success { bytes_written } => {
                        info!(path = %path.display(), bytes = bytes_written, "file fed to transcoder")
                    }
                    FeedOutcome::Timeout => warn!(
                        path = %path.display(),
                        deadline_secs = deadline.as_secs(),
                        "transcoder stalled while feeding"
                    ),
                    FeedOutcome::Failure(f) => warn!(path = %path.display(), "feed failed: {f:?}"),
                }
                let _ = reply.send(outcome);
            }
            Delivery::Abandoned { bytes } => {
                info!(path = %path.display(), bytes, "feed abandoned by requester")
            }
            Delivery::Shutdown => break,
        }
    }
    debug!("delivery worker stopped");
}

async fn stream_file(
    path: &Path,
    sink: &Mutex<Option<BufWriter<ChildStdin>>>,
    deadline: Duration,
    reply: &oneshot::Sender<FeedOutcome>,
    shutdown: &mut watch::Receiver<bool>,
) -> Delivery {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Delivery::Done(FeedOutcome::Failure(FeedFailure::FileMissing(
                path.display().to_string(),
            )));
        }
        Err(e) => return Delivery::Done(FeedOutcome::Failure(FeedFailure::Read(e))),
    };

    let mut guard = sink.lock().await;
    let Some(writer) = guard.as_mut() else {
        return Delivery::Done(FeedOutcome::Failure(FeedFailure::SinkClosed(
            "transcoder input is closed".into(),
        )));
    };

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut written: u64 = 0;
    let mut since_flush: u64 = 0;

    loop {
        if *shutdown.borrow() {
            return Delivery::Shutdown;
        }
        if reply.is_closed() {
            let _ = tokio::time::timeout(deadline, writer.flush()).await;
            return Delivery::Abandoned { bytes: written };
        }

        let step = async {
            let n = file.read(&mut buf).await.map_err(StepError::Read)?;
            if n == 0 {
                writer.flush().await.map_err(StepError::Write)?;
                return Ok(0);
            }
            writer.write_all(&buf[..n]).await.map_err(StepError::Write)?;
            since_flush += n as u64;
            if since_flush >= FLUSH_EVERY {
                writer.flush().await.map_err(StepError::Write)?;
                since_flush = 0;
            }
            Ok::<usize, StepError>(n)
        };

        let res = tokio::select! {
            r = tokio::time::timeout(deadline, step) => r,
            _ = shutdown.changed() => return Delivery::Shutdown,
        };

        match res {
            Err(_) => return Delivery::Done(FeedOutcome::Timeout),
            Ok(Err(StepError::Read(e))) => {
                return Delivery::Done(FeedOutcome::Failure(FeedFailure::Read(e)));
            }
            Ok(Err(StepError::Write(e))) => {
                return Delivery::Done(FeedOutcome::Failure(FeedFailure::SinkClosed(e.to_string())));
            }
            Ok(Ok(0)) => {
                return Delivery::Done(FeedOutcome::Success {
                    bytes_written: written,
                });
            }
            Ok(Ok(n)) => written += n as u64,
        }
    }
}
