// --- ffprobe metadata ---------------------------------------------------------
//
// Probing is best-effort. A file that ffprobe cannot read still gets a catalog
// row (duration 0, metadata `{}`); playback will surface the real problem.

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{PlayoutError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeData {
    pub json: serde_json::Value,
    pub duration_seconds: i64,
}

impl ProbeData {
    pub fn unknown() -> Self {
        Self {
            json: serde_json::json!({}),
            duration_seconds: 0,
        }
    }

    pub fn with_duration(duration_seconds: i64) -> Self {
        Self {
            json: serde_json::json!({ "format": { "duration": format!("{duration_seconds}.000000") } }),
            duration_seconds,
        }
    }
}

#[derive(Deserialize)]
struct ProbeDoc {
    #[serde(default)]
    format: ProbeFormat,
    #[serde(default)]
    streams: Vec<serde_json::Value>,
}

#[derive(Deserialize, Default)]
struct ProbeFormat {
    #[serde(default)]
    duration: Option<String>,
    #[serde(default)]
    format_name: Option<String>,
}

/// Parse ffprobe's `-print_format json` output. Returns `None` when the
/// document is not valid ffprobe JSON.
pub fn parse_probe_output(raw: &[u8]) -> Option<ProbeData> {
    let doc: ProbeDoc = serde_json::from_slice(raw).ok()?;
    let json: serde_json::Value = serde_json::from_slice(raw).ok()?;

    let duration_seconds = doc
        .format
        .duration
        .as_deref()
        .and_then(|d| d.trim().parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0)
        .map(|d| d.trunc() as i64)
        .unwrap_or(0);

    debug!(
        format = doc.format.format_name.as_deref().unwrap_or("?"),
        streams = doc.streams.len(),
        duration_seconds,
        "parsed ffprobe output"
    );

    Some(ProbeData {
        json,
        duration_seconds,
    })
}

/// Longest a single ffprobe run may take before it is killed.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Run ffprobe on `path`, giving up after `PROBE_TIMEOUT`.
pub fn probe_file(ffprobe: &str, path: &Path) -> ProbeData {
    let mut cmd = Command::new(ffprobe);
    cmd.arg("-v").arg("quiet")
        .arg("-print_format").arg("json")
        .arg("-show_format")
        .arg("-show_streams")
        .arg(path);

    let stdout = match run_bounded(cmd, PROBE_TIMEOUT) {
        Ok(stdout) => stdout,
        Err(e) => {
            warn!(path = %path.display(), "ffprobe failed: {e}");
            return ProbeData::unknown();
        }
    };

    parse_probe_output(&stdout).unwrap_or_else(|| {
        warn!(path = %path.display(), "ffprobe produced invalid JSON");
        ProbeData::unknown()
    })
}

/// Run `cmd` to completion and return its stdout. The child is killed if it
/// is still running after `timeout`.
///
/// Blocking; call it from the blocking pool.
fn run_bounded(mut cmd: Command, timeout: Duration) -> Result<Vec<u8>> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?;

    // Drain stdout on its own thread so a large document cannot fill the
    // pipe and stall the child.
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| PlayoutError::SubprocessFailure("ffprobe stdout unavailable".into()))?;
    let reader = std::thread::spawn(move || {
        let mut buf = Vec::new();
        stdout.read_to_end(&mut buf).map(|_| buf)
    });

    let started = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if started.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            // The reader is left to finish on its own once the pipe closes.
            return Err(PlayoutError::Timeout(format!(
                "ffprobe did not finish within {timeout:?}"
            )));
        }
        std::thread::sleep(POLL_INTERVAL);
    };

    if !status.success() {
        return Err(PlayoutError::SubprocessFailure(format!("ffprobe exited with {status}")));
    }
    reader
        .join()
        .map_err(|_| PlayoutError::Internal("ffprobe reader thread panicked".into()))?
        .map_err(PlayoutError::from)
}
