// --- Configuration -------------------------------------------------------------
//
// Everything comes from the environment, read once at startup. Bad numeric
// values fall back to the default with a warning rather than refusing to boot.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::feeder::{FeederConfig, HlsOutput};

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub bind: SocketAddr,
    pub ffmpeg: String,
    pub ffprobe: String,
    pub output_dir: PathBuf,
    pub video_dir: Option<PathBuf>,
    pub hls_segment_secs: u32,
    pub hls_list_size: u32,
    pub feed_deadline: Duration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let bind: SocketAddr = var("CHANNELCAST_BIND", "127.0.0.1:8080").parse()?;

        Ok(Self {
            db_path: PathBuf::from(var("CHANNELCAST_DB_PATH", "./data/channelcast.db")),
            bind,
            ffmpeg: var("CHANNELCAST_FFMPEG", "ffmpeg"),
            ffprobe: var("CHANNELCAST_FFPROBE", "ffprobe"),
            output_dir: PathBuf::from(var("CHANNELCAST_OUTPUT_DIR", "./out")),
            video_dir: lookup("CHANNELCAST_VIDEO_DIR")
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
            hls_segment_secs: numeric(&lookup, "CHANNELCAST_HLS_SEGMENT_SECS", 6),
            hls_list_size: numeric(&lookup, "CHANNELCAST_HLS_LIST_SIZE", 10),
            feed_deadline: Duration::from_secs(numeric(&lookup, "CHANNELCAST_FEED_DEADLINE_SECS", 300)),
        })
    }

    pub fn feeder(&self) -> FeederConfig {
        FeederConfig::hls(
            &self.ffmpeg,
            HlsOutput {
                dir: self.output_dir.clone(),
                segment_secs: self.hls_segment_secs,
                list_size: self.hls_list_size,
            },
            self.feed_deadline,
        )
    }
}

fn numeric<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: std::str::FromStr + PartialOrd + Default + Copy + std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(v) if v > T::default() => v,
        _ => {
            warn!("{key}={raw:?} is not a positive number; using {default}");
            default
        }
    }
}
