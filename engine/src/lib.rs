//! channelcast engine: a single-channel linear TV playout service.
//!
//! Files are cataloged in SQLite, queued or scheduled, and fed one at a time
//! into a long-lived ffmpeg process that writes a rolling HLS window.

pub mod api;
pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod feeder;
pub mod history;
pub mod hub;
pub mod library;
pub mod player;
pub mod probe;
pub mod queue;
pub mod schedule;
