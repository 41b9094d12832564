//! Tracker communication: HTTP announce/scrape client and the per-tier
//! scheduling state machine (retry, backoff, backup rotation).

pub mod client;
pub mod schedule;
pub mod types;

pub use client::HttpTrackerClient;
pub use schedule::{TrackerSnapshot, TrackerStatus, TrackerTier, MAX_CONSECUTIVE_TIMEOUTS};
pub use types::{
    AnnounceEvent, AnnounceRequest, AnnounceResponse, ScrapeRequest, ScrapeResponse, ScrapeStats,
    TrackerClient,
};
