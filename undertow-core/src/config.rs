//! Centralized configuration for Undertow.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::time::Duration;

/// Central configuration for all Undertow components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct UndertowConfig {
    pub torrent: TorrentConfig,
    pub network: NetworkConfig,
    pub limits: SessionLimits,
    pub storage: StorageConfig,
}

/// BitTorrent protocol-specific configuration.
#[derive(Debug, Clone)]
pub struct TorrentConfig {
    /// BitTorrent client identifier prefix (Azureus-style)
    pub client_id: &'static str,
    /// Outstanding block request timeout
    pub request_timeout: Duration,
    /// Idle timeout after which a silent peer connection is closed
    pub peer_idle_timeout: Duration,
    /// Maximum outstanding block requests per peer
    pub request_pipeline_depth: usize,
    /// Concurrent piece-hash verification jobs
    pub verify_workers: usize,
}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            client_id: "-UW0001-",
            request_timeout: Duration::from_secs(30),
            peer_idle_timeout: Duration::from_secs(120),
            request_pipeline_depth: 10,
            verify_workers: 2,
        }
    }
}

/// Network communication and tracker configuration.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// HTTP request timeout for tracker communication
    pub tracker_timeout: Duration,
    /// Minimum announce interval
    pub min_announce_interval: Duration,
    /// Maximum announce interval (tracker-supplied intervals are clamped)
    pub max_announce_interval: Duration,
    /// User agent for HTTP requests
    pub user_agent: &'static str,
    /// TCP port we claim to listen on in announces
    pub listen_port: u16,
    /// Peer connection (dial + handshake) timeout
    pub peer_connect_timeout: Duration,
    /// Policy for peer connection encryption negotiation
    pub encryption: EncryptionPolicy,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            tracker_timeout: Duration::from_secs(30),
            min_announce_interval: Duration::from_secs(300),
            max_announce_interval: Duration::from_secs(3600),
            user_agent: "undertow/0.1.0",
            listen_port: 51413,
            peer_connect_timeout: Duration::from_secs(20),
            encryption: EncryptionPolicy::Prefer,
        }
    }
}

/// Session-wide transfer and queue limits.
///
/// Read by the bandwidth scheduler and session queue; never mutated by
/// transfer logic itself.
#[derive(Debug, Clone)]
pub struct SessionLimits {
    /// Global download cap in bytes per second (None = unlimited)
    pub download_limit: Option<u64>,
    /// Global upload cap in bytes per second (None = unlimited)
    pub upload_limit: Option<u64>,
    /// Alternative download cap, active inside the speed schedule window
    pub alt_download_limit: Option<u64>,
    /// Alternative upload cap, active inside the speed schedule window
    pub alt_upload_limit: Option<u64>,
    /// Weekly window during which the alternative caps substitute the normal ones
    pub alt_speed_schedule: Option<SpeedSchedule>,
    /// Maximum peer connections across all torrents
    pub max_peers_global: usize,
    /// Maximum peer connections per torrent
    pub max_peers_per_torrent: usize,
    /// Maximum torrents simultaneously in the downloading state
    pub max_active_downloads: usize,
    /// Upload slots granted by the choker per torrent
    pub upload_slots: usize,
    /// Stop seeding once uploaded/downloaded reaches this ratio
    pub seed_ratio_limit: Option<f64>,
    /// Stop seeding after this long with no data exchanged
    pub seed_idle_limit: Option<Duration>,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            download_limit: None,
            upload_limit: None,
            alt_download_limit: Some(50 * 1024),
            alt_upload_limit: Some(50 * 1024),
            alt_speed_schedule: None,
            max_peers_global: 200,
            max_peers_per_torrent: 50,
            max_active_downloads: 4,
            upload_slots: 4,
            seed_ratio_limit: None,
            seed_idle_limit: None,
        }
    }
}

/// Peer connection encryption policy.
///
/// `Require` rejects plaintext handshakes outright; `Prefer` negotiates a
/// cipher when the peer offers one and falls back to plaintext otherwise;
/// `Allow` takes whatever the peer speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncryptionPolicy {
    Allow,
    #[default]
    Prefer,
    Require,
}

/// Weekly activation window for the alternative speed limits.
///
/// Days are a bitmask (bit 0 = Monday .. bit 6 = Sunday). Start and end are
/// minutes since local midnight; an end before the start wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeedSchedule {
    pub days: u8,
    pub begin_minute: u16,
    pub end_minute: u16,
}

impl SpeedSchedule {
    pub const EVERY_DAY: u8 = 0b0111_1111;
    pub const WEEKDAYS: u8 = 0b0001_1111;
    pub const WEEKENDS: u8 = 0b0110_0000;

    /// Creates a schedule active on the given days between two
    /// minutes-since-midnight marks.
    pub fn new(days: u8, begin_minute: u16, end_minute: u16) -> Self {
        Self {
            days,
            begin_minute,
            end_minute,
        }
    }

    /// True when the window covers the given weekday and minute-of-day.
    ///
    /// Overnight windows attribute the post-midnight stretch to the day the
    /// window began on.
    pub fn is_active(&self, weekday: chrono::Weekday, minute_of_day: u16) -> bool {
        let day_bit = |d: chrono::Weekday| 1u8 << d.num_days_from_monday();

        if self.begin_minute <= self.end_minute {
            self.days & day_bit(weekday) != 0
                && minute_of_day >= self.begin_minute
                && minute_of_day < self.end_minute
        } else {
            // Wrapped window: active late on the scheduled day or early on the next.
            let late = self.days & day_bit(weekday) != 0 && minute_of_day >= self.begin_minute;
            let early = self.days & day_bit(weekday.pred()) != 0 && minute_of_day < self.end_minute;
            late || early
        }
    }
}

/// File storage and disk I/O configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Directory where downloaded torrent data is written
    pub download_dir: std::path::PathBuf,
    /// Buffer size for file operations
    pub file_buffer_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            download_dir: std::path::PathBuf::from("downloads"),
            file_buffer_size: 65536,
        }
    }
}

impl UndertowConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(timeout) = std::env::var("UNDERTOW_TRACKER_TIMEOUT") {
            if let Ok(seconds) = timeout.parse::<u64>() {
                config.network.tracker_timeout = Duration::from_secs(seconds);
            }
        }

        if let Ok(max_peers) = std::env::var("UNDERTOW_MAX_PEERS") {
            if let Ok(count) = max_peers.parse::<usize>() {
                config.limits.max_peers_global = count;
            }
        }

        if let Ok(max_active) = std::env::var("UNDERTOW_MAX_ACTIVE_DOWNLOADS") {
            if let Ok(count) = max_active.parse::<usize>() {
                config.limits.max_active_downloads = count;
            }
        }

        if let Ok(dir) = std::env::var("UNDERTOW_DOWNLOAD_DIR") {
            config.storage.download_dir = std::path::PathBuf::from(dir);
        }

        if let Ok(policy) = std::env::var("UNDERTOW_ENCRYPTION") {
            config.network.encryption = match policy.to_lowercase().as_str() {
                "allow" => EncryptionPolicy::Allow,
                "require" => EncryptionPolicy::Require,
                _ => EncryptionPolicy::Prefer,
            };
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use chrono::Weekday;

    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = UndertowConfig::default();

        assert_eq!(config.torrent.client_id, "-UW0001-");
        assert_eq!(config.limits.max_peers_per_torrent, 50);
        assert_eq!(config.limits.max_active_downloads, 4);
        assert_eq!(config.network.tracker_timeout, Duration::from_secs(30));
        assert_eq!(config.network.encryption, EncryptionPolicy::Prefer);
        assert!(config.limits.download_limit.is_none());
    }

    #[test]
    fn test_schedule_plain_window() {
        // Weekdays 09:00-17:30
        let schedule = SpeedSchedule::new(SpeedSchedule::WEEKDAYS, 540, 1050);

        assert!(schedule.is_active(Weekday::Mon, 540));
        assert!(schedule.is_active(Weekday::Fri, 1049));
        assert!(!schedule.is_active(Weekday::Mon, 1050));
        assert!(!schedule.is_active(Weekday::Sat, 600));
        assert!(!schedule.is_active(Weekday::Mon, 539));
    }

    #[test]
    fn test_schedule_overnight_wrap() {
        // Every day 23:00-06:00
        let schedule = SpeedSchedule::new(SpeedSchedule::EVERY_DAY, 1380, 360);

        assert!(schedule.is_active(Weekday::Tue, 1380));
        assert!(schedule.is_active(Weekday::Wed, 0));
        assert!(schedule.is_active(Weekday::Wed, 359));
        assert!(!schedule.is_active(Weekday::Wed, 360));
        assert!(!schedule.is_active(Weekday::Wed, 720));
    }

    #[test]
    fn test_schedule_overnight_day_attribution() {
        // Saturday only, 22:00-02:00: Sunday 01:00 belongs to Saturday's window.
        let schedule = SpeedSchedule::new(SpeedSchedule::WEEKENDS & 0b0010_0000, 1320, 120);

        assert!(schedule.is_active(Weekday::Sat, 1330));
        assert!(schedule.is_active(Weekday::Sun, 60));
        assert!(!schedule.is_active(Weekday::Mon, 60));
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("UNDERTOW_TRACKER_TIMEOUT", "60");
            std::env::set_var("UNDERTOW_MAX_PEERS", "100");
            std::env::set_var("UNDERTOW_ENCRYPTION", "require");
        }

        let config = UndertowConfig::from_env();

        assert_eq!(config.network.tracker_timeout, Duration::from_secs(60));
        assert_eq!(config.limits.max_peers_global, 100);
        assert_eq!(config.network.encryption, EncryptionPolicy::Require);

        unsafe {
            std::env::remove_var("UNDERTOW_TRACKER_TIMEOUT");
            std::env::remove_var("UNDERTOW_MAX_PEERS");
            std::env::remove_var("UNDERTOW_ENCRYPTION");
        }
    }
}
