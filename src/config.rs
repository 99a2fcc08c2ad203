//! Runtime configuration.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, SyncError};

/// Default UDP port for presence beacons.
pub const DEFAULT_BROADCAST_PORT: u16 = 5000;

/// Default TCP port for peer sessions.
pub const DEFAULT_LISTEN_PORT: u16 = 6000;

/// Default directory for persisted signatures.
pub const DEFAULT_SIGNATURE_DIR: &str = "/tmp/signatures";

/// Default hard cap on a single frame's compressed payload (64 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: u64 = 64 * 1024 * 1024;

/// Configuration for a sync node.
///
/// Fields are public; construct with [`Config::new`] and override as
/// needed, then [`Config::validate`] runs at startup and is fatal on
/// failure.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory to watch and synchronize. Must exist.
    pub monitored_dir: PathBuf,
    /// Where per-file signatures are persisted. Reset at startup.
    pub signature_dir: PathBuf,
    /// UDP port for presence beacons.
    pub broadcast_port: u16,
    /// TCP port for peer sessions. `0` binds an ephemeral port,
    /// resolved at startup and used in the advertised identity.
    pub listen_port: u16,
    /// Destination address for beacon datagrams.
    pub broadcast_addr: IpAddr,
    /// Identity override for the advertised IP. Defaults to the
    /// detected local address when `None`.
    pub advertise_ip: Option<IpAddr>,
    /// Interval between presence beacons.
    pub beacon_interval: Duration,
    /// Hard cap on a frame's compressed payload size.
    pub max_frame_bytes: u64,
    /// Timeout for outbound TCP dials.
    pub connect_timeout: Duration,
    /// Depth of each session's bounded send queue.
    pub send_queue_depth: usize,
    /// How long an echo-suppression entry survives unconsumed.
    pub ignore_grace: Duration,
    /// Block size for signature generation (power of 2, 512-65536).
    pub block_size: u32,
}

impl Config {
    /// Create a configuration for the given monitored directory with
    /// defaults for everything else.
    #[must_use]
    pub fn new(monitored_dir: impl Into<PathBuf>) -> Self {
        Self {
            monitored_dir: monitored_dir.into(),
            signature_dir: PathBuf::from(DEFAULT_SIGNATURE_DIR),
            broadcast_port: DEFAULT_BROADCAST_PORT,
            listen_port: DEFAULT_LISTEN_PORT,
            broadcast_addr: IpAddr::V4(Ipv4Addr::BROADCAST),
            advertise_ip: None,
            beacon_interval: Duration::from_secs(5),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            connect_timeout: Duration::from_secs(5),
            send_queue_depth: 1024,
            ignore_grace: Duration::from_secs(2),
            block_size: 2048,
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `Config` errors for a missing monitored directory, an
    /// invalid block size, a signature directory nested inside the
    /// monitored root (its files would be synchronized), or zero-sized
    /// limits.
    pub fn validate(&self) -> Result<()> {
        if !self.monitored_dir.is_dir() {
            return Err(SyncError::Config(format!(
                "monitored directory does not exist: {}",
                self.monitored_dir.display()
            )));
        }
        if !self.block_size.is_power_of_two() || !(512..=65536).contains(&self.block_size) {
            return Err(SyncError::Config(format!(
                "block size must be a power of 2 in 512-65536, got {}",
                self.block_size
            )));
        }
        if self.max_frame_bytes == 0 {
            return Err(SyncError::Config("max frame size must be nonzero".into()));
        }
        if self.send_queue_depth == 0 {
            return Err(SyncError::Config("send queue depth must be nonzero".into()));
        }
        if self.beacon_interval.is_zero() {
            return Err(SyncError::Config("beacon interval must be nonzero".into()));
        }
        if self.signature_dir.starts_with(&self.monitored_dir) {
            return Err(SyncError::Config(format!(
                "signature directory {} lies inside the monitored root",
                self.signature_dir.display()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> (tempfile::TempDir, Config) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::new(dir.path());
        config.signature_dir = std::env::temp_dir().join("lansync-test-sigs");
        (dir, config)
    }

    #[test]
    fn defaults() {
        let config = Config::new("/does/not/matter");
        assert_eq!(config.broadcast_port, 5000);
        assert_eq!(config.listen_port, 6000);
        assert_eq!(config.max_frame_bytes, 64 * 1024 * 1024);
        assert_eq!(config.block_size, 2048);
        assert_eq!(config.beacon_interval, Duration::from_secs(5));
    }

    #[test]
    fn validate_ok() {
        let (_dir, config) = valid_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_missing_dir() {
        let config = Config::new("/nonexistent/lansync/root");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("monitored directory"));
    }

    #[test]
    fn validate_bad_block_size() {
        let (_dir, mut config) = valid_config();
        config.block_size = 1000;
        assert!(config.validate().is_err());
        config.block_size = 256;
        assert!(config.validate().is_err());
        config.block_size = 131_072;
        assert!(config.validate().is_err());
        config.block_size = 4096;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_nested_signature_dir() {
        let (dir, mut config) = valid_config();
        config.signature_dir = dir.path().join("sigs");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("inside the monitored root"));
    }

    #[test]
    fn validate_zero_limits() {
        let (_dir, mut config) = valid_config();
        config.max_frame_bytes = 0;
        assert!(config.validate().is_err());

        let (_dir, mut config) = valid_config();
        config.send_queue_depth = 0;
        assert!(config.validate().is_err());
    }
}
