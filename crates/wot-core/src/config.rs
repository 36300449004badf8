//! Engine configuration.
//!
//! # Example
//!
//! ```
//! use wot_core::config::WotConfig;
//! use std::time::Duration;
//!
//! // Defaults
//! let config = WotConfig::default();
//!
//! // Or customize via the builder
//! let config = WotConfig::builder()
//!     .with_in_memory_storage()
//!     .with_slow_download_slots(8)
//!     .with_score_verification_interval(Duration::from_secs(24 * 3600))
//!     .build();
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Default interval between full score verifications (28 days).
const DEFAULT_VERIFICATION_INTERVAL: Duration = Duration::from_secs(28 * 24 * 3600);

/// Default interval between store defragmentations (7 days).
const DEFAULT_DEFRAG_INTERVAL: Duration = Duration::from_secs(7 * 24 * 3600);

/// Default number of concurrent slow-downloader requests.
const DEFAULT_SLOW_DOWNLOAD_SLOTS: usize = 4;

/// Default backoff between fast-downloader retries.
const DEFAULT_FAST_RETRY_BACKOFF: Duration = Duration::from_secs(30);

/// Main engine configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WotConfig {
    /// Storage configuration.
    pub storage: StorageConfig,

    /// Score-engine configuration.
    pub scoring: ScoringConfig,

    /// Downloader configuration.
    pub download: DownloadConfig,

    /// Maintenance-job configuration.
    pub maintenance: MaintenanceConfig,
}

impl WotConfig {
    /// Create a configuration builder.
    #[must_use]
    pub fn builder() -> WotConfigBuilder {
        WotConfigBuilder::new()
    }

    /// Create a configuration for in-memory operation (useful for testing).
    #[must_use]
    pub fn in_memory() -> Self {
        WotConfigBuilder::new().with_in_memory_storage().build()
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidParameter`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if !self.storage.in_memory && self.storage.data_dir.as_os_str().is_empty() {
            return Err(CoreError::invalid(
                "storage.data_dir must not be empty when not using in-memory storage",
            ));
        }
        if self.download.slow_download_slots == 0 {
            return Err(CoreError::invalid(
                "download.slow_download_slots must be greater than zero",
            ));
        }
        if self.maintenance.score_verification_interval.is_zero() {
            return Err(CoreError::invalid(
                "maintenance.score_verification_interval must be greater than zero",
            ));
        }
        if self.maintenance.defrag_interval.is_zero() {
            return Err(CoreError::invalid(
                "maintenance.defrag_interval must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Where and how the graph store keeps its data.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the store and the maintenance sidecar file.
    pub data_dir: PathBuf,

    /// Keep everything in memory instead (testing).
    pub in_memory: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            data_dir: PathBuf::from("wot-data"),
            in_memory: false,
        }
    }
}

/// Score-engine settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Run the pre-incremental reference algorithm after every change
    /// instead of the incremental one. Only useful for A/B validation.
    pub legacy_reference_scoring: bool,

    /// Worklist steps the incremental update may take before it gives up
    /// and falls back to a full recomputation for the affected owner.
    pub incremental_step_limit: usize,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        ScoringConfig {
            legacy_reference_scoring: false,
            incremental_step_limit: 250_000,
        }
    }
}

/// Downloader settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Concurrent one-shot requests of the slow downloader.
    pub slow_download_slots: usize,

    /// Backoff between fast-downloader subscription retries.
    pub fast_retry_backoff: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        DownloadConfig {
            slow_download_slots: DEFAULT_SLOW_DOWNLOAD_SLOTS,
            fast_retry_backoff: DEFAULT_FAST_RETRY_BACKOFF,
        }
    }
}

/// Maintenance-job settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Interval between full score verifications.
    pub score_verification_interval: Duration,

    /// Interval between store defragmentations.
    pub defrag_interval: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        MaintenanceConfig {
            score_verification_interval: DEFAULT_VERIFICATION_INTERVAL,
            defrag_interval: DEFAULT_DEFRAG_INTERVAL,
        }
    }
}

impl ScoringConfig {
    /// Minimum source capacity for an edition hint to be accepted.
    ///
    /// The strict implementation requires capacity ≥ 1; the legacy
    /// reference path accepted hints from any source with a positive
    /// score, which corresponds to a threshold of 0 here.
    #[must_use]
    pub fn min_hint_capacity(&self) -> u8 {
        if self.legacy_reference_scoring {
            0
        } else {
            1
        }
    }
}

/// Builder for [`WotConfig`].
#[derive(Clone, Debug, Default)]
pub struct WotConfigBuilder {
    config: WotConfig,
}

impl WotConfigBuilder {
    /// Start from the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the data directory.
    #[must_use]
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.storage.data_dir = dir.into();
        self.config.storage.in_memory = false;
        self
    }

    /// Use in-memory storage.
    #[must_use]
    pub fn with_in_memory_storage(mut self) -> Self {
        self.config.storage.in_memory = true;
        self
    }

    /// Enable the legacy reference scoring path.
    #[must_use]
    pub fn with_legacy_reference_scoring(mut self) -> Self {
        self.config.scoring.legacy_reference_scoring = true;
        self
    }

    /// Set the number of concurrent slow-downloader requests.
    #[must_use]
    pub fn with_slow_download_slots(mut self, slots: usize) -> Self {
        self.config.download.slow_download_slots = slots;
        self
    }

    /// Set the full-verification interval.
    #[must_use]
    pub fn with_score_verification_interval(mut self, interval: Duration) -> Self {
        self.config.maintenance.score_verification_interval = interval;
        self
    }

    /// Set the defragmentation interval.
    #[must_use]
    pub fn with_defrag_interval(mut self, interval: Duration) -> Self {
        self.config.maintenance.defrag_interval = interval;
        self
    }

    /// Build the configuration without validating it.
    #[must_use]
    pub fn build(self) -> WotConfig {
        self.config
    }

    /// Build and validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidParameter`] naming the offending field.
    pub fn try_build(self) -> Result<WotConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
