//! Lookup structure configuration.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::table::format::{MAX_BASE, MAX_DIRECT_BITS, MIN_DIRECT_BITS};
use crate::{Error, Result};

/// Default number of direct-table index bits.
pub const DEFAULT_DIRECT_BITS: u8 = 20;

/// Default range table size, in 32-bit words.
pub const DEFAULT_RANGE_CAPACITY: usize = MAX_BASE as usize + 1;

/// Default interval between asynchronous batches.
pub const DEFAULT_BATCH_INTERVAL: Duration = Duration::from_millis(100);

/// Configuration for a [`Dxr`](crate::Dxr) instance.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address bits consumed by the direct table (size/latency trade-off).
    pub direct_bits: u8,
    /// Range table capacity in 32-bit words.
    pub range_capacity: usize,
    /// Batch rebuilds on a timer instead of after every notification.
    pub async_mode: bool,
    /// Minimum time between asynchronous batches.
    #[serde(with = "millis", rename = "batch_interval_ms")]
    pub batch_interval: Duration,
    /// Compact once and retry before reporting exhaustion.
    pub compact_on_exhaustion: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            direct_bits: DEFAULT_DIRECT_BITS,
            range_capacity: DEFAULT_RANGE_CAPACITY,
            async_mode: false,
            batch_interval: DEFAULT_BATCH_INTERVAL,
            compact_on_exhaustion: true,
        }
    }
}

impl Config {
    /// Small direct table (256 KiB); more slots need range lookups.
    pub fn compact() -> Self {
        Self {
            direct_bits: 16,
            ..Self::default()
        }
    }

    /// Large direct table (4 MiB); most lookups resolve in one access.
    pub fn fast() -> Self {
        Self {
            direct_bits: 20,
            ..Self::default()
        }
    }

    /// Set the number of direct-table bits.
    pub fn with_direct_bits(mut self, bits: u8) -> Self {
        self.direct_bits = bits;
        self
    }

    /// Set the range table capacity in words.
    pub fn with_range_capacity(mut self, words: usize) -> Self {
        self.range_capacity = words;
        self
    }

    /// Enable batched rebuilds driven by [`Dxr::poll`](crate::Dxr::poll).
    pub fn with_async(mut self, interval: Duration) -> Self {
        self.async_mode = true;
        self.batch_interval = interval;
        self
    }

    /// Enable or disable compaction on allocation failure.
    pub fn with_compact_on_exhaustion(mut self, enabled: bool) -> Self {
        self.compact_on_exhaustion = enabled;
        self
    }

    /// Load a configuration from a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a YAML file.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// Number of direct-table slots.
    pub fn slot_count(&self) -> usize {
        1usize << self.direct_bits
    }

    /// Validate all configuration parameters.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_DIRECT_BITS..=MAX_DIRECT_BITS).contains(&self.direct_bits) {
            return Err(Error::InvalidConfig(format!(
                "direct_bits must be in {}..={}, got {}",
                MIN_DIRECT_BITS, MAX_DIRECT_BITS, self.direct_bits
            )));
        }
        if self.range_capacity == 0 || self.range_capacity > MAX_BASE as usize + 1 {
            return Err(Error::InvalidConfig(format!(
                "range_capacity must be in 1..={}, got {}",
                MAX_BASE as usize + 1,
                self.range_capacity
            )));
        }
        if self.async_mode && self.batch_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "batch_interval must be > 0 in async mode".into(),
            ));
        }
        Ok(())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
