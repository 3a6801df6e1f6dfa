use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, StoreError};
use crate::log::page::PAGE_HEADER_SIZE;

/// Shape of the consolidated multi-version records produced by garbage
/// collection. Chosen per store at open time; a single process serves one
/// layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageLayout {
    /// One self-contained record per key, versions packed back to back.
    Row,
    /// Whole pages of records clustered by key with columnar metadata.
    Column,
}

/// Background garbage collection settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    pub enabled: bool,
    pub interval_ms: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 1_000,
        }
    }
}

impl GcConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

/// Engine configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage_layout: StorageLayout,
    /// Bytes per log page. Must be a power of two.
    pub page_size: usize,
    /// Upper bound handed to the page arena.
    pub total_memory: usize,
    /// Slot count of the per-table key index. Must be a power of two.
    pub hash_capacity: usize,
    pub gc: GcConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_layout: StorageLayout::Row,
            page_size: 2 * 1024 * 1024,
            total_memory: 256 * 1024 * 1024,
            hash_capacity: 1 << 20,
            gc: GcConfig::default(),
        }
    }
}

impl Config {
    pub fn production() -> Self {
        Self {
            storage_layout: StorageLayout::Row,
            page_size: 2 * 1024 * 1024,
            total_memory: 1024 * 1024 * 1024,
            hash_capacity: 1 << 22,
            gc: GcConfig {
                enabled: true,
                interval_ms: 1_000,
            },
        }
    }

    /// Small pages and a disabled background collector so tests can drive
    /// page rollover and GC passes deterministically.
    pub fn testing() -> Self {
        Self {
            storage_layout: StorageLayout::Row,
            page_size: 64 * 1024,
            total_memory: 16 * 1024 * 1024,
            hash_capacity: 1 << 12,
            gc: GcConfig {
                enabled: false,
                interval_ms: 50,
            },
        }
    }

    pub fn benchmark() -> Self {
        Self {
            storage_layout: StorageLayout::Row,
            page_size: 2 * 1024 * 1024,
            total_memory: 512 * 1024 * 1024,
            hash_capacity: 1 << 21,
            gc: GcConfig {
                enabled: false,
                interval_ms: 1_000,
            },
        }
    }

    pub fn with_layout(mut self, layout: StorageLayout) -> Self {
        self.storage_layout = layout;
        self
    }

    /// Largest entry (header included) a single page can hold.
    pub fn max_entry_size(&self) -> usize {
        self.page_size - PAGE_HEADER_SIZE
    }

    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two() || self.page_size < 4096 {
            return Err(StoreError::InvalidConfig(format!(
                "page_size must be a power of two of at least 4096, got {}",
                self.page_size
            )));
        }
        if self.page_size > u32::MAX as usize / 2 {
            return Err(StoreError::InvalidConfig(format!(
                "page_size {} does not fit the page offset word",
                self.page_size
            )));
        }
        if self.total_memory < self.page_size {
            return Err(StoreError::InvalidConfig(format!(
                "total_memory {} is smaller than a single page of {}",
                self.total_memory, self.page_size
            )));
        }
        if !self.hash_capacity.is_power_of_two() || self.hash_capacity < 16 {
            return Err(StoreError::InvalidConfig(format!(
                "hash_capacity must be a power of two of at least 16, got {}",
                self.hash_capacity
            )));
        }
        Ok(())
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(raw).map_err(|err| StoreError::ConfigParse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}
