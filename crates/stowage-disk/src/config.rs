//! Configuration for the disk backend
//!
//! Provides device-class presets and builders for custom limits.

use serde::{Deserialize, Serialize};

/// Disk backend configuration with device-class presets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskConfig {
    /// Total log bytes on disk before writes report quota exhaustion
    pub capacity_bytes: u64,
    /// Log file rotation threshold (bytes)
    pub rotation_size_bytes: u64,
    /// Compaction trigger: compact when the dead-record ratio reaches this
    pub compaction_trigger_ratio: f64,
    /// Sync every append to persistent media before acknowledging it
    pub durable_writes: bool,
    /// Maximum key size in bytes
    pub max_key_size: usize,
    /// Maximum encoded value size in bytes
    pub max_value_size: usize,
}

impl DiskConfig {
    /// Desktop-class: plenty of disk, every write synced
    pub fn desktop() -> Self {
        Self {
            capacity_bytes: 1024 * 1024 * 1024,
            rotation_size_bytes: 64 * 1024 * 1024,
            compaction_trigger_ratio: 0.5,
            durable_writes: true,
            max_key_size: 1024,
            max_value_size: 32 * 1024 * 1024,
        }
    }

    /// Phone-class: app sandbox with a modest storage budget
    pub fn mobile() -> Self {
        Self {
            capacity_bytes: 256 * 1024 * 1024,
            rotation_size_bytes: 16 * 1024 * 1024,
            compaction_trigger_ratio: 0.4,
            durable_writes: true,
            max_key_size: 1024,
            max_value_size: 16 * 1024 * 1024,
        }
    }

    /// Constrained devices: small budget, writes reach the page cache only
    pub fn constrained() -> Self {
        Self {
            capacity_bytes: 32 * 1024 * 1024,
            rotation_size_bytes: 4 * 1024 * 1024,
            compaction_trigger_ratio: 0.3,
            durable_writes: false,
            max_key_size: 512,
            max_value_size: 4 * 1024 * 1024,
        }
    }

    pub fn with_capacity(mut self, capacity_bytes: u64) -> Self {
        self.capacity_bytes = capacity_bytes;
        self
    }

    pub fn with_rotation_size(mut self, rotation_size_bytes: u64) -> Self {
        self.rotation_size_bytes = rotation_size_bytes;
        self
    }

    pub fn with_compaction_trigger(mut self, ratio: f64) -> Self {
        self.compaction_trigger_ratio = ratio;
        self
    }

    pub fn with_durable_writes(mut self, durable: bool) -> Self {
        self.durable_writes = durable;
        self
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.capacity_bytes == 0 {
            return Err("capacity_bytes must be > 0".into());
        }
        if self.rotation_size_bytes < 1024 {
            return Err("rotation_size_bytes must be >= 1KB".into());
        }
        if self.compaction_trigger_ratio <= 0.0 || self.compaction_trigger_ratio >= 1.0 {
            return Err("compaction_trigger_ratio must be in (0.0, 1.0)".into());
        }
        if self.max_key_size == 0 || self.max_key_size > u16::MAX as usize {
            return Err("max_key_size must be in [1, 65535]".into());
        }
        if self.max_value_size == 0 || self.max_value_size > 128 * 1024 * 1024 {
            return Err("max_value_size must be in [1, 128MB]".into());
        }
        Ok(())
    }
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self::desktop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_presets_valid() {
        assert!(DiskConfig::desktop().validate().is_ok());
        assert!(DiskConfig::mobile().validate().is_ok());
        assert!(DiskConfig::constrained().validate().is_ok());
    }

    #[test]
    fn test_tier_ordering() {
        let d = DiskConfig::desktop();
        let m = DiskConfig::mobile();
        let c = DiskConfig::constrained();
        assert!(d.capacity_bytes > m.capacity_bytes);
        assert!(m.capacity_bytes > c.capacity_bytes);
        assert!(d.rotation_size_bytes > c.rotation_size_bytes);
    }

    #[test]
    fn test_validation_failures() {
        assert!(DiskConfig::default().with_capacity(0).validate().is_err());
        assert!(DiskConfig::default().with_rotation_size(512).validate().is_err());
        assert!(DiskConfig::default().with_compaction_trigger(1.0).validate().is_err());
        assert!(DiskConfig::default().with_compaction_trigger(0.0).validate().is_err());
    }
}
