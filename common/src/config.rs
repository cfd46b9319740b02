//! Configuration types for runtime and execution settings

use std::time::Duration;

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Throttling configuration for resource control
#[derive(Debug, Clone, Copy, Default)]
pub struct ThrottleConfig {
    /// Maximum number of concurrently open local files (0 = no limit)
    pub max_open_files: usize,
    /// Storage requests per second (0 = no throttle)
    pub ops_throttle: usize,
    /// Transferred chunks per second (0 = no throttle)
    pub iops_throttle: usize,
    /// Chunk size used to count transferred chunks (bytes)
    pub chunk_size: u64,
}

impl ThrottleConfig {
    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), String> {
        if self.iops_throttle > 0 && self.chunk_size == 0 {
            return Err("chunk_size must be specified when using iops_throttle".to_string());
        }
        Ok(())
    }

    #[must_use]
    pub fn limits(&self) -> throttle::Limits {
        throttle::Limits {
            max_open_files: self.max_open_files,
            ops_per_second: self.ops_throttle,
            chunks_per_second: self.iops_throttle,
            chunk_size: self.chunk_size,
        }
    }
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress status lines
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end
    pub print_summary: bool,
}

/// Largest number of parts a multipart transfer may be split into.
pub const MAX_PARTS: u64 = 10_000;

/// Transfer engine settings
#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    /// Entries executed concurrently
    pub max_concurrent_requests: usize,
    /// Capacity of the channels between pipeline stages
    pub queue_depth: usize,
    /// Payloads at or above this size use multipart transfers
    pub multipart_threshold: u64,
    /// Size of each part (the last one may be smaller)
    pub multipart_chunksize: u64,
    /// Parts of one entry transferred concurrently
    pub max_part_concurrency: usize,
    /// Attempts per part before the whole transfer is aborted
    pub part_retries: u32,
    /// Backoff before the first retry, doubled on each further attempt
    pub retry_delay: Duration,
    /// How much newer a source must be before it is considered changed
    pub clock_skew: Duration,
    /// Compare sizes only when syncing
    pub size_only: bool,
    /// Follow symlinks when walking local trees
    pub follow_symlinks: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 10,
            queue_depth: 1000,
            multipart_threshold: 8 * 1024 * 1024,
            multipart_chunksize: 8 * 1024 * 1024,
            max_part_concurrency: 4,
            part_retries: 5,
            retry_delay: Duration::from_millis(200),
            clock_skew: Duration::ZERO,
            size_only: false,
            follow_symlinks: true,
        }
    }
}

impl TransferConfig {
    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent_requests == 0 {
            return Err("max_concurrent_requests must be at least 1".to_string());
        }
        if self.queue_depth == 0 {
            return Err("queue_depth must be at least 1".to_string());
        }
        if self.multipart_chunksize == 0 {
            return Err("multipart_chunksize must be greater than 0".to_string());
        }
        if self.max_part_concurrency == 0 {
            return Err("max_part_concurrency must be at least 1".to_string());
        }
        if self.part_retries == 0 {
            return Err("part_retries must be at least 1".to_string());
        }
        Ok(())
    }

    /// Part size for a payload of `size` bytes, raised as needed to stay within [`MAX_PARTS`].
    #[must_use]
    pub fn part_size(&self, size: u64) -> u64 {
        let min_for_limit = size.div_ceil(MAX_PARTS);
        self.multipart_chunksize.max(min_for_limit).max(1)
    }

    #[must_use]
    pub fn use_multipart(&self, size: u64) -> bool {
        size > 0 && size >= self.multipart_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(TransferConfig::default().validate().is_ok());
        assert!(ThrottleConfig::default().validate().is_ok());
    }

    #[test]
    fn invalid_settings() {
        let config = TransferConfig {
            max_concurrent_requests: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let throttle = ThrottleConfig {
            iops_throttle: 10,
            ..Default::default()
        };
        assert!(throttle.validate().is_err());
    }

    #[test]
    fn part_size_is_raised_for_huge_payloads() {
        let config = TransferConfig::default();
        assert_eq!(config.part_size(100), 8 * 1024 * 1024);
        let huge = 8 * 1024 * 1024 * MAX_PARTS * 2;
        assert_eq!(config.part_size(huge), 16 * 1024 * 1024);
        assert!(huge.div_ceil(config.part_size(huge)) <= MAX_PARTS);
    }
}
