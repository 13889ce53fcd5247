//! Configuration types for runtime and execution settings

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end
    pub print_summary: bool,
}

pub const DEFAULT_WORKERS: usize = 8;
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;
pub const DEFAULT_FILE_CONCURRENCY: usize = 4;

/// Settings for a single upload or download operation
#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    /// Number of concurrent chunk writers per file
    pub workers: usize,
    /// Size of a single chunk read from the source (bytes)
    pub buffer_size: usize,
    /// Number of files transferred at once within a directory
    pub file_concurrency: usize,
    /// Compare MD5 digests of both sides after each file
    pub verify: bool,
    /// Render per-file progress bars
    pub progress: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            buffer_size: DEFAULT_BUFFER_SIZE,
            file_concurrency: DEFAULT_FILE_CONCURRENCY,
            verify: true,
            progress: false,
        }
    }
}

impl TransferConfig {
    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), String> {
        if self.workers == 0 {
            return Err("workers must be greater than 0".to_string());
        }
        if self.buffer_size == 0 {
            return Err("buffer size must be greater than 0".to_string());
        }
        if self.file_concurrency == 0 {
            return Err("concurrency must be greater than 0".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = TransferConfig::default();
        assert_eq!(config.workers, 8);
        assert_eq!(config.buffer_size, 32 * 1024);
        assert_eq!(config.file_concurrency, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_values_are_rejected() {
        for config in [
            TransferConfig {
                workers: 0,
                ..Default::default()
            },
            TransferConfig {
                buffer_size: 0,
                ..Default::default()
            },
            TransferConfig {
                file_concurrency: 0,
                ..Default::default()
            },
        ] {
            assert!(config.validate().is_err());
        }
    }
}
