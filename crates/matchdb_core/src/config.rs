//! Cache and store configuration.

/// Configuration shared by the object cache and the stores attached to it.
#[derive(Debug, Clone)]
pub struct Config {
    /// Rows per committed sub-batch in bulk writes.
    pub batch_size: usize,

    /// Object keys at or above this length are replaced by a synthetic
    /// long-key identifier.
    pub max_key_length: usize,

    /// Table names at or above this length are replaced by a synthetic
    /// long-table identifier.
    pub max_table_name_length: usize,

    /// Whether eviction is driven by memory pressure rather than a fixed
    /// entry count.
    pub automated_memory_management: bool,

    /// Share of heap usage at which the automated policy starts evicting.
    pub memory_share: f64,

    /// Maximum number of cached entries under the fixed-capacity policy.
    pub cache_size: usize,

    /// Read-only stores never trigger eviction on `put`.
    pub read_only: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            batch_size: matchdb_storage::DEFAULT_BATCH_SIZE,
            max_key_length: 1000,
            max_table_name_length: 128,
            automated_memory_management: true,
            memory_share: 0.8,
            cache_size: 25_000,
            read_only: false,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the rows per committed sub-batch.
    #[must_use]
    pub const fn batch_size(mut self, value: usize) -> Self {
        self.batch_size = value;
        self
    }

    /// Sets the long-key length threshold.
    #[must_use]
    pub const fn max_key_length(mut self, value: usize) -> Self {
        self.max_key_length = value;
        self
    }

    /// Sets the long-table-name length threshold.
    #[must_use]
    pub const fn max_table_name_length(mut self, value: usize) -> Self {
        self.max_table_name_length = value;
        self
    }

    /// Selects between memory-pressure-driven and fixed-capacity eviction.
    #[must_use]
    pub const fn automated_memory_management(mut self, value: bool) -> Self {
        self.automated_memory_management = value;
        self
    }

    /// Sets the heap-usage share that triggers automated eviction.
    #[must_use]
    pub fn memory_share(mut self, value: f64) -> Self {
        self.memory_share = value;
        self
    }

    /// Sets the entry capacity for the fixed-capacity policy.
    #[must_use]
    pub const fn cache_size(mut self, value: usize) -> Self {
        self.cache_size = value;
        self
    }

    /// Marks the cache as read-only.
    #[must_use]
    pub const fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.max_key_length, 1000);
        assert!(config.automated_memory_management);
        assert!(!config.read_only);
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .automated_memory_management(false)
            .cache_size(4)
            .max_key_length(10);

        assert!(!config.automated_memory_management);
        assert_eq!(config.cache_size, 4);
        assert_eq!(config.max_key_length, 10);
    }
}
