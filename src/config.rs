use tracing::Level;

/// Default sparse index sampling period.
pub const DEFAULT_INDEX_INTERVAL: usize = 1000;

/// Configuration for a database instance.
#[derive(Debug, Clone)]
pub struct Config {
    /// Sparse index sampling period: one index entry is kept for every
    /// `index_interval`-th record (default: 1000). Values below 1 are treated
    /// as 1.
    pub index_interval: usize,

    /// Log level the embedding process should filter at (default: INFO). The
    /// library itself never installs a subscriber.
    pub log_level: Level,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            index_interval: DEFAULT_INDEX_INTERVAL,
            log_level: Level::INFO,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the sparse index sampling period.
    pub fn index_interval(mut self, interval: usize) -> Self {
        self.index_interval = interval;
        self
    }

    /// Set the log level.
    pub fn log_level(mut self, level: Level) -> Self {
        self.log_level = level;
        self
    }
}
