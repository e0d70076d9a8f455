use std::time::Duration;

/// Configuration for an emberdb store.
#[derive(Debug, Clone)]
pub struct Options {
    /// Raw write buffer size before the sync engine flushes mid-drain (default: 4MB)
    pub buffer_size: usize,

    /// Target size for the shared buffer pool (default: 16MB)
    pub pool_target_size: usize,

    /// How often the background syncer drains sealed time buckets (default: 1s).
    /// Zero disables the background syncer; callers must invoke `Db::sync`.
    pub background_sync_interval: Duration,

    /// Whether the background expirer runs (default: true)
    pub background_key_expiry: bool,

    /// Multiplier on one minute for the expirer interval (default: 1)
    pub key_expiration_max_dur: u32,

    /// Default number of records returned by a query (default: 1024)
    pub default_query_limit: usize,

    /// Maximum number of log blocks the WAL may occupy (default: 16384, 64MB)
    pub max_log_blocks: u32,

    /// Time bucket granularity; new seqs accumulate per bucket (default: 1s)
    pub block_duration: Duration,

    /// Log pool configuration
    pub log_pool: LogPoolOptions,
}

/// Configuration for the tiny-log commit pool.
#[derive(Debug, Clone)]
pub struct LogPoolOptions {
    /// Interval at which buffered writes are offered to the pool (default: 100ms)
    pub write_interval: Duration,

    /// How long an idle dispatcher sleeps when the log queue is full (default: 2s)
    pub timeout: Duration,

    /// Capacity of the log queue feeding committers (default: 27)
    pub pool_capacity: usize,

    /// Number of committer threads draining the log queue (default: 1)
    pub log_count: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            buffer_size: 4 * 1024 * 1024,
            pool_target_size: 16 * 1024 * 1024,
            background_sync_interval: Duration::from_secs(1),
            background_key_expiry: true,
            key_expiration_max_dur: 1,
            default_query_limit: 1024,
            max_log_blocks: 16384,
            block_duration: Duration::from_secs(1),
            log_pool: LogPoolOptions::default(),
        }
    }
}

impl Default for LogPoolOptions {
    fn default() -> Self {
        Self {
            write_interval: Duration::from_millis(100),
            timeout: Duration::from_secs(2),
            pool_capacity: 27,
            log_count: 1,
        }
    }
}

impl Options {
    /// Set the sync engine's raw buffer threshold
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Set the background sync interval; zero disables the syncer
    pub fn background_sync_interval(mut self, interval: Duration) -> Self {
        self.background_sync_interval = interval;
        self
    }

    /// Enable or disable the background expirer
    pub fn background_key_expiry(mut self, enabled: bool) -> Self {
        self.background_key_expiry = enabled;
        self
    }

    /// Set the default query limit
    pub fn default_query_limit(mut self, limit: usize) -> Self {
        self.default_query_limit = limit;
        self
    }

    /// Set the time bucket granularity
    pub fn block_duration(mut self, dur: Duration) -> Self {
        self.block_duration = dur;
        self
    }

    /// Set the WAL block budget
    pub fn max_log_blocks(mut self, blocks: u32) -> Self {
        self.max_log_blocks = blocks;
        self
    }

    /// Configure the log pool
    pub fn log_pool(mut self, opts: LogPoolOptions) -> Self {
        self.log_pool = opts;
        self
    }
}

impl LogPoolOptions {
    /// Set the write offer interval
    pub fn write_interval(mut self, interval: Duration) -> Self {
        self.write_interval = interval;
        self
    }

    /// Set the idle dispatcher sleep
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the log queue capacity
    pub fn pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity.max(1);
        self
    }

    /// Set the number of committer threads
    pub fn log_count(mut self, count: usize) -> Self {
        self.log_count = count.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = Options::default();
        assert_eq!(opts.background_sync_interval, Duration::from_secs(1));
        assert_eq!(opts.block_duration, Duration::from_secs(1));
        assert_eq!(opts.default_query_limit, 1024);
        assert_eq!(opts.log_pool.pool_capacity, 27);
        assert_eq!(opts.log_pool.log_count, 1);
    }

    #[test]
    fn test_options_builder() {
        let opts = Options::default()
            .buffer_size(1 << 20)
            .background_sync_interval(Duration::from_millis(250))
            .background_key_expiry(false)
            .log_pool(
                LogPoolOptions::default()
                    .pool_capacity(4)
                    .log_count(2)
                    .timeout(Duration::from_millis(500)),
            );

        assert_eq!(opts.buffer_size, 1 << 20);
        assert_eq!(opts.background_sync_interval, Duration::from_millis(250));
        assert!(!opts.background_key_expiry);
        assert_eq!(opts.log_pool.pool_capacity, 4);
        assert_eq!(opts.log_pool.log_count, 2);
    }
}
