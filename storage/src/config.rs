use std::{num::NonZeroUsize, time::Duration};

use crate::replacer::ReplacerKind;

/// Settings of a [`crate::buffer_pool::BufferPoolManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferPoolConfig {
    /// Number of frames in the pool.
    pub pool_size: NonZeroUsize,
    /// Policy used for choosing eviction victims.
    pub replacer: ReplacerKind,
    /// How often the background flusher writes dirty pages back.
    pub flush_interval: Duration,
}

impl BufferPoolConfig {
    const DEFAULT_POOL_SIZE: NonZeroUsize = NonZeroUsize::new(64).unwrap();
    const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

    pub fn with_pool_size(mut self, pool_size: NonZeroUsize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_replacer(mut self, replacer: ReplacerKind) -> Self {
        self.replacer = replacer;
        self
    }

    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            pool_size: Self::DEFAULT_POOL_SIZE,
            replacer: ReplacerKind::default(),
            flush_interval: Self::DEFAULT_FLUSH_INTERVAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_pool_config_defaults_and_overrides() {
        let config = BufferPoolConfig::default();
        assert_eq!(config.pool_size.get(), 64);
        assert_eq!(config.replacer, ReplacerKind::Lru);
        assert_eq!(config.flush_interval, Duration::from_secs(1));

        let config = config
            .with_pool_size(NonZeroUsize::new(3).unwrap())
            .with_replacer(ReplacerKind::Clock)
            .with_flush_interval(Duration::from_millis(10));
        assert_eq!(config.pool_size.get(), 3);
        assert_eq!(config.replacer, ReplacerKind::Clock);
        assert_eq!(config.flush_interval, Duration::from_millis(10));
    }
}
