use crate::transactions::lock::DEFAULT_LOCK_TIMEOUT;
use std::time::Duration;

pub const DEFAULT_CONCURRENCY_LEVEL: usize = 1000;

/// How keys are mapped to locks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContainerType {
    /// One lock per live key.
    PerKey,
    /// `concurrency_level` locks shared by all keys.
    Striped { concurrency_level: usize },
}

impl Default for ContainerType {
    fn default() -> Self {
        ContainerType::PerKey
    }
}

#[derive(Clone, Debug)]
pub struct LockManagerOptions {
    pub container_type: ContainerType,
    /// Used by `lock_default` and `lock_all_default`.
    pub default_timeout: Duration,
}

impl Default for LockManagerOptions {
    fn default() -> Self {
        LockManagerOptions {
            container_type: ContainerType::default(),
            default_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

impl LockManagerOptions {
    pub fn striped(concurrency_level: usize) -> LockManagerOptions {
        LockManagerOptions {
            container_type: ContainerType::Striped { concurrency_level },
            ..LockManagerOptions::default()
        }
    }

    pub fn default_timeout(mut self, timeout: Duration) -> LockManagerOptions {
        self.default_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use crate::options::{ContainerType, LockManagerOptions, DEFAULT_CONCURRENCY_LEVEL};
    use std::time::Duration;

    #[test]
    fn test_options() {
        let options = LockManagerOptions::default();
        assert_eq!(ContainerType::PerKey, options.container_type);
        assert_eq!(Duration::from_secs(10), options.default_timeout);

        let options = LockManagerOptions::striped(DEFAULT_CONCURRENCY_LEVEL)
            .default_timeout(Duration::from_millis(5));
        assert_eq!(
            ContainerType::Striped {
                concurrency_level: 1000
            },
            options.container_type
        );
        assert_eq!(Duration::from_millis(5), options.default_timeout);
    }
}
