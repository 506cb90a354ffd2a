/// Runtime parameters
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Config {
    /// Usable stack size of every spawned coroutine, rounded up to whole pages
    pub stack_size: usize,
    /// Maximum number of coroutines alive at once, the main one included
    pub capacity: usize,
    /// Abort with a diagnostic when no coroutine is runnable, instead of
    /// scanning the ready list forever
    pub detect_deadlock: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stack_size: ucontext::Stack::DEFAULT_SIZE,
            capacity: 1024,
            detect_deadlock: true,
        }
    }
}

impl Config {
    pub fn stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn detect_deadlock(mut self, detect_deadlock: bool) -> Self {
        self.detect_deadlock = detect_deadlock;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.stack_size, 64 * 1024);
        assert_eq!(config.capacity, 1024);
        assert!(config.detect_deadlock);

        let config = config.stack_size(128 * 1024).capacity(8).detect_deadlock(false);
        assert_eq!(config.stack_size, 128 * 1024);
        assert_eq!(config.capacity, 8);
        assert!(!config.detect_deadlock);
    }
}
