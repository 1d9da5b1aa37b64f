//! Retry policies around the secure key provider.

use rand::Rng;
use std::time::Duration;

/// How long to wait before the next attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDelay {
    /// Always the same delay
    Fixed(Duration),
    /// Uniformly random in `0..=max`
    Jittered { max: Duration },
}

/// A bounded retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before each retry
    pub delay: RetryDelay,
    /// Whether the cached provider handle is dropped before retrying
    pub reload_handle: bool,
}

impl RetryPolicy {
    /// Lookup retry: fixed delay, forces a handle reload, once.
    pub fn lookup(delay: Duration) -> Self {
        Self {
            max_retries: 1,
            delay: RetryDelay::Fixed(delay),
            reload_handle: true,
        }
    }

    /// Operation retry: random delay up to `max_delay`, no reload, once.
    pub fn operation(max_delay: Duration) -> Self {
        Self {
            max_retries: 1,
            delay: RetryDelay::Jittered { max: max_delay },
            reload_handle: false,
        }
    }

    /// Whether another attempt is allowed after `retries_done` retries
    pub fn allows(&self, retries_done: u32) -> bool {
        retries_done < self.max_retries
    }

    /// Delay to sleep before the next attempt
    pub fn next_delay(&self) -> Duration {
        match self.delay {
            RetryDelay::Fixed(d) => d,
            RetryDelay::Jittered { max } => {
                let max_ms = max.as_millis() as u64;
                if max_ms == 0 {
                    Duration::ZERO
                } else {
                    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_policy() {
        let policy = RetryPolicy::lookup(Duration::from_millis(100));
        assert!(policy.reload_handle);
        assert!(policy.allows(0));
        assert!(!policy.allows(1));
        assert_eq!(policy.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_operation_policy_jitter_bounded() {
        let policy = RetryPolicy::operation(Duration::from_millis(500));
        assert!(!policy.reload_handle);
        assert!(policy.allows(0));
        assert!(!policy.allows(1));
        for _ in 0..100 {
            assert!(policy.next_delay() <= Duration::from_millis(500));
        }
    }

    #[test]
    fn test_zero_jitter() {
        let policy = RetryPolicy::operation(Duration::ZERO);
        assert_eq!(policy.next_delay(), Duration::ZERO);
    }
}
