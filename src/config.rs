//! Heap configuration: the free-space tracking policy and growth tunables.

use core::fmt;
use core::str::FromStr;

use log::LevelFilter;

/// Minimal unit of heap growth, and the size of the chunk claimed at init.
pub const DEFAULT_CHUNK_SIZE: usize = 1 << 16;

/// A reasonable trailing free size above which memory goes back to the
/// segment provider, for callers that turn shrinking on.
pub const DEFAULT_SHRINK_THRESHOLD: usize = 1 << 14;

/// How free blocks are found. Chosen once, when the heap is created.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Policy {
    /// Rediscover free blocks by scanning every block in the heap.
    Implicit,
    /// Keep free blocks on a doubly linked list threaded through their payloads.
    Explicit,
}

impl Default for Policy {
    fn default() -> Self {
        Policy::Implicit
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Policy::Implicit => f.pad("implicit"),
            Policy::Explicit => f.pad("explicit"),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParsePolicyError;

impl fmt::Display for ParsePolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "expected `implicit` or `explicit`")
    }
}

impl FromStr for Policy {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("implicit") {
            Ok(Policy::Implicit)
        } else if s.eq_ignore_ascii_case("explicit") {
            Ok(Policy::Explicit)
        } else {
            Err(ParsePolicyError)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeapConfig {
    pub policy: Policy,
    /// Growth requests are never smaller than this. Rounded up to the block
    /// granularity.
    pub chunk_size: usize,
    /// When set, a trailing free block larger than this is trimmed back
    /// towards it after every free, in whole pages.
    pub shrink_threshold: Option<usize>,
    /// 0 is silent, 1 logs heap-level events, 2 every call and the check
    /// report, 3 and up every split and merge.
    pub log_level: u8,
}

impl Default for HeapConfig {
    fn default() -> Self {
        HeapConfig {
            policy: Policy::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            shrink_threshold: None,
            log_level: 0,
        }
    }
}

impl HeapConfig {
    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_shrink_threshold(mut self, threshold: usize) -> Self {
        self.shrink_threshold = Some(threshold);
        self
    }

    pub fn with_log_level(mut self, level: u8) -> Self {
        self.log_level = level;
        self
    }
}

/// Map a numeric log level onto the records a heap emits.
pub fn verbosity(level: u8) -> LevelFilter {
    match level {
        0 => LevelFilter::Off,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn test_policy_parsing() {
        assert_eq!("implicit".parse(), Ok(Policy::Implicit));
        assert_eq!("Explicit".parse(), Ok(Policy::Explicit));
        assert_eq!("best".parse::<Policy>(), Err(ParsePolicyError));
    }

    #[test]
    fn test_builder() {
        let config = HeapConfig::default()
            .with_policy(Policy::Explicit)
            .with_chunk_size(4096)
            .with_shrink_threshold(DEFAULT_SHRINK_THRESHOLD)
            .with_log_level(2);
        assert_eq!(config.policy, Policy::Explicit);
        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.shrink_threshold, Some(1 << 14));
        assert_eq!(verbosity(config.log_level), LevelFilter::Debug);
        assert_eq!(verbosity(0), LevelFilter::Off);
        assert_eq!(verbosity(9), LevelFilter::Trace);
    }
}
