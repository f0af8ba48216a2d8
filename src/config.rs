//! Configuration structures.
//!
//! All configuration is constructor-injected. Nothing here is global; every
//! [`RemoteFileHandle`](crate::RemoteFileHandle) and
//! [`ExtractionOrchestrator`](crate::ExtractionOrchestrator) owns its copy.

use std::path::PathBuf;
use std::time::Duration;

/// Default User-Agent sent with every request
pub const DEFAULT_USER_AGENT: &str = concat!("partfetch/", env!("CARGO_PKG_VERSION"));

/// Retry policy for a single HTTP operation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one (default: 5)
    pub max_attempts: u32,

    /// Delay before the first retry; doubled for every following one (default: 1 second)
    pub base_delay: Duration,

    /// Upper bound for any single delay (default: 60 seconds)
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Backoff before retrying after failed attempt number `attempt` (0-based).
    ///
    /// `base_delay * 2^attempt`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// HTTP settings for a [`RemoteFileHandle`](crate::RemoteFileHandle)
#[derive(Clone, Debug)]
pub struct FetchConfig {
    /// Deadline for probes and small reads, and the longest a streamed
    /// transfer may go without receiving data (default: 30 seconds)
    pub timeout: Duration,

    /// TCP connect timeout (default: 10 seconds)
    pub connect_timeout: Duration,

    /// User-Agent header; some firmware hosts reject generic clients
    pub user_agent: String,

    /// Optional Referer header
    pub referer: Option<String>,

    /// Retry policy applied to each probe, range fetch and download request
    pub retry: RetryPolicy,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            referer: None,
            retry: RetryPolicy::default(),
        }
    }
}

/// Top-level configuration for an [`ExtractionOrchestrator`](crate::ExtractionOrchestrator)
#[derive(Clone, Debug, Default)]
pub struct ExtractorConfig {
    /// HTTP settings used for every remote source
    pub fetch: FetchConfig,

    /// Directory for cached remote archives. Caching is disabled when `None`.
    pub cache_dir: Option<PathBuf>,
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_per_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy {
            max_delay: Duration::from_secs(5),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(10), Duration::from_secs(5));
        assert_eq!(policy.delay_for(40), Duration::from_secs(5));
    }

    #[test]
    fn user_agent_names_the_crate() {
        assert!(FetchConfig::default().user_agent.starts_with("partfetch/"));
    }
}
