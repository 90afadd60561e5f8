//! Utility module
//!
//! This module provides common utilities and helper functions used
//! throughout the library.

use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::Level;

use crate::core::{Error, Result};

/// Converts a duration to whole milliseconds, saturating at `u64::MAX`
pub fn duration_to_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Roughly 30 years, the horizon tokio itself uses for unbounded sleeps
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `start + wait`, or `None` when the sum is not representable
pub fn checked_deadline(start: Instant, wait: Duration) -> Option<Instant> {
    start.checked_add(wait)
}

/// `start + wait`, clamped to a far-future instant on overflow
pub fn saturating_deadline(start: Instant, wait: Duration) -> Instant {
    checked_deadline(start, wait).unwrap_or_else(|| start + FAR_FUTURE)
}

/// Handle of the tokio runtime the caller runs on
pub fn current_runtime() -> Result<Handle> {
    Handle::try_current()
        .map_err(|e| Error::invalid_state(format!("no tokio runtime available: {}", e)))
}

/// Installs a fmt subscriber printing events up to `level`.
///
/// Returns false when a global subscriber was already installed.
pub fn init_tracing(level: Level) -> bool {
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_conversion() {
        assert_eq!(duration_to_millis(Duration::from_millis(1500)), 1500);
        assert_eq!(duration_to_millis(Duration::from_micros(999)), 0);
        assert_eq!(duration_to_millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn test_deadline_overflow() {
        let now = Instant::now();
        let wait = Duration::from_millis(250);
        assert_eq!(checked_deadline(now, wait), Some(now + wait));
        assert_eq!(checked_deadline(now, Duration::MAX), None);
        assert_eq!(saturating_deadline(now, wait), now + wait);
        assert_eq!(saturating_deadline(now, Duration::MAX), now + FAR_FUTURE);
    }

    #[test]
    fn test_no_runtime() {
        assert!(matches!(current_runtime(), Err(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_runtime_available() {
        assert!(current_runtime().is_ok());
    }

    #[test]
    fn test_init_tracing_once() {
        init_tracing(Level::DEBUG);
        assert!(!init_tracing(Level::DEBUG));
    }
}
