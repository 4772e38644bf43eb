//! Wall-clock helpers driven by the tokio clock.
//!
//! Everything that stores an epoch timestamp goes through [`now_ms`] so that
//! paused-clock tests (`tokio::time::pause` / `advance`) move deadlines and
//! windows forward exactly like real time would.

use std::sync::OnceLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

static ANCHOR: OnceLock<(u64, std::time::Instant)> = OnceLock::new();

/// Milliseconds since the Unix epoch, as seen by the tokio clock.
#[must_use]
pub fn now_ms() -> u64 {
    let (epoch_ms, anchor) = *ANCHOR.get_or_init(|| {
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| duration_ms(d));
        (epoch_ms, std::time::Instant::now())
    });
    let elapsed = tokio::time::Instant::now()
        .into_std()
        .saturating_duration_since(anchor);
    epoch_ms + duration_ms(elapsed)
}

/// Duration in whole milliseconds, saturating at `u64::MAX`.
#[must_use]
pub fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_now_ms_follows_paused_clock() {
        let before = now_ms();
        tokio::time::advance(Duration::from_secs(60)).await;
        let after = now_ms();
        assert!(after - before >= 60_000);
        assert!(after - before < 61_000);
    }

    #[test]
    fn test_duration_ms() {
        assert_eq!(duration_ms(Duration::from_secs(2)), 2000);
        assert_eq!(duration_ms(Duration::from_micros(1500)), 1);
    }
}
