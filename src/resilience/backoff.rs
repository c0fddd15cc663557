//! Exponential backoff with jitter.

use std::time::Duration;
use rand::Rng;

/// Calculate exponential backoff delay with jitter.
///
/// `attempt` is 1-based: the delay before the first retry uses `base_ms`.
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    if attempt == 0 {
        return Duration::from_millis(0);
    }

    let exponential_base = 2u64.saturating_pow(attempt - 1);
    let capped_delay = base_ms.saturating_mul(exponential_base).min(max_ms);

    // Jitter of up to 10% so retrying CALLERs and LISTENERs do not hit the store in lockstep.
    let jitter_range = capped_delay / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped_delay + jitter)
}

/// Delay before retry `attempt`, preferring a server-provided `Retry-After`.
///
/// The server hint is still capped at `max_ms` so a hostile or confused
/// store cannot park a round forever.
pub fn delay_for(attempt: u32, base_ms: u64, max_ms: u64, retry_after: Option<Duration>) -> Duration {
    match retry_after {
        Some(hint) => hint.min(Duration::from_millis(max_ms)),
        None => calculate_backoff(attempt, base_ms, max_ms),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_calculation() {
        assert_eq!(calculate_backoff(0, 100, 2000), Duration::ZERO);

        let b1 = calculate_backoff(1, 100, 2000);
        assert!(b1.as_millis() >= 100 && b1.as_millis() < 110);

        let b2 = calculate_backoff(2, 100, 2000);
        assert!(b2.as_millis() >= 200 && b2.as_millis() < 220);

        let max = calculate_backoff(10, 100, 1000);
        assert!(max.as_millis() >= 1000 && max.as_millis() < 1100);
    }

    #[test]
    fn retry_after_wins_but_is_capped() {
        let hinted = delay_for(1, 100, 5_000, Some(Duration::from_secs(2)));
        assert_eq!(hinted, Duration::from_secs(2));

        let capped = delay_for(1, 100, 5_000, Some(Duration::from_secs(120)));
        assert_eq!(capped, Duration::from_secs(5));
    }
}
