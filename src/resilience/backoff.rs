//! Exponential backoff with jitter.
//!
//! Used to grow the breaker cooldown each time a half-open probe fails.

use std::time::Duration;

use rand::Rng;

/// `base * 2^(attempt - 1)`, capped at `max`, plus up to 10% jitter.
pub fn calculate_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let base_ms = base.as_millis() as u64;
    let factor = 2u64.saturating_pow(attempt - 1);
    let capped_ms = base_ms.saturating_mul(factor).min(max.as_millis() as u64);

    // Spread reopen times of breakers that tripped together.
    let jitter_range = capped_ms / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped_ms + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_growth() {
        let base = Duration::from_millis(100);
        let max = Duration::from_millis(1000);

        assert_eq!(calculate_backoff(0, base, max), Duration::ZERO);

        let first = calculate_backoff(1, base, max).as_millis();
        assert!((100..110).contains(&first));

        let second = calculate_backoff(2, base, max).as_millis();
        assert!((200..220).contains(&second));

        let capped = calculate_backoff(30, base, max).as_millis();
        assert!((1000..1100).contains(&capped));
    }
}
