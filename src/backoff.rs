use std::time::Duration;

/// Exponential backoff: `base * 2^(attempt-1)`, capped at `max`.
/// `attempt` is 1-based (the attempt that just failed).
pub fn delay(base_ms: u64, max_ms: u64, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(20);
    let ms = base_ms.saturating_mul(1u64 << exp).min(max_ms);
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_cap() {
        assert_eq!(delay(100, 1_000, 1), Duration::from_millis(100));
        assert_eq!(delay(100, 1_000, 2), Duration::from_millis(200));
        assert_eq!(delay(100, 1_000, 4), Duration::from_millis(800));
        assert_eq!(delay(100, 1_000, 5), Duration::from_millis(1_000));
        assert_eq!(delay(100, 1_000, 60), Duration::from_millis(1_000));
    }
}
