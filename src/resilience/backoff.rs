//! Exponential backoff with jitter.

use rand::Rng;
use std::time::Duration;

/// Jitter band applied around the computed delay (±25%).
pub const JITTER_FRACTION: f64 = 0.25;

/// Pre-jitter delay before retrying after `attempt` (1-based).
///
/// `min(max_ms, base_ms × multiplier^(attempt-1))`
pub fn calculate_delay(attempt: u32, base_ms: u64, multiplier: f64, max_ms: u64) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let exponent = (attempt - 1).min(i32::MAX as u32) as i32;
    let raw = base_ms as f64 * multiplier.max(1.0).powi(exponent);
    let capped = if raw.is_finite() {
        raw.min(max_ms as f64)
    } else {
        max_ms as f64
    };

    Duration::from_millis(capped.max(0.0) as u64)
}

/// Perturb `delay` uniformly within ±25%, floored at zero.
pub fn apply_jitter(delay: Duration) -> Duration {
    let ms = delay.as_millis() as f64;
    if ms <= 0.0 {
        return Duration::ZERO;
    }
    let factor = rand::thread_rng().gen_range(-JITTER_FRACTION..=JITTER_FRACTION);
    let jittered = (ms * (1.0 + factor)).max(0.0);
    Duration::from_millis(jittered.round() as u64)
}

/// Exponential block duration for repeated 429s: `base × 2^min(blocks, 4)`, capped.
pub fn adaptive_block(base: Duration, recent_blocks: usize, max: Duration) -> Duration {
    let exponent = recent_blocks.min(4) as u32;
    base.saturating_mul(2u32.pow(exponent)).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_calculation() {
        assert_eq!(calculate_delay(1, 1000, 2.0, 30_000), Duration::from_millis(1000));
        assert_eq!(calculate_delay(2, 1000, 2.0, 30_000), Duration::from_millis(2000));
        assert_eq!(calculate_delay(3, 1000, 2.0, 30_000), Duration::from_millis(4000));
        assert_eq!(calculate_delay(10, 1000, 2.0, 30_000), Duration::from_millis(30_000));
        assert_eq!(calculate_delay(0, 1000, 2.0, 30_000), Duration::ZERO);
    }

    #[test]
    fn test_delay_does_not_overflow() {
        assert_eq!(calculate_delay(5000, 1000, 2.0, 60_000), Duration::from_millis(60_000));
    }

    #[test]
    fn test_jitter_band() {
        let base = calculate_delay(3, 1000, 2.0, 30_000);
        for _ in 0..1000 {
            let d = apply_jitter(base).as_millis();
            assert!((3000..=5000).contains(&d), "jittered delay {} out of band", d);
        }
        assert_eq!(apply_jitter(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn test_adaptive_block_caps_exponent() {
        let base = Duration::from_secs(30);
        let max = Duration::from_secs(3600);
        assert_eq!(adaptive_block(base, 0, max), Duration::from_secs(30));
        assert_eq!(adaptive_block(base, 2, max), Duration::from_secs(120));
        assert_eq!(adaptive_block(base, 4, max), Duration::from_secs(480));
        assert_eq!(adaptive_block(base, 9, max), Duration::from_secs(480));
        assert_eq!(adaptive_block(base, 4, Duration::from_secs(300)), Duration::from_secs(300));
    }
}
