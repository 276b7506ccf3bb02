//! Retry delays for failed uploads.
//!
//! `delay(n) = min(base * 2^(n-1) * (1 + jitter(id, n)), max)` with
//! `jitter` in `[0, jitter_ratio)`. The jitter is a hash of the upload id and
//! attempt number, so the schedule can be recomputed after a restart from
//! the stored attempt counter alone.

use vigil_db::RetrySchedule;
use vigil_ids::UploadId;
use vigil_protocol::config::UploadConfig;

/// Doubling stops growing past this exponent; the cap applies long before.
const MAX_EXPONENT: u32 = 40;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base_ms: i64,
    pub max_ms: i64,
    /// Upper bound on the multiplicative jitter. Clamped to `[0, 1]`.
    pub jitter_ratio: f64,
}

impl BackoffPolicy {
    pub fn new(base_ms: i64, max_ms: i64, jitter_ratio: f64) -> Self {
        Self {
            base_ms: base_ms.max(0),
            max_ms: max_ms.max(0),
            jitter_ratio: jitter_ratio.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &UploadConfig) -> Self {
        Self::new(
            (config.backoff_base_secs as i64).saturating_mul(1000),
            (config.backoff_max_secs as i64).saturating_mul(1000),
            config.jitter_ratio,
        )
    }

    /// Delay before the next claim of a job that has failed `attempts` times.
    pub fn delay_ms(&self, upload_id: &UploadId, attempts: u32) -> i64 {
        if attempts == 0 {
            return 0;
        }
        let exponent = (attempts - 1).min(MAX_EXPONENT);
        let raw = self.base_ms as f64
            * 2f64.powi(exponent as i32)
            * (1.0 + jitter(upload_id, attempts) * self.jitter_ratio);
        if raw >= self.max_ms as f64 {
            self.max_ms
        } else {
            raw as i64
        }
    }
}

impl RetrySchedule for BackoffPolicy {
    fn delay_ms(&self, upload_id: &UploadId, attempts: u32) -> i64 {
        BackoffPolicy::delay_ms(self, upload_id, attempts)
    }
}

/// Deterministic value in `[0, 1)` for an (upload, attempt) pair.
fn jitter(upload_id: &UploadId, attempts: u32) -> f64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(upload_id.as_str().as_bytes());
    hasher.update(&attempts.to_le_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest.as_bytes()[..8]);
    // 53 bits fit an f64 mantissa exactly.
    (u64::from_le_bytes(bytes) >> 11) as f64 / (1u64 << 53) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> UploadId {
        UploadId::parse(s).unwrap()
    }

    #[test]
    fn test_zero_attempts_has_no_delay() {
        let policy = BackoffPolicy::new(10_000, 3_600_000, 0.5);
        assert_eq!(policy.delay_ms(&id("up-1"), 0), 0);
    }

    #[test]
    fn test_delays_are_non_decreasing_and_capped() {
        let policy = BackoffPolicy::new(10_000, 3_600_000, 1.0);
        for n in 0..50 {
            let upload = id(&format!("up-{}", n));
            let mut previous = 0;
            for attempt in 1..=30 {
                let delay = policy.delay_ms(&upload, attempt);
                assert!(delay >= previous, "{} attempt {}: {} < {}", upload, attempt, delay, previous);
                assert!(delay <= 3_600_000);
                previous = delay;
            }
            assert_eq!(previous, 3_600_000);
        }
    }

    #[test]
    fn test_delay_bounds_per_attempt() {
        let policy = BackoffPolicy::new(10_000, 3_600_000, 0.5);
        let upload = id("up-bounds");
        for attempt in 1..=5u32 {
            let floor = 10_000i64 * (1 << (attempt - 1));
            let delay = policy.delay_ms(&upload, attempt);
            assert!(delay >= floor);
            assert!(delay < floor + floor / 2 + 1);
        }
    }

    #[test]
    fn test_schedule_is_reproducible() {
        let a = BackoffPolicy::new(10_000, 3_600_000, 0.5);
        let b = a;
        assert_eq!(a.delay_ms(&id("up-x"), 3), b.delay_ms(&id("up-x"), 3));
    }

    #[test]
    fn test_without_jitter_is_pure_doubling() {
        let policy = BackoffPolicy::new(1_000, 60_000, 0.0);
        let upload = id("up-plain");
        let delays: Vec<i64> = (1..=8).map(|n| policy.delay_ms(&upload, n)).collect();
        assert_eq!(
            delays,
            vec![1_000, 2_000, 4_000, 8_000, 16_000, 32_000, 60_000, 60_000]
        );
    }
}
