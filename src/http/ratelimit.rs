use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;

/// Per-provider request-rate gate. Purely in-memory: operator-set RPM rows
/// live in the store; this holds only the transient bucket state, keyed by
/// provider tag. The mutex is held for bucket arithmetic only, never across
/// I/O.
#[derive(Default)]
pub struct RateLimiter {
	buckets: Mutex<HashMap<String, Bucket>>,
}

struct Bucket {
	capacity: f64,
	// tokens per second
	rate: f64,
	tokens: f64,
	last_refill: Instant,
}

impl RateLimiter {
	pub fn new() -> Self {
		Self::default()
	}

	/// Take one token from the provider's bucket. `rpm <= 0` means unlimited.
	/// A bucket whose recorded shape disagrees with the current rpm (the
	/// operator changed the limit) is rebuilt full.
	pub fn allow(&self, provider: &str, rpm: i64) -> bool {
		if rpm <= 0 {
			return true;
		}
		let capacity = (rpm as f64).max(1.0);
		let rate = rpm as f64 / 60.0;
		let now = Instant::now();

		let mut buckets = self.buckets.lock();
		let bucket = buckets
			.entry(provider.to_string())
			.or_insert_with(|| Bucket {
				capacity,
				rate,
				tokens: capacity,
				last_refill: now,
			});
		if bucket.capacity != capacity || bucket.rate != rate {
			*bucket = Bucket {
				capacity,
				rate,
				tokens: capacity,
				last_refill: now,
			};
		}

		let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
		bucket.tokens = (bucket.tokens + elapsed * bucket.rate).min(bucket.capacity);
		bucket.last_refill = now;

		if bucket.tokens >= 1.0 {
			bucket.tokens -= 1.0;
			true
		} else {
			false
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn zero_rpm_is_unlimited() {
		let rl = RateLimiter::new();
		for _ in 0..1000 {
			assert!(rl.allow("openai", 0));
		}
	}

	#[test]
	fn exhausts_at_capacity() {
		let rl = RateLimiter::new();
		assert!(rl.allow("openai", 1));
		assert!(!rl.allow("openai", 1));
	}

	#[test]
	fn buckets_are_per_provider() {
		let rl = RateLimiter::new();
		assert!(rl.allow("openai", 1));
		assert!(!rl.allow("openai", 1));
		assert!(rl.allow("anthropic", 1));
	}

	#[test]
	fn rpm_change_rebuilds_full() {
		let rl = RateLimiter::new();
		assert!(rl.allow("openai", 1));
		assert!(!rl.allow("openai", 1));
		// Operator raised the limit: fresh bucket at the new capacity.
		assert!(rl.allow("openai", 60));
		assert!(rl.allow("openai", 60));
	}

	#[test]
	fn refills_over_time() {
		let rl = RateLimiter::new();
		let rpm = 6000; // 100 tokens/sec
		while rl.allow("openai", rpm) {}
		std::thread::sleep(std::time::Duration::from_millis(50));
		assert!(rl.allow("openai", rpm));
	}
}
