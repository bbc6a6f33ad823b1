use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Fixed-window counter keyed by arbitrary strings (client IPs, routes).
///
/// One mutex guards the whole bucket map — the critical section is a map
/// lookup plus an increment. A background task reclaims expired buckets so
/// high-cardinality keys cannot grow the map without bound.
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    buckets: Mutex<HashMap<String, Bucket>>,
    stop: Notify,
    stopped: AtomicBool,
}

struct Bucket {
    count: u32,
    reset_at: Instant,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit: limit.max(1),
            window,
            buckets: Mutex::new(HashMap::new()),
            stop: Notify::new(),
            stopped: AtomicBool::new(false),
        }
    }

    /// Returns `true` when `key` is still within its window budget.
    /// A missing or expired bucket starts a fresh window with count 1.
    pub fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap();

        match buckets.get_mut(key) {
            Some(bucket) if now <= bucket.reset_at => {
                if bucket.count < self.limit {
                    bucket.count += 1;
                    true
                } else {
                    false
                }
            }
            _ => {
                buckets.insert(
                    key.to_owned(),
                    Bucket {
                        count: 1,
                        reset_at: now + self.window,
                    },
                );
                true
            }
        }
    }

    /// Spawn the background sweeper. Call once after construction.
    pub fn start_sweeper(self: &Arc<Self>) {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if limiter.stopped.load(Ordering::Acquire) {
                            return;
                        }
                        limiter.sweep();
                    }
                    _ = limiter.stop.notified() => return,
                }
            }
        });
    }

    /// Stop the sweeper. Idempotent.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.stop.notify_one();
        }
    }

    fn sweep(&self) {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap();
        buckets.retain(|_, bucket| now <= bucket.reset_at);
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.lock().unwrap().len()
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_up_to_limit() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));

        assert!(limiter.allow("k"));
        assert!(limiter.allow("k"));
        assert!(limiter.allow("k"));
        assert!(!limiter.allow("k"));
        assert!(!limiter.allow("k"));
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));

        assert!(limiter.allow("a"));
        assert!(!limiter.allow("a"));
        assert!(limiter.allow("b"));
    }

    #[test]
    fn test_window_resets() {
        let limiter = RateLimiter::new(1, Duration::from_millis(20));

        assert!(limiter.allow("k"));
        assert!(!limiter.allow("k"));

        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.allow("k"));
    }

    #[test]
    fn test_sweep_evicts_expired_buckets() {
        let limiter = RateLimiter::new(1, Duration::from_millis(10));
        limiter.allow("a");
        limiter.allow("b");
        assert_eq!(limiter.bucket_count(), 2);

        std::thread::sleep(Duration::from_millis(20));
        limiter.sweep();
        assert_eq!(limiter.bucket_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let limiter = Arc::new(RateLimiter::new(1, Duration::from_secs(1)));
        limiter.start_sweeper();
        limiter.stop();
        limiter.stop();
        assert!(limiter.stopped.load(Ordering::Acquire));
    }
}
