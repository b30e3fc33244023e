pub mod memory_store;
pub mod sqlite_store;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use crate::core::resource::{Resource, ResourceTable};
use crate::error::LimiterError;

/// Admission decision for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Denied,
}

/// Snapshot of one meter row, as shown on the status page
#[derive(Debug, Clone)]
pub struct MeterRow {
    pub id: i64,
    pub url: String,
    pub referrer: String,
    pub window_count: u32,
    pub window_start: f64,
    pub rate_per_second: f64,
    pub total: u64,
    pub rejected: u64,
}

/// Seed row for preallocation at startup
#[derive(Debug, Clone)]
pub struct MeterSeed {
    pub url: String,
    pub referrer: String,
    pub rate_per_second: f64,
}

/// Minimal storage interface for meter rows. The defining operation is
/// `admit`: an atomic read-modify-write of the row keyed by
/// `(url, referrer)`. Any durable engine with that access pattern is a
/// valid implementation.
#[async_trait]
pub trait MeterStore: Send + Sync {
    /// Drop every row and repopulate from the seeds. In-flight windows are
    /// lost, which is acceptable on a configuration refresh.
    async fn reset(&self, seeds: &[MeterSeed]) -> Result<(), LimiterError>;

    /// Run the admission algorithm against one row. The whole
    /// read-compute-write sequence is atomic with respect to concurrent
    /// calls for the same key.
    async fn admit(
        &self,
        url: &str,
        referrer: &str,
        cap: u32,
        window_seconds: f64,
        now: f64,
    ) -> Result<Admission, LimiterError>;

    /// All rows, for the status page
    async fn snapshot(&self) -> Result<Vec<MeterRow>, LimiterError>;
}

/// Mutable window state shared by the store implementations
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct WindowState {
    pub count: u32,
    pub start: f64,
    pub total: u64,
    pub rejected: u64,
}

/// The sliding-window admission rules, applied under the store's row lock:
/// an empty or expired window resets to (1, now); an active window under
/// the cap increments without moving the start; a full window rejects.
pub(crate) fn apply_admission(
    state: &mut WindowState,
    cap: u32,
    window_seconds: f64,
    now: f64,
) -> Admission {
    if state.count == 0 || state.start + window_seconds <= now {
        state.count = 1;
        state.start = now;
        state.total += 1;
        Admission::Admitted
    } else if state.count < cap {
        state.count += 1;
        state.total += 1;
        Admission::Admitted
    } else {
        state.rejected += 1;
        Admission::Denied
    }
}

/// Per-(resource, referrer) sliding-window rate limiter over a durable
/// meter store.
pub struct RateLimiter {
    store: Arc<dyn MeterStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn MeterStore>) -> Self {
        Self { store }
    }

    /// Preallocate the row set: the Cartesian product of rate-limited
    /// resources and configured referrer keys. Admission is then a pure
    /// row update.
    pub async fn initialize(
        &self,
        resources: &ResourceTable,
        referrer_keys: &[String],
    ) -> Result<(), LimiterError> {
        let mut seeds = Vec::new();
        for resource in resources.iter() {
            if let Some(cap) = resource.rate_cap {
                let rate_per_second =
                    f64::from(cap.rate_limit) / (f64::from(cap.rate_limit_period) * 60.0);
                for referrer in referrer_keys {
                    seeds.push(MeterSeed {
                        url: resource.url.clone(),
                        referrer: referrer.clone(),
                        rate_per_second,
                    });
                }
            }
        }
        tracing::info!("Preallocating {} meter rows", seeds.len());
        self.store.reset(&seeds).await
    }

    /// Admit or deny one request for a rate-capped resource
    pub async fn check(
        &self,
        resource: &Resource,
        referrer_key: &str,
    ) -> Result<Admission, LimiterError> {
        let cap = match resource.rate_cap {
            Some(cap) => cap,
            None => return Ok(Admission::Admitted),
        };
        let now = epoch_seconds();
        self.store
            .admit(
                &resource.url,
                referrer_key,
                cap.rate_limit,
                cap.window_seconds(),
                now,
            )
            .await
    }

    /// All meter rows, for the status page
    pub async fn snapshot(&self) -> Result<Vec<MeterRow>, LimiterError> {
        self.store.snapshot().await
    }
}

fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_window_admits_and_resets() {
        let mut state = WindowState::default();
        assert_eq!(
            apply_admission(&mut state, 3, 20.0, 100.0),
            Admission::Admitted
        );
        assert_eq!(state.count, 1);
        assert!((state.start - 100.0).abs() < f64::EPSILON);
        assert_eq!(state.total, 1);
    }

    #[test]
    fn test_active_window_counts_without_moving_start() {
        let mut state = WindowState::default();
        apply_admission(&mut state, 3, 20.0, 100.0);
        assert_eq!(
            apply_admission(&mut state, 3, 20.0, 101.0),
            Admission::Admitted
        );
        assert_eq!(state.count, 2);
        // Window start stays anchored at the first admission
        assert!((state.start - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_full_window_denies_and_counts_rejection() {
        let mut state = WindowState::default();
        for second in 0..3 {
            assert_eq!(
                apply_admission(&mut state, 3, 20.0, 100.0 + f64::from(second)),
                Admission::Admitted
            );
        }
        assert_eq!(
            apply_admission(&mut state, 3, 20.0, 103.0),
            Admission::Denied
        );
        assert_eq!(state.count, 3);
        assert_eq!(state.total, 3);
        assert_eq!(state.rejected, 1);
    }

    #[test]
    fn test_expired_window_restarts() {
        let mut state = WindowState::default();
        for _ in 0..3 {
            apply_admission(&mut state, 3, 20.0, 100.0);
        }
        assert_eq!(
            apply_admission(&mut state, 3, 20.0, 120.0),
            Admission::Admitted
        );
        assert_eq!(state.count, 1);
        assert!((state.start - 120.0).abs() < f64::EPSILON);
        assert_eq!(state.total, 4);
    }

    #[test]
    fn test_cap_respected_within_any_window() {
        // Uniform arrivals at twice the rate: per window the admitted
        // count never exceeds the cap.
        let cap = 5u32;
        let window = 10.0;
        let mut state = WindowState::default();
        let mut admitted_in_window = 0u32;
        let mut window_start = 0.0;
        for tick in 0..200 {
            let now = f64::from(tick);
            let decision = apply_admission(&mut state, cap, window, now);
            if (state.start - window_start).abs() > f64::EPSILON {
                window_start = state.start;
                admitted_in_window = 0;
            }
            if decision == Admission::Admitted {
                admitted_in_window += 1;
            }
            assert!(admitted_in_window <= cap);
        }
    }
}
