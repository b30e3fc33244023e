use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{apply_admission, Admission, MeterRow, MeterSeed, MeterStore, WindowState};
use crate::error::LimiterError;

struct MemoryRow {
    id: i64,
    rate_per_second: f64,
    state: WindowState,
}

/// In-memory meter store for tests and deployments that accept losing
/// counters on restart. Same admission semantics as the SQLite store.
#[derive(Default)]
pub struct MemoryMeterStore {
    rows: Mutex<HashMap<(String, String), MemoryRow>>,
}

impl MemoryMeterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<(String, String), MemoryRow>>, LimiterError>
    {
        self.rows
            .lock()
            .map_err(|_| LimiterError::StoreError("meter map poisoned".to_string()))
    }
}

#[async_trait]
impl MeterStore for MemoryMeterStore {
    async fn reset(&self, seeds: &[MeterSeed]) -> Result<(), LimiterError> {
        let mut rows = self.lock()?;
        rows.clear();
        for (index, seed) in seeds.iter().enumerate() {
            rows.insert(
                (seed.url.clone(), seed.referrer.clone()),
                MemoryRow {
                    id: index as i64 + 1,
                    rate_per_second: seed.rate_per_second,
                    state: WindowState::default(),
                },
            );
        }
        Ok(())
    }

    async fn admit(
        &self,
        url: &str,
        referrer: &str,
        cap: u32,
        window_seconds: f64,
        now: f64,
    ) -> Result<Admission, LimiterError> {
        let mut rows = self.lock()?;
        let row = rows
            .get_mut(&(url.to_string(), referrer.to_string()))
            .ok_or_else(|| LimiterError::MissingRow {
                url: url.to_string(),
                referrer: referrer.to_string(),
            })?;
        Ok(apply_admission(&mut row.state, cap, window_seconds, now))
    }

    async fn snapshot(&self) -> Result<Vec<MeterRow>, LimiterError> {
        let rows = self.lock()?;
        let mut out: Vec<MeterRow> = rows
            .iter()
            .map(|((url, referrer), row)| MeterRow {
                id: row.id,
                url: url.clone(),
                referrer: referrer.clone(),
                window_count: row.state.count,
                window_start: row.state.start,
                rate_per_second: row.rate_per_second,
                total: row.state.total,
                rejected: row.state.rejected,
            })
            .collect();
        out.sort_by_key(|row| row.id);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_matches_sqlite_semantics() {
        let store = MemoryMeterStore::new();
        store
            .reset(&[MeterSeed {
                url: "http://a.example.com/svc".to_string(),
                referrer: "*".to_string(),
                rate_per_second: 0.05,
            }])
            .await
            .unwrap();

        for t in 0..3 {
            assert_eq!(
                store
                    .admit("http://a.example.com/svc", "*", 3, 20.0, f64::from(t))
                    .await
                    .unwrap(),
                Admission::Admitted
            );
        }
        assert_eq!(
            store
                .admit("http://a.example.com/svc", "*", 3, 20.0, 3.0)
                .await
                .unwrap(),
            Admission::Denied
        );

        let rows = store.snapshot().await.unwrap();
        assert_eq!(rows[0].rejected, 1);
    }

    #[tokio::test]
    async fn test_independent_rows_do_not_interact() {
        let store = MemoryMeterStore::new();
        store
            .reset(&[
                MeterSeed {
                    url: "http://a.example.com/svc".to_string(),
                    referrer: "https://one.example".to_string(),
                    rate_per_second: 0.05,
                },
                MeterSeed {
                    url: "http://a.example.com/svc".to_string(),
                    referrer: "https://two.example".to_string(),
                    rate_per_second: 0.05,
                },
            ])
            .await
            .unwrap();

        // Saturate the first row
        for _ in 0..3 {
            store
                .admit("http://a.example.com/svc", "https://one.example", 3, 20.0, 0.0)
                .await
                .unwrap();
        }
        assert_eq!(
            store
                .admit("http://a.example.com/svc", "https://one.example", 3, 20.0, 1.0)
                .await
                .unwrap(),
            Admission::Denied
        );
        // The second row is untouched
        assert_eq!(
            store
                .admit("http://a.example.com/svc", "https://two.example", 3, 20.0, 1.0)
                .await
                .unwrap(),
            Admission::Admitted
        );
    }
}
