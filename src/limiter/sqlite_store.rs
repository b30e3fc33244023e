use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use super::{apply_admission, Admission, MeterRow, MeterSeed, MeterStore, WindowState};
use crate::error::LimiterError;

/// Durable meter store backed by a single SQLite file in the working
/// directory. The connection mutex plus a per-call transaction give the
/// atomic read-modify-write the admission algorithm requires.
pub struct SqliteMeterStore {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl SqliteMeterStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LimiterError> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)
            .map_err(|e| LimiterError::OpenError(format!("{}: {}", path.display(), e)))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| LimiterError::OpenError(e.to_string()))?;
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS meter (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                url TEXT NOT NULL,
                referrer TEXT NOT NULL,
                count INTEGER NOT NULL DEFAULT 0,
                rate REAL NOT NULL DEFAULT 0,
                time REAL NOT NULL DEFAULT 0,
                total INTEGER NOT NULL DEFAULT 0,
                rejected INTEGER NOT NULL DEFAULT 0,
                UNIQUE(url, referrer)
            )
            "#,
            [],
        )
        .map_err(|e| LimiterError::OpenError(e.to_string()))?;

        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, LimiterError> {
        self.conn
            .lock()
            .map_err(|_| LimiterError::StoreError("connection poisoned".to_string()))
    }
}

#[async_trait]
impl MeterStore for SqliteMeterStore {
    async fn reset(&self, seeds: &[MeterSeed]) -> Result<(), LimiterError> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| LimiterError::StoreError(e.to_string()))?;
        tx.execute("DELETE FROM meter", [])
            .map_err(|e| LimiterError::StoreError(e.to_string()))?;
        for seed in seeds {
            tx.execute(
                r#"
                INSERT INTO meter (url, referrer, count, rate, time, total, rejected)
                VALUES (?1, ?2, 0, ?3, 0, 0, 0)
                "#,
                params![seed.url, seed.referrer, seed.rate_per_second],
            )
            .map_err(|e| LimiterError::StoreError(e.to_string()))?;
        }
        tx.commit()
            .map_err(|e| LimiterError::StoreError(e.to_string()))
    }

    async fn admit(
        &self,
        url: &str,
        referrer: &str,
        cap: u32,
        window_seconds: f64,
        now: f64,
    ) -> Result<Admission, LimiterError> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| LimiterError::StoreError(e.to_string()))?;

        let row = tx
            .query_row(
                "SELECT count, time, total, rejected FROM meter WHERE url = ?1 AND referrer = ?2",
                params![url, referrer],
                |row| {
                    Ok(WindowState {
                        count: row.get::<_, i64>(0)? as u32,
                        start: row.get(1)?,
                        total: row.get::<_, i64>(2)? as u64,
                        rejected: row.get::<_, i64>(3)? as u64,
                    })
                },
            )
            .optional()
            .map_err(|e| LimiterError::StoreError(e.to_string()))?;

        let mut state = row.ok_or_else(|| LimiterError::MissingRow {
            url: url.to_string(),
            referrer: referrer.to_string(),
        })?;

        let decision = apply_admission(&mut state, cap, window_seconds, now);

        tx.execute(
            r#"
            UPDATE meter
            SET count = ?3, time = ?4, total = ?5, rejected = ?6
            WHERE url = ?1 AND referrer = ?2
            "#,
            params![
                url,
                referrer,
                i64::from(state.count),
                state.start,
                state.total as i64,
                state.rejected as i64
            ],
        )
        .map_err(|e| LimiterError::StoreError(e.to_string()))?;
        tx.commit()
            .map_err(|e| LimiterError::StoreError(e.to_string()))?;

        Ok(decision)
    }

    async fn snapshot(&self) -> Result<Vec<MeterRow>, LimiterError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, url, referrer, count, time, rate, total, rejected FROM meter ORDER BY id",
            )
            .map_err(|e| LimiterError::StoreError(e.to_string()))?;

        let rows = stmt
            .query_map([], |row| {
                Ok(MeterRow {
                    id: row.get(0)?,
                    url: row.get(1)?,
                    referrer: row.get(2)?,
                    window_count: row.get::<_, i64>(3)? as u32,
                    window_start: row.get(4)?,
                    rate_per_second: row.get(5)?,
                    total: row.get::<_, i64>(6)? as u64,
                    rejected: row.get::<_, i64>(7)? as u64,
                })
            })
            .map_err(|e| LimiterError::StoreError(e.to_string()))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| LimiterError::StoreError(e.to_string()))?);
        }
        Ok(out)
    }
}
