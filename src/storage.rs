use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::evidence::PixelBox;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// One persisted violation. At most one exists per `track_id`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub track_id: u64,
    /// Local time, `%Y-%m-%d %H:%M:%S`.
    pub timestamp: String,
    pub class_label: String,
    pub bbox: PixelBox,
    pub image_path: String,
    pub source_label: String,
    pub analysis_result: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A record with this track id already exists.
    Conflict(u64),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Conflict(id) => write!(f, "violation record for track {} already exists", id),
        }
    }
}

impl std::error::Error for StoreError {}

/// Returns true when `err` is a `StoreError::Conflict`.
pub fn is_conflict(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<StoreError>(), Some(StoreError::Conflict(_)))
}

pub trait ViolationStore: Send {
    fn exists(&mut self, track_id: u64) -> Result<bool>;

    /// Fails with `StoreError::Conflict` if the track id is already stored.
    fn insert(&mut self, record: &ViolationRecord) -> Result<()>;

    /// Set the analysis text for every record with `image_path`. Returns rows touched.
    fn update_analysis(&mut self, image_path: &str, result: &str) -> Result<usize>;

    fn analysis_for(&mut self, image_path: &str) -> Result<Option<String>>;

    fn latest(&mut self) -> Result<Option<ViolationRecord>>;

    /// Newest first; equal timestamps order by track id, highest first.
    fn list_all(&mut self) -> Result<Vec<ViolationRecord>>;

    /// Records without an analysis, oldest first.
    fn list_pending(&mut self) -> Result<Vec<ViolationRecord>>;

    fn max_track_id(&mut self) -> Result<Option<u64>>;
}

pub struct SqliteViolationStore {
    conn: Connection,
}

const SELECT_COLUMNS: &str =
    "SELECT track_id, timestamp, class, x1, y1, x2, y2, image_path, source_label, analysis_result FROM illegal_vehicles";

impl SqliteViolationStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = crate::open_db_connection(db_path)
            .with_context(|| format!("open violation store {}", db_path))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS illegal_vehicles (
              track_id INTEGER PRIMARY KEY,
              timestamp TEXT NOT NULL,
              class TEXT NOT NULL,
              x1 INTEGER NOT NULL,
              y1 INTEGER NOT NULL,
              x2 INTEGER NOT NULL,
              y2 INTEGER NOT NULL,
              image_path TEXT NOT NULL,
              source_label TEXT NOT NULL,
              analysis_result TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_vehicles_timestamp ON illegal_vehicles(timestamp);
            CREATE INDEX IF NOT EXISTS idx_vehicles_image_path ON illegal_vehicles(image_path);
            "#,
        )?;
        Ok(())
    }

    fn query_records(&self, sql: &str) -> Result<Vec<ViolationRecord>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(record_from_row(row)?);
        }
        Ok(out)
    }
}

fn record_from_row(row: &Row<'_>) -> Result<ViolationRecord> {
    let track_id: i64 = row.get(0)?;
    let coord = |idx: usize| -> Result<u32> {
        let v: i64 = row.get(idx)?;
        u32::try_from(v).map_err(|_| anyhow!("corrupt violation record: coordinate {} out of range", v))
    };
    Ok(ViolationRecord {
        track_id: u64::try_from(track_id)
            .map_err(|_| anyhow!("corrupt violation record: negative track id"))?,
        timestamp: row.get(1)?,
        class_label: row.get(2)?,
        bbox: PixelBox {
            x1: coord(3)?,
            y1: coord(4)?,
            x2: coord(5)?,
            y2: coord(6)?,
        },
        image_path: row.get(7)?,
        source_label: row.get(8)?,
        analysis_result: row.get(9)?,
    })
}

fn track_id_param(track_id: u64) -> Result<i64> {
    i64::try_from(track_id).map_err(|_| anyhow!("track id {} exceeds i64 range", track_id))
}

impl ViolationStore for SqliteViolationStore {
    fn exists(&mut self, track_id: u64) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM illegal_vehicles WHERE track_id = ?1",
                params![track_id_param(track_id)?],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn insert(&mut self, record: &ViolationRecord) -> Result<()> {
        let res = self.conn.execute(
            r#"
            INSERT INTO illegal_vehicles(track_id, timestamp, class, x1, y1, x2, y2, image_path, source_label, analysis_result)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                track_id_param(record.track_id)?,
                record.timestamp,
                record.class_label,
                record.bbox.x1,
                record.bbox.y1,
                record.bbox.x2,
                record.bbox.y2,
                record.image_path,
                record.source_label,
                record.analysis_result,
            ],
        );
        match res {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(StoreError::Conflict(record.track_id).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn update_analysis(&mut self, image_path: &str, result: &str) -> Result<usize> {
        Ok(self.conn.execute(
            "UPDATE illegal_vehicles SET analysis_result = ?1 WHERE image_path = ?2",
            params![result, image_path],
        )?)
    }

    fn analysis_for(&mut self, image_path: &str) -> Result<Option<String>> {
        let found: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT analysis_result FROM illegal_vehicles WHERE image_path = ?1 AND analysis_result IS NOT NULL LIMIT 1",
                params![image_path],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.flatten())
    }

    fn latest(&mut self) -> Result<Option<ViolationRecord>> {
        let sql = format!("{} ORDER BY timestamp DESC, track_id DESC LIMIT 1", SELECT_COLUMNS);
        Ok(self.query_records(&sql)?.into_iter().next())
    }

    fn list_all(&mut self) -> Result<Vec<ViolationRecord>> {
        let sql = format!("{} ORDER BY timestamp DESC, track_id DESC", SELECT_COLUMNS);
        self.query_records(&sql)
    }

    fn list_pending(&mut self) -> Result<Vec<ViolationRecord>> {
        let sql = format!(
            "{} WHERE analysis_result IS NULL ORDER BY timestamp ASC, track_id ASC",
            SELECT_COLUMNS
        );
        self.query_records(&sql)
    }

    fn max_track_id(&mut self) -> Result<Option<u64>> {
        let max: Option<i64> = self
            .conn
            .query_row("SELECT MAX(track_id) FROM illegal_vehicles", [], |row| row.get(0))?;
        max.map(|v| u64::try_from(v).map_err(|_| anyhow!("corrupt violation store: negative track id")))
            .transpose()
    }
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryViolationStore {
    records: Vec<ViolationRecord>,
}

impl InMemoryViolationStore {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn sorted_newest_first(&self) -> Vec<ViolationRecord> {
        let mut out = self.records.clone();
        out.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then(b.track_id.cmp(&a.track_id))
        });
        out
    }
}

impl ViolationStore for InMemoryViolationStore {
    fn exists(&mut self, track_id: u64) -> Result<bool> {
        Ok(self.records.iter().any(|r| r.track_id == track_id))
    }

    fn insert(&mut self, record: &ViolationRecord) -> Result<()> {
        if self.exists(record.track_id)? {
            return Err(StoreError::Conflict(record.track_id).into());
        }
        self.records.push(record.clone());
        Ok(())
    }

    fn update_analysis(&mut self, image_path: &str, result: &str) -> Result<usize> {
        let mut touched = 0;
        for record in self.records.iter_mut().filter(|r| r.image_path == image_path) {
            record.analysis_result = Some(result.to_string());
            touched += 1;
        }
        Ok(touched)
    }

    fn analysis_for(&mut self, image_path: &str) -> Result<Option<String>> {
        Ok(self
            .records
            .iter()
            .filter(|r| r.image_path == image_path)
            .find_map(|r| r.analysis_result.clone()))
    }

    fn latest(&mut self) -> Result<Option<ViolationRecord>> {
        Ok(self.sorted_newest_first().into_iter().next())
    }

    fn list_all(&mut self) -> Result<Vec<ViolationRecord>> {
        Ok(self.sorted_newest_first())
    }

    fn list_pending(&mut self) -> Result<Vec<ViolationRecord>> {
        let mut out: Vec<_> = self
            .sorted_newest_first()
            .into_iter()
            .filter(|r| r.analysis_result.is_none())
            .collect();
        out.reverse();
        Ok(out)
    }

    fn max_track_id(&mut self) -> Result<Option<u64>> {
        Ok(self.records.iter().map(|r| r.track_id).max())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(track_id: u64, timestamp: &str) -> ViolationRecord {
        ViolationRecord {
            track_id,
            timestamp: timestamp.to_string(),
            class_label: "illegal".to_string(),
            bbox: PixelBox {
                x1: 10,
                y1: 20,
                x2: 110,
                y2: 220,
            },
            image_path: format!("/evidence/illegal_{}.jpg", track_id),
            source_label: "cam-1".to_string(),
            analysis_result: None,
        }
    }

    fn stores() -> Result<Vec<(&'static str, Box<dyn ViolationStore>)>> {
        Ok(vec![
            (
                "sqlite",
                Box::new(SqliteViolationStore::open(&crate::shared_memory_uri())?),
            ),
            ("memory", Box::new(InMemoryViolationStore::default())),
        ])
    }

    #[test]
    fn insert_is_unique_per_track() -> Result<()> {
        for (name, mut store) in stores()? {
            assert!(!store.exists(7)?, "{}", name);
            store.insert(&record(7, "2024-05-17 10:00:00"))?;
            assert!(store.exists(7)?, "{}", name);

            let err = store
                .insert(&record(7, "2024-05-17 10:00:05"))
                .expect_err("duplicate insert must fail");
            assert!(is_conflict(&err), "{}: {}", name, err);
            assert_eq!(store.list_all()?.len(), 1, "{}", name);
        }
        Ok(())
    }

    #[test]
    fn listing_is_newest_first_with_track_tie_break() -> Result<()> {
        for (name, mut store) in stores()? {
            store.insert(&record(1, "2024-05-17 10:00:00"))?;
            store.insert(&record(3, "2024-05-17 10:00:01"))?;
            store.insert(&record(2, "2024-05-17 10:00:01"))?;

            let ids: Vec<u64> = store.list_all()?.iter().map(|r| r.track_id).collect();
            assert_eq!(ids, vec![3, 2, 1], "{}", name);
            assert_eq!(store.latest()?.map(|r| r.track_id), Some(3), "{}", name);
            assert_eq!(store.max_track_id()?, Some(3), "{}", name);
        }
        Ok(())
    }

    #[test]
    fn analysis_is_cached_by_image_path() -> Result<()> {
        for (name, mut store) in stores()? {
            let rec = record(5, "2024-05-17 10:00:00");
            store.insert(&rec)?;
            store.insert(&record(6, "2024-05-17 10:00:02"))?;
            assert_eq!(store.analysis_for(&rec.image_path)?, None, "{}", name);

            assert_eq!(store.update_analysis(&rec.image_path, "overloaded truck")?, 1);
            assert_eq!(store.update_analysis(&rec.image_path, "overloaded truck")?, 1);
            assert_eq!(
                store.analysis_for(&rec.image_path)?.as_deref(),
                Some("overloaded truck"),
                "{}",
                name
            );

            let pending: Vec<u64> = store.list_pending()?.iter().map(|r| r.track_id).collect();
            assert_eq!(pending, vec![6], "{}", name);
        }
        Ok(())
    }

    #[test]
    fn update_for_unknown_path_touches_nothing() -> Result<()> {
        for (_, mut store) in stores()? {
            assert_eq!(store.update_analysis("/nope.jpg", "x")?, 0);
            assert_eq!(store.latest()?, None);
            assert_eq!(store.max_track_id()?, None);
        }
        Ok(())
    }

    #[test]
    fn sqlite_round_trips_full_record() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("violations.db");
        let path = path.to_string_lossy().to_string();
        let mut rec = record(9, "2024-05-17 11:22:33");
        rec.analysis_result = Some("two axles".to_string());
        {
            let mut store = SqliteViolationStore::open(&path)?;
            store.insert(&rec)?;
        }
        let mut reopened = SqliteViolationStore::open(&path)?;
        assert_eq!(reopened.latest()?, Some(rec));
        Ok(())
    }
}
