use sqlx::{Row, SqlitePool, migrate::Migrator, sqlite::SqliteConnectOptions};
use thiserror::Error;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Persistent resume state for one entry, keyed by `(phash, modtime,
/// fingerprint)`. A row survives a failed transfer and is deleted when the
/// entry finally succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeRecord {
    pub phash: u64,
    pub modtime: i64,
    pub fingerprint: Option<String>,
    /// Last acknowledged chunk of a resumable upload.
    pub chunk: u32,
    /// Server handle of the resumable upload, 0 when none was assigned.
    pub transfer_id: u64,
    /// Partially written destination, when a temp file was preserved.
    pub tmpfile: Option<String>,
    /// Consecutive failure count; drives the blacklist.
    pub error: u32,
    pub error_string: Option<String>,
}

impl ResumeRecord {
    pub fn fresh(phash: u64, modtime: i64, fingerprint: Option<String>) -> Self {
        Self {
            phash,
            modtime,
            fingerprint,
            chunk: 0,
            transfer_id: 0,
            tmpfile: None,
            error: 0,
            error_string: None,
        }
    }
}

/// SQLite-backed journal of resume records.
pub struct ProgressJournal {
    pool: SqlitePool,
}

impl ProgressJournal {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn new(database_url: &str) -> Result<Self, JournalError> {
        let pool = SqlitePool::connect(database_url).await?;
        let journal = Self { pool };
        journal.init().await?;
        Ok(journal)
    }

    pub async fn open(path: &std::path::Path) -> Result<Self, JournalError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let journal = Self { pool };
        journal.init().await?;
        Ok(journal)
    }

    pub async fn init(&self) -> Result<(), JournalError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    /// Fetch the record for an entry; all three key components must match,
    /// so a source edited since the failed attempt never resumes.
    pub async fn get(
        &self,
        phash: u64,
        modtime: i64,
        fingerprint: Option<&str>,
    ) -> Result<Option<ResumeRecord>, JournalError> {
        let row = sqlx::query(
            "SELECT phash, modtime, fingerprint, chunk, transfer_id, tmpfile, error, error_string
             FROM progress
             WHERE phash = ?1 AND modtime = ?2 AND fingerprint IS ?3",
        )
        .bind(phash as i64)
        .bind(modtime)
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let phash: i64 = row.try_get("phash")?;
        let chunk: i64 = row.try_get("chunk")?;
        let transfer_id: i64 = row.try_get("transfer_id")?;
        let error: i64 = row.try_get("error")?;
        Ok(Some(ResumeRecord {
            phash: phash as u64,
            modtime: row.try_get("modtime")?,
            fingerprint: row.try_get("fingerprint")?,
            chunk: chunk as u32,
            transfer_id: transfer_id as u64,
            tmpfile: row.try_get("tmpfile")?,
            error: error as u32,
            error_string: row.try_get("error_string")?,
        }))
    }

    pub async fn put(&self, record: &ResumeRecord) -> Result<(), JournalError> {
        sqlx::query(
            "INSERT INTO progress (phash, modtime, fingerprint, chunk, transfer_id, tmpfile, error, error_string)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(phash) DO UPDATE SET
                modtime = excluded.modtime,
                fingerprint = excluded.fingerprint,
                chunk = excluded.chunk,
                transfer_id = excluded.transfer_id,
                tmpfile = excluded.tmpfile,
                error = excluded.error,
                error_string = excluded.error_string;",
        )
        .bind(record.phash as i64)
        .bind(record.modtime)
        .bind(&record.fingerprint)
        .bind(i64::from(record.chunk))
        .bind(record.transfer_id as i64)
        .bind(&record.tmpfile)
        .bind(i64::from(record.error))
        .bind(&record.error_string)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete(&self, phash: u64) -> Result<(), JournalError> {
        sqlx::query("DELETE FROM progress WHERE phash = ?1")
            .bind(phash as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn count(&self) -> Result<u64, JournalError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM progress")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as u64)
    }
}

#[cfg(test)]
#[path = "journal_tests.rs"]
mod tests;
