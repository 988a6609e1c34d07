//! SQLite-backed video store with duplicate reconciliation, plus the encrypted
//! credential file used to keep the platform API key at rest.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use fernet::Fernet;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};
use uuid::Uuid;
use vtrend_core::{
    ChannelViews, CountryCount, DateViews, DuplicatePolicy, Outcome, Record, StoredRow,
};

pub const CRATE_NAME: &str = "vtrend-storage";

pub const DEFAULT_TOP_CHANNELS: u32 = 10;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS videos (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    video_id TEXT,
    title TEXT,
    published_at TEXT,
    channel_title TEXT,
    view_count INTEGER,
    like_count INTEGER,
    comment_count INTEGER,
    country TEXT
);
CREATE INDEX IF NOT EXISTS idx_videos_video_id ON videos (video_id);
"#;

const SELECT_ROWS: &str = r#"
SELECT id, video_id, title, published_at, channel_title,
       view_count, like_count, comment_count, country
  FROM videos
"#;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("opening database {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("database query failed: {0}")]
    Query(#[from] sqlx::Error),
    #[error("reconciliation aborted at video {video_id} after {committed} committed records: {source}")]
    Reconcile {
        committed: usize,
        video_id: String,
        #[source]
        source: sqlx::Error,
    },
}

/// Per-key async locks; entries are dropped once nobody holds or waits on them.
#[derive(Debug, Default)]
struct KeyLocks {
    inner: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    async fn acquire(self: &Arc<Self>, key: &str) -> KeyGuard {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            map.entry(key.to_string()).or_default().clone()
        };
        let guard = lock.lock_owned().await;
        KeyGuard {
            locks: Arc::clone(self),
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

struct KeyGuard {
    locks: Arc<KeyLocks>,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut map = self.locks.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if map
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            map.remove(&self.key);
        }
    }
}

#[derive(Debug, Clone)]
pub struct VideoStore {
    pool: SqlitePool,
    key_locks: Arc<KeyLocks>,
}

impl VideoStore {
    /// Open (creating if missing) the database file and ensure the schema exists.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|source| StorageError::Open {
                path: path.display().to_string(),
                source,
            })?;
        let store = Self::from_pool(pool);
        store.migrate().await?;
        info!(path = %path.display(), "video store opened");
        Ok(store)
    }

    /// Single-connection in-memory database; the connection is never recycled
    /// because the data lives only as long as it does.
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|source| StorageError::Open {
                path: ":memory:".to_string(),
                source,
            })?;
        let store = Self::from_pool(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// Each call gets a fresh lock map; only clones of one store share
    /// per-video atomicity.
    fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            key_locks: Arc::default(),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Apply `policy` to each record in order. Every record is committed on its
    /// own, so a failure part-way leaves earlier records in place.
    pub async fn reconcile(
        &self,
        records: &[Record],
        policy: DuplicatePolicy,
    ) -> Result<Vec<Outcome>, StorageError> {
        let mut outcomes = Vec::with_capacity(records.len());
        for record in records {
            match self.reconcile_one(record, policy).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(source) => {
                    return Err(StorageError::Reconcile {
                        committed: outcomes.len(),
                        video_id: record.video_id.clone(),
                        source,
                    })
                }
            }
        }
        Ok(outcomes)
    }

    async fn reconcile_one(
        &self,
        record: &Record,
        policy: DuplicatePolicy,
    ) -> Result<Outcome, sqlx::Error> {
        let _guard = self.key_locks.acquire(&record.video_id).await;

        let latest: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM videos WHERE video_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(&record.video_id)
        .fetch_optional(&self.pool)
        .await?;

        let outcome = match (latest, policy) {
            (None, _) => {
                self.insert(record).await?;
                Outcome::Inserted
            }
            (Some(_), DuplicatePolicy::Skip) => Outcome::Skipped,
            (Some(row_id), DuplicatePolicy::Overwrite) => {
                self.overwrite(row_id, record).await?;
                Outcome::Updated
            }
            (Some(_), DuplicatePolicy::Ignore) => {
                self.insert(record).await?;
                Outcome::InsertedAsDuplicate
            }
        };
        debug!(video_id = %record.video_id, %policy, ?outcome, "reconciled record");
        Ok(outcome)
    }

    async fn insert(&self, record: &Record) -> Result<i64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO videos (video_id, title, published_at, channel_title,
                                view_count, like_count, comment_count, country)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.video_id)
        .bind(&record.title)
        .bind(&record.published_at)
        .bind(&record.channel_title)
        .bind(count_to_sql(record.view_count))
        .bind(count_to_sql(record.like_count))
        .bind(count_to_sql(record.comment_count))
        .bind(&record.country)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn overwrite(&self, row_id: i64, record: &Record) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE videos
               SET title = ?, published_at = ?, channel_title = ?,
                   view_count = ?, like_count = ?, comment_count = ?, country = ?
             WHERE id = ?
            "#,
        )
        .bind(&record.title)
        .bind(&record.published_at)
        .bind(&record.channel_title)
        .bind(count_to_sql(record.view_count))
        .bind(count_to_sql(record.like_count))
        .bind(count_to_sql(record.comment_count))
        .bind(&record.country)
        .bind(row_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn all_rows(&self) -> Result<Vec<StoredRow>, StorageError> {
        let rows = sqlx::query(&format!("{SELECT_ROWS} ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_stored).collect()
    }

    pub async fn rows_for_video(&self, video_id: &str) -> Result<Vec<StoredRow>, StorageError> {
        let rows = sqlx::query(&format!("{SELECT_ROWS} WHERE video_id = ? ORDER BY id"))
            .bind(video_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_stored).collect()
    }

    pub async fn row_count(&self) -> Result<u64, StorageError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM videos")
            .fetch_one(&self.pool)
            .await?;
        Ok(count_from_sql(Some(count)))
    }

    pub async fn top_channels_by_views(&self, limit: u32) -> Result<Vec<ChannelViews>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT channel_title, SUM(view_count) AS total_views
              FROM videos
             GROUP BY channel_title
             ORDER BY total_views DESC, channel_title ASC
             LIMIT ?
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(ChannelViews {
                channel_title: row.try_get::<Option<String>, _>("channel_title")?.unwrap_or_default(),
                total_views: count_from_sql(row.try_get("total_views")?),
            });
        }
        Ok(out)
    }

    pub async fn counts_by_country(&self) -> Result<Vec<CountryCount>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT country, COUNT(*) AS video_count
              FROM videos
             GROUP BY country
             ORDER BY country
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(CountryCount {
                country: row.try_get::<Option<String>, _>("country")?.unwrap_or_default(),
                video_count: count_from_sql(row.try_get("video_count")?),
            });
        }
        Ok(out)
    }

    /// Views summed per publish day, oldest first. Rows whose `published_at`
    /// is not a date SQLite understands are left out.
    pub async fn views_by_publish_date(&self) -> Result<Vec<DateViews>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT DATE(published_at) AS date, SUM(view_count) AS total_views
              FROM videos
             WHERE DATE(published_at) IS NOT NULL
             GROUP BY date
             ORDER BY date
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(DateViews {
                date: row.try_get("date")?,
                total_views: count_from_sql(row.try_get("total_views")?),
            });
        }
        Ok(out)
    }
}

fn row_to_stored(row: &SqliteRow) -> Result<StoredRow, StorageError> {
    let text = |col: &str| -> Result<String, sqlx::Error> {
        Ok(row.try_get::<Option<String>, _>(col)?.unwrap_or_default())
    };
    Ok(StoredRow {
        row_id: row.try_get("id")?,
        record: Record {
            video_id: text("video_id")?,
            title: text("title")?,
            channel_title: text("channel_title")?,
            published_at: text("published_at")?,
            view_count: count_from_sql(row.try_get("view_count")?),
            like_count: count_from_sql(row.try_get("like_count")?),
            comment_count: count_from_sql(row.try_get("comment_count")?),
            country: text("country")?,
        },
    })
}

fn count_to_sql(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn count_from_sql(value: Option<i64>) -> u64 {
    value.and_then(|v| u64::try_from(v).ok()).unwrap_or(0)
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("API key cannot be empty")]
    EmptyKey,
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("encryption key in {0} is not valid key material")]
    InvalidKeyMaterial(String),
    #[error("failed to decrypt API key from {0}")]
    Decrypt(String),
    #[error("decrypted API key is not valid UTF-8")]
    NotUtf8,
}

/// Encrypted API key on disk, plus the key material that protects it.
/// The key file is generated on first use and reused from then on.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    key_path: PathBuf,
    blob_path: PathBuf,
}

impl CredentialStore {
    pub fn new(key_path: impl Into<PathBuf>, blob_path: impl Into<PathBuf>) -> Self {
        Self {
            key_path: key_path.into(),
            blob_path: blob_path.into(),
        }
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    pub fn blob_path(&self) -> &Path {
        &self.blob_path
    }

    pub async fn load_or_create_cipher(&self) -> Result<Fernet, CredentialError> {
        let key = if fs::try_exists(&self.key_path)
            .await
            .map_err(|source| io_error("checking", &self.key_path, source))?
        {
            let raw = fs::read_to_string(&self.key_path)
                .await
                .map_err(|source| io_error("reading", &self.key_path, source))?;
            raw.trim().to_string()
        } else {
            let key = Fernet::generate_key();
            write_atomic(&self.key_path, key.as_bytes()).await?;
            restrict_permissions(&self.key_path).await?;
            info!(path = %self.key_path.display(), "generated new encryption key");
            key
        };
        Fernet::new(&key)
            .ok_or_else(|| CredentialError::InvalidKeyMaterial(self.key_path.display().to_string()))
    }

    pub async fn save_api_key(&self, api_key: &str) -> Result<(), CredentialError> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(CredentialError::EmptyKey);
        }
        let cipher = self.load_or_create_cipher().await?;
        let token = cipher.encrypt(api_key.as_bytes());
        write_atomic(&self.blob_path, token.as_bytes()).await?;
        restrict_permissions(&self.blob_path).await?;
        info!(path = %self.blob_path.display(), "API key saved and encrypted");
        Ok(())
    }

    /// `Ok(None)` when no key has been saved yet.
    pub async fn load_api_key(&self) -> Result<Option<String>, CredentialError> {
        if !fs::try_exists(&self.blob_path)
            .await
            .map_err(|source| io_error("checking", &self.blob_path, source))?
        {
            return Ok(None);
        }
        let token = fs::read_to_string(&self.blob_path)
            .await
            .map_err(|source| io_error("reading", &self.blob_path, source))?;
        let cipher = self.load_or_create_cipher().await?;
        let plain = cipher
            .decrypt(token.trim())
            .map_err(|_| CredentialError::Decrypt(self.blob_path.display().to_string()))?;
        String::from_utf8(plain)
            .map(Some)
            .map_err(|_| CredentialError::NotUtf8)
    }
}

fn io_error(action: &'static str, path: &Path, source: std::io::Error) -> CredentialError {
    CredentialError::Io {
        action,
        path: path.display().to_string(),
        source,
    }
}

/// Write through a sibling temp file and rename it over the target.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CredentialError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .map_err(|source| io_error("creating directory", &parent, source))?;

    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(|source| io_error("opening temp file", &temp_path, source))?;
    file.write_all(bytes)
        .await
        .map_err(|source| io_error("writing temp file", &temp_path, source))?;
    file.flush()
        .await
        .map_err(|source| io_error("flushing temp file", &temp_path, source))?;
    drop(file);

    if let Err(source) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(io_error("renaming temp file onto", path, source));
    }
    Ok(())
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> Result<(), CredentialError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .await
        .map_err(|source| io_error("restricting permissions on", path, source))
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> Result<(), CredentialError> {
    Ok(())
}
