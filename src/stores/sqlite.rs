use crate::error::AppError;
use crate::metadata::{AnalysisResult, PhotoMetadata, SearchHit, StoreStats};
use crate::store::{BulkWriter, Store};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS photos (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        path TEXT UNIQUE NOT NULL,
        filename TEXT NOT NULL,
        size INTEGER,
        created_time TEXT,
        modified_time TEXT,
        width INTEGER,
        height INTEGER,
        format TEXT,
        camera_make TEXT,
        camera_model TEXT,
        date_taken TEXT,
        gps_latitude REAL,
        gps_longitude REAL,
        file_hash TEXT,
        scanned_at TEXT DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS analysis_results (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        photo_id INTEGER NOT NULL,
        llm_model TEXT NOT NULL,
        description TEXT NOT NULL,
        people TEXT,
        locations TEXT,
        objects TEXT,
        tags TEXT,
        generated_at TEXT NOT NULL,
        FOREIGN KEY (photo_id) REFERENCES photos (id) ON DELETE CASCADE,
        UNIQUE(photo_id, llm_model)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_photos_path ON photos(path)",
    "CREATE INDEX IF NOT EXISTS idx_photos_hash ON photos(file_hash)",
    "CREATE INDEX IF NOT EXISTS idx_analysis_photo ON analysis_results(photo_id)",
];

/// SQLite-backed catalog of photos and their analysis results.
///
/// As a `Store`, `add` writes immediately and `flush` does nothing.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn open(db_path: &str) -> Result<Self, AppError> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
                log::debug!("Created database directory: {:?}", parent);
            }
        }
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path))?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        log::info!("Opened photo database at {}", db_path);
        Self::with_pool(pool).await
    }

    /// Private in-memory database; a single connection keeps it alive.
    pub async fn open_in_memory() -> Result<Self, AppError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, AppError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool })
    }

    pub async fn save_photo(&self, metadata: &PhotoMetadata) -> Result<i64, AppError> {
        let row = sqlx::query(
            r#"
            INSERT INTO photos (
                path, filename, size, created_time, modified_time, width, height, format,
                camera_make, camera_model, date_taken, gps_latitude, gps_longitude, file_hash
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(path) DO UPDATE SET
                filename = excluded.filename,
                size = excluded.size,
                created_time = excluded.created_time,
                modified_time = excluded.modified_time,
                width = excluded.width,
                height = excluded.height,
                format = excluded.format,
                camera_make = excluded.camera_make,
                camera_model = excluded.camera_model,
                date_taken = excluded.date_taken,
                gps_latitude = excluded.gps_latitude,
                gps_longitude = excluded.gps_longitude,
                file_hash = excluded.file_hash,
                scanned_at = CURRENT_TIMESTAMP
            RETURNING id
            "#,
        )
        .bind(&metadata.path)
        .bind(&metadata.filename)
        .bind(metadata.size as i64)
        .bind(metadata.created_time.map(|t| t.to_rfc3339()))
        .bind(metadata.modified_time.map(|t| t.to_rfc3339()))
        .bind(metadata.width.map(i64::from))
        .bind(metadata.height.map(i64::from))
        .bind(&metadata.format)
        .bind(&metadata.camera_make)
        .bind(&metadata.camera_model)
        .bind(&metadata.date_taken)
        .bind(metadata.gps_latitude)
        .bind(metadata.gps_longitude)
        .bind(&metadata.file_hash)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    pub async fn get_photo(&self, path: &str) -> Result<Option<PhotoMetadata>, AppError> {
        let row = sqlx::query("SELECT * FROM photos WHERE path = ?")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_photo(&r)).transpose()
    }

    /// Keyword match over description, people, locations, objects and tags.
    pub async fn search(&self, query: &str, limit: u32) -> Result<Vec<SearchHit>, AppError> {
        let term = format!("%{}%", query.trim());
        let rows = sqlx::query(
            r#"
            SELECT p.path, p.filename, p.created_time, p.modified_time,
                   ar.llm_model, ar.description, ar.people, ar.locations, ar.objects, ar.tags
            FROM photos p
            JOIN analysis_results ar ON p.id = ar.photo_id
            WHERE ar.description LIKE ?
               OR ar.people LIKE ?
               OR ar.locations LIKE ?
               OR ar.objects LIKE ?
               OR ar.tags LIKE ?
            ORDER BY p.modified_time DESC, p.path
            LIMIT ?
            "#,
        )
        .bind(&term)
        .bind(&term)
        .bind(&term)
        .bind(&term)
        .bind(&term)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        log::debug!("Search for '{}' matched {} results", query, rows.len());
        rows.iter()
            .map(|row| -> Result<SearchHit, AppError> {
                Ok(SearchHit {
                    path: row.try_get("path")?,
                    filename: row.try_get("filename")?,
                    llm_model: row.try_get("llm_model")?,
                    description: row.try_get("description")?,
                    people: decode_list(row, "people")?,
                    locations: decode_list(row, "locations")?,
                    objects: decode_list(row, "objects")?,
                    tags: decode_list(row, "tags")?,
                    created_time: decode_time(row, "created_time")?,
                    modified_time: decode_time(row, "modified_time")?,
                })
            })
            .collect()
    }

    /// Groups of paths whose content fingerprints are equal.
    pub async fn find_duplicates(&self) -> Result<Vec<Vec<String>>, AppError> {
        let rows = sqlx::query(
            r#"
            SELECT file_hash, path FROM photos
            WHERE file_hash IN (
                SELECT file_hash FROM photos
                WHERE file_hash IS NOT NULL
                GROUP BY file_hash HAVING COUNT(*) > 1
            )
            ORDER BY file_hash, path
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for row in rows {
            groups
                .entry(row.try_get("file_hash")?)
                .or_default()
                .push(row.try_get("path")?);
        }
        Ok(groups.into_values().collect())
    }
}

/// Id of the photo row for `path`, creating a bare row when it is missing.
async fn ensure_photo(conn: &mut SqliteConnection, path: &str) -> Result<i64, AppError> {
    let filename = Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string());
    sqlx::query("INSERT INTO photos (path, filename) VALUES (?, ?) ON CONFLICT(path) DO NOTHING")
        .bind(path)
        .bind(filename)
        .execute(&mut *conn)
        .await?;
    let row = sqlx::query("SELECT id FROM photos WHERE path = ?")
        .bind(path)
        .fetch_one(&mut *conn)
        .await?;
    Ok(row.try_get("id")?)
}

async fn upsert_result(conn: &mut SqliteConnection, result: &AnalysisResult) -> Result<(), AppError> {
    let photo_id = ensure_photo(conn, &result.photo_path).await?;
    sqlx::query(
        r#"
        INSERT INTO analysis_results (
            photo_id, llm_model, description, people, locations, objects, tags, generated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(photo_id, llm_model) DO UPDATE SET
            description = excluded.description,
            people = excluded.people,
            locations = excluded.locations,
            objects = excluded.objects,
            tags = excluded.tags,
            generated_at = excluded.generated_at
        "#,
    )
    .bind(photo_id)
    .bind(&result.llm_model)
    .bind(&result.description)
    .bind(serde_json::to_string(&result.people)?)
    .bind(serde_json::to_string(&result.locations)?)
    .bind(serde_json::to_string(&result.objects)?)
    .bind(serde_json::to_string(&result.tags)?)
    .bind(result.generated_at.to_rfc3339())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn decode_list(row: &SqliteRow, column: &str) -> Result<Vec<String>, AppError> {
    let raw: Option<String> = row.try_get(column)?;
    match raw {
        Some(text) if !text.is_empty() => Ok(serde_json::from_str(&text)?),
        _ => Ok(Vec::new()),
    }
}

fn decode_time(row: &SqliteRow, column: &str) -> Result<Option<DateTime<Utc>>, AppError> {
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|text| {
        DateTime::parse_from_rfc3339(&text)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| AppError::Generic(format!("bad timestamp in {}: {}", column, e)))
    })
    .transpose()
}

fn row_to_photo(row: &SqliteRow) -> Result<PhotoMetadata, AppError> {
    Ok(PhotoMetadata {
        path: row.try_get("path")?,
        filename: row.try_get("filename")?,
        size: row.try_get::<Option<i64>, _>("size")?.unwrap_or(0) as u64,
        created_time: decode_time(row, "created_time")?,
        modified_time: decode_time(row, "modified_time")?,
        width: row.try_get::<Option<i64>, _>("width")?.map(|w| w as u32),
        height: row.try_get::<Option<i64>, _>("height")?.map(|h| h as u32),
        format: row.try_get("format")?,
        camera_make: row.try_get("camera_make")?,
        camera_model: row.try_get("camera_model")?,
        date_taken: row.try_get("date_taken")?,
        gps_latitude: row.try_get("gps_latitude")?,
        gps_longitude: row.try_get("gps_longitude")?,
        file_hash: row.try_get::<Option<String>, _>("file_hash")?.unwrap_or_default(),
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn add(&self, result: AnalysisResult) -> Result<(), AppError> {
        let mut conn = self.pool.acquire().await?;
        upsert_result(&mut conn, &result).await
    }

    async fn flush(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn get_existing(
        &self,
        identity: &str,
        model: &str,
    ) -> Result<Option<AnalysisResult>, AppError> {
        let row = sqlx::query(
            r#"
            SELECT p.path, ar.llm_model, ar.description, ar.people, ar.locations,
                   ar.objects, ar.tags, ar.generated_at
            FROM analysis_results ar
            JOIN photos p ON ar.photo_id = p.id
            WHERE p.path = ? AND ar.llm_model = ?
            "#,
        )
        .bind(identity)
        .bind(model)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(AnalysisResult {
            photo_path: row.try_get("path")?,
            llm_model: row.try_get("llm_model")?,
            description: row.try_get("description")?,
            people: decode_list(&row, "people")?,
            locations: decode_list(&row, "locations")?,
            objects: decode_list(&row, "objects")?,
            tags: decode_list(&row, "tags")?,
            generated_at: decode_time(&row, "generated_at")?.unwrap_or_else(Utc::now),
        }))
    }

    async fn stats(&self) -> Result<StoreStats, AppError> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM photos) AS total_photos,
                (SELECT COUNT(*) FROM analysis_results) AS total_analyses,
                (SELECT COUNT(DISTINCT llm_model) FROM analysis_results) AS models_used
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(StoreStats {
            total_photos: row.try_get("total_photos")?,
            total_analyses: row.try_get("total_analyses")?,
            models_used: row.try_get("models_used")?,
        })
    }
}

#[async_trait]
impl BulkWriter for SqliteStore {
    async fn upsert_many(&self, results: &[AnalysisResult]) -> Result<usize, AppError> {
        let mut tx = self.pool.begin().await?;
        for result in results {
            upsert_result(&mut tx, result).await?;
        }
        tx.commit().await?;
        Ok(results.len())
    }
}
