//! SQLite backend

use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Sqlite};
use std::path::PathBuf;
use std::time::Duration;

use super::RecordSink;
use crate::record::Record;

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp BIGINT NOT NULL,
    remote_ip TEXT NOT NULL,
    remote_port INTEGER NOT NULL,
    protocol TEXT NOT NULL,
    port INTEGER NOT NULL,
    input TEXT NOT NULL,
    is_binary BOOLEAN NOT NULL DEFAULT 0,
    use_ssl BOOLEAN NOT NULL DEFAULT 0,
    latitude REAL,
    longitude REAL,
    country_code TEXT,
    host TEXT NOT NULL
)
"#;

const CREATE_INDEX_TIMESTAMP: &str =
    "CREATE INDEX IF NOT EXISTS idx_records_timestamp ON records(timestamp)";

const CREATE_INDEX_PORT: &str =
    "CREATE INDEX IF NOT EXISTS idx_records_port ON records(protocol, port)";

pub struct SqliteRecorder {
    path: PathBuf,
    pool: Pool<Sqlite>,
}

impl SqliteRecorder {
    pub async fn open(path: &str) -> Result<Self> {
        // Keep one connection open for good so the WAL side files are never
        // recreated by the unprivileged process
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect(&format!("sqlite:{}?mode=rwc", path))
            .await?;
        let recorder = Self {
            path: PathBuf::from(path),
            pool,
        };
        recorder.run_migrations().await?;
        Ok(recorder)
    }

    async fn run_migrations(&self) -> Result<()> {
        // Enable WAL mode for better concurrency
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA synchronous=NORMAL")
            .execute(&self.pool)
            .await?;

        sqlx::query(CREATE_TABLE).execute(&self.pool).await?;
        sqlx::query(CREATE_INDEX_TIMESTAMP)
            .execute(&self.pool)
            .await?;
        sqlx::query(CREATE_INDEX_PORT).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl RecordSink for SqliteRecorder {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn owned_paths(&self) -> Vec<PathBuf> {
        ["", "-wal", "-shm"]
            .iter()
            .map(|suffix| {
                let mut name = self.path.clone().into_os_string();
                name.push(suffix);
                PathBuf::from(name)
            })
            .collect()
    }

    async fn record(&self, record: &Record) -> Result<()> {
        let location = record.location.as_ref();
        sqlx::query(
            r#"
            INSERT INTO records (timestamp, remote_ip, remote_port, protocol, port, input, is_binary, use_ssl, latitude, longitude, country_code, host)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.time.timestamp_millis())
        .bind(record.remote_ip.to_string())
        .bind(record.remote_port as i32)
        .bind(record.protocol.as_str())
        .bind(record.port as i32)
        .bind(record.input.to_string())
        .bind(record.is_binary)
        .bind(record.use_ssl)
        .bind(location.map(|l| l.lat))
        .bind(location.map(|l| l.lon))
        .bind(location.map(|l| l.country_code.clone()))
        .bind(&record.host)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
