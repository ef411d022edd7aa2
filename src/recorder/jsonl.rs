//! Newline-delimited JSON file backend

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::RecordSink;
use crate::record::Record;

pub struct JsonLinesRecorder {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesRecorder {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Could not open {}", path.display()))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }
}

#[async_trait]
impl RecordSink for JsonLinesRecorder {
    fn name(&self) -> &str {
        "jsonl"
    }

    fn owned_paths(&self) -> Vec<PathBuf> {
        vec![self.path.clone()]
    }

    async fn record(&self, record: &Record) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line)
            .await
            .with_context(|| format!("Could not append to {}", self.path.display()))?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Protocol;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_appends_one_object_per_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("records.jsonl");
        let sink = JsonLinesRecorder::open(&path).await.unwrap();

        for port in [80u16, 8080] {
            let record = Record::new(Protocol::Tcp, "192.0.2.1:1234".parse().unwrap(), port, "h")
                .with_bytes(b"GET /\r\n");
            sink.record(&record).await.unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["port"], 80);
        assert_eq!(lines[1]["port"], 8080);
        assert_eq!(lines[1]["input"], "GET /\\r\\n");
    }
}
