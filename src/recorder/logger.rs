use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use super::RecordSink;
use crate::record::Record;

/// Writes each record to the process log
pub struct LogRecorder;

#[async_trait]
impl RecordSink for LogRecorder {
    fn name(&self) -> &str {
        "log"
    }

    async fn record(&self, record: &Record) -> Result<()> {
        info!(
            remote_ip = %record.remote_ip,
            remote_port = record.remote_port,
            protocol = %record.protocol,
            port = record.port,
            is_binary = record.is_binary,
            use_ssl = record.use_ssl,
            input = %record.input,
            "Captured input"
        );
        Ok(())
    }
}
