//! Record dispatch to the configured backends
//!
//! Capture handlers push finished records into one bounded channel. A single
//! dispatcher task enriches each record with geolocation and hands it to every
//! enabled sink. Sink failures are logged and never reach the capture side.

mod elasticsearch;
mod jsonl;
mod logger;
mod sqlite;

pub use elasticsearch::ElasticsearchRecorder;
pub use jsonl::JsonLinesRecorder;
pub use logger::LogRecorder;
pub use sqlite::SqliteRecorder;

use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::RecorderConfig;
use crate::geoip::SharedGeoIp;
use crate::record::Record;

/// Sender handle for queueing records
pub type RecordSender = mpsc::Sender<Record>;

/// Records waiting for the dispatcher before capture tasks are held back
const CHANNEL_CAPACITY: usize = 1024;

/// Upper bound for one backend call
const SINK_TIMEOUT: Duration = Duration::from_secs(5);

/// A recording backend
#[async_trait]
pub trait RecordSink: Send + Sync {
    fn name(&self) -> &str;

    /// Files the backend created that it keeps writing after the privilege drop
    fn owned_paths(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    async fn record(&self, record: &Record) -> Result<()>;
}

/// Construct the backend registered under `config.name`
pub async fn build(config: &RecorderConfig) -> Result<Box<dyn RecordSink>> {
    let sink: Box<dyn RecordSink> = match config.name.as_str() {
        "elasticsearch" | "elasticsearch6" | "elasticsearch7" | "elasticsearch8" => {
            Box::new(ElasticsearchRecorder::new(
                config.option("host")?,
                config.option("username")?,
                config.option("password")?,
            )?)
        }
        "log" => Box::new(LogRecorder),
        "jsonl" => Box::new(JsonLinesRecorder::open(config.option("path")?).await?),
        "sqlite" => Box::new(SqliteRecorder::open(config.option("path")?).await?),
        other => anyhow::bail!("Invalid recorder name {}", other),
    };
    Ok(sink)
}

/// Build every enabled recorder, skipping those that fail
pub async fn build_all(configs: &[RecorderConfig]) -> Vec<Box<dyn RecordSink>> {
    let mut sinks = Vec::new();
    for config in configs {
        if !config.enabled {
            debug!("Recorder {} disabled", config.name);
            continue;
        }
        match build(config).await {
            Ok(sink) => {
                info!("Created {} recorder", sink.name());
                sinks.push(sink);
            }
            Err(e) => warn!("Skipping recorder {}: {:#}", config.name, e),
        }
    }
    sinks
}

/// Start the dispatcher task. Returns the sender capture handlers use.
pub fn start(sinks: Vec<Box<dyn RecordSink>>, geoip: SharedGeoIp) -> RecordSender {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

    tokio::spawn(dispatch_task(sinks, geoip, rx));

    tx
}

async fn dispatch_task(
    sinks: Vec<Box<dyn RecordSink>>,
    geoip: SharedGeoIp,
    mut rx: mpsc::Receiver<Record>,
) {
    info!("Recorder dispatch started ({} backends)", sinks.len());

    while let Some(record) = rx.recv().await {
        let location = geoip.lookup(record.remote_ip);
        let record = record.with_geo(location);
        dispatch(&sinks, &record).await;
    }

    info!("Recorder dispatch shutting down");
}

/// Deliver one record to every sink concurrently
pub async fn dispatch(sinks: &[Box<dyn RecordSink>], record: &Record) {
    let deliveries = sinks.iter().map(|sink| async move {
        match tokio::time::timeout(SINK_TIMEOUT, sink.record(record)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("{} recorder failed: {:#}", sink.name(), e),
            Err(_) => warn!("{} recorder timed out", sink.name()),
        }
    });
    futures::future::join_all(deliveries).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geoip::GeoIp;
    use crate::record::Protocol;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    /// Keeps every record it receives
    #[derive(Clone, Default)]
    struct Collect(Arc<Mutex<Vec<Record>>>);

    #[async_trait]
    impl RecordSink for Collect {
        fn name(&self) -> &str {
            "collect"
        }

        async fn record(&self, record: &Record) -> Result<()> {
            self.0.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl RecordSink for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn record(&self, _record: &Record) -> Result<()> {
            anyhow::bail!("backend unreachable")
        }
    }

    /// Never answers
    struct Stalled;

    #[async_trait]
    impl RecordSink for Stalled {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn record(&self, _record: &Record) -> Result<()> {
            std::future::pending().await
        }
    }

    fn record(port: u16) -> Record {
        Record::new(Protocol::Tcp, "192.0.2.10:50000".parse().unwrap(), port, "h").with_bytes(b"x")
    }

    fn recorder_config(name: &str, enabled: bool) -> RecorderConfig {
        RecorderConfig {
            name: name.to_string(),
            enabled,
            options: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_failing_backend_does_not_block_others() {
        let collect = Collect::default();
        let sinks: Vec<Box<dyn RecordSink>> = vec![Box::new(Broken), Box::new(collect.clone())];

        let tx = start(sinks, Arc::new(GeoIp::disabled()));
        tx.send(record(21)).await.unwrap();
        tx.send(record(22)).await.unwrap();
        drop(tx);

        for _ in 0..100 {
            if collect.0.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let seen: Vec<u16> = collect.0.lock().unwrap().iter().map(|r| r.port).collect();
        assert_eq!(seen, vec![21, 22]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_backend_is_cut_off_by_timeout() {
        let collect = Collect::default();
        let sinks: Vec<Box<dyn RecordSink>> = vec![Box::new(Stalled), Box::new(collect.clone())];

        let started = tokio::time::Instant::now();
        let delivery = tokio::spawn(async move { dispatch(&sinks, &record(23)).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(collect.0.lock().unwrap().len(), 1);
        assert!(!delivery.is_finished());

        delivery.await.unwrap();
        assert!(started.elapsed() >= SINK_TIMEOUT);
        assert!(started.elapsed() < SINK_TIMEOUT * 2);
    }

    #[tokio::test]
    async fn test_unknown_and_disabled_recorders_are_skipped() {
        assert!(build(&recorder_config("elasticsearch5", true)).await.is_err());

        let sinks = build_all(&[
            recorder_config("log", true),
            recorder_config("log", false),
            recorder_config("nope", true),
            recorder_config("jsonl", true),
            recorder_config("elasticsearch8", true),
        ])
        .await;
        let names: Vec<&str> = sinks.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["log"]);
    }
}
