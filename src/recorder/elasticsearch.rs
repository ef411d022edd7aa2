//! Elasticsearch backend
//!
//! Indexes every record as a JSON document into the `honeypoke` index and
//! asks for a refresh so it is searchable right away. The same document API
//! is served by Elasticsearch 6, 7 and 8.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use super::RecordSink;
use crate::record::Record;

const INDEX: &str = "honeypoke";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

pub struct ElasticsearchRecorder {
    client: Client,
    url: String,
    username: String,
    password: String,
}

impl ElasticsearchRecorder {
    pub fn new(host: &str, username: &str, password: &str) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Could not build Elasticsearch client")?;

        Ok(Self {
            client,
            url: format!("{}/{}/_doc?refresh=true", host.trim_end_matches('/'), INDEX),
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

#[async_trait]
impl RecordSink for ElasticsearchRecorder {
    fn name(&self) -> &str {
        "elasticsearch"
    }

    async fn record(&self, record: &Record) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .basic_auth(&self.username, Some(&self.password))
            .json(record)
            .send()
            .await
            .context("Error getting response")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("[{}] Error indexing document: {}", status, body);
        }
        Ok(())
    }
}
