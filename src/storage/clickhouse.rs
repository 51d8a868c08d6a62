//! Analytical store boundary.
//!
//! The store's internals are an external concern; this module carries only
//! the contract the pipeline needs: a cheap liveness probe and an
//! append-only bulk insert into the partitioned raw-trades table.
//! Duplicate suppression is handled by replacing engines on the store side.

use anyhow::{Context, Result};
use std::time::Duration;
use tracing::debug;

use crate::config::ClickHouseConfig;
use crate::models::Trade;

pub struct AnalyticsSink {
    http: reqwest::Client,
    base_url: String,
    database: String,
    username: String,
    password: String,
    batch_size: usize,
}

impl AnalyticsSink {
    pub fn new(cfg: &ClickHouseConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("build clickhouse http client")?;

        Ok(Self {
            http,
            base_url: cfg.base_url(),
            database: cfg.database.clone(),
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            batch_size: cfg.batch_size,
        })
    }

    /// Real liveness probe. An unreachable store is unhealthy, never
    /// assumed fine.
    pub async fn ping(&self) -> bool {
        let url = format!("{}/ping", self.base_url);
        match self.http.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(error = %e, "analytics store ping failed");
                false
            }
        }
    }

    /// Appends raw trades in batches. Rows are keyed on the store side by
    /// (symbol, market, minute bucket, trade id).
    pub async fn insert_trades(&self, rows: &[Trade]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        for chunk in rows.chunks(self.batch_size) {
            let mut body = String::with_capacity(chunk.len() * 128);
            for row in chunk {
                body.push_str(&serde_json::to_string(row)?);
                body.push('\n');
            }

            let query = format!(
                "INSERT INTO {}.trades_raw FORMAT JSONEachRow",
                self.database
            );
            let resp = self
                .http
                .post(&self.base_url)
                .query(&[("query", query.as_str())])
                .basic_auth(&self.username, Some(&self.password))
                .body(body)
                .send()
                .await
                .context("clickhouse insert request")?;

            if !resp.status().is_success() {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                anyhow::bail!("clickhouse insert failed {status}: {text}");
            }
        }
        Ok(())
    }
}
