//! Application context.
//!
//! Owns every component, built leaves first. Child tasks receive handles
//! from here rather than reaching for process globals, and `stop` tears
//! the graph down in reverse creation order.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use arc_swap::ArcSwap;
use tokio::sync::watch;
use tracing::info;

use crate::broker::FanOutBroker;
use crate::config::AppConfig;
use crate::health::{FailoverLatch, HealthMonitor};
use crate::limits::RateLimiterRegistry;
use crate::policy::{CapabilityPolicy, CapabilityProfile, Credentials};
use crate::storage::{AnalyticsSink, StreamSink};
use crate::symbols::SymbolManager;
use crate::upstream::{CatalogClient, IngestSupervisor};

pub struct AppContext {
    pub config: AppConfig,
    pub limiters: Arc<RateLimiterRegistry>,
    pub sink: Arc<StreamSink>,
    pub analytics: Arc<AnalyticsSink>,
    pub catalog: Arc<CatalogClient>,
    pub symbols: Arc<SymbolManager>,
    pub broker: Arc<FanOutBroker>,
    pub failover: Arc<FailoverLatch>,
    pub supervisor: Arc<IngestSupervisor>,
    pub policy: Arc<CapabilityPolicy>,
    pub health: Arc<HealthMonitor>,
    stop_tx: watch::Sender<bool>,
}

impl AppContext {
    pub async fn build(config: AppConfig) -> Result<Arc<Self>> {
        let (stop_tx, _) = watch::channel(false);

        let credentials = Credentials::from_parts(
            config.bitget.api_key.clone(),
            config.bitget.secret_key.clone(),
            config.bitget.passphrase.clone(),
        );
        let profile = Arc::new(ArcSwap::from_pointee(CapabilityProfile::for_credentials(
            &credentials,
        )));

        let limiters = Arc::new(RateLimiterRegistry::new());
        let failover = Arc::new(FailoverLatch::new());

        let sink = Arc::new(
            StreamSink::connect(
                &config.redis,
                config.tls.verify,
                config.system.dedup_window_secs,
            )
            .await
            .context("connect stream sink")?,
        );
        let analytics =
            Arc::new(AnalyticsSink::new(&config.clickhouse).context("build analytics sink")?);

        let catalog_limiter = limiters.get("catalog", profile.load().max_rps);
        let catalog = Arc::new(
            CatalogClient::new(
                config.bitget.rest_base_url.clone(),
                credentials.clone(),
                catalog_limiter,
            )
            .context("build catalog client")?,
        );

        let symbols = Arc::new(SymbolManager::new(
            catalog.clone(),
            config.system.min_volume_24h,
            config.system.max_symbols_per_market,
        ));

        let broker = FanOutBroker::new(
            config.system.broker_batch_interval_ms,
            config.system.broker_debounce_ms,
        );

        let supervisor = IngestSupervisor::new(
            sink.clone(),
            broker.clone(),
            limiters.clone(),
            failover.clone(),
            symbols.clone(),
            profile.clone(),
        );

        let policy = Arc::new(CapabilityPolicy::new(
            credentials,
            profile,
            catalog.clone(),
            limiters.clone(),
            symbols.clone(),
            supervisor.clone(),
        ));

        let health = HealthMonitor::new(
            sink.clone(),
            analytics.clone(),
            catalog.clone(),
            limiters.clone(),
            failover.clone(),
            config.system.health_interval_secs,
        );

        Ok(Arc::new(Self {
            config,
            limiters,
            sink,
            analytics,
            catalog,
            symbols,
            broker,
            failover,
            supervisor,
            policy,
            health,
            stop_tx,
        }))
    }

    /// Brings the pipeline up: working set, fan-out flusher, upstream
    /// sessions, health supervision.
    pub async fn start(&self) -> Result<()> {
        let profile = self.policy.profile();
        self.symbols
            .reconcile(&profile.markets)
            .await
            .context("initial symbol selection")?;

        tokio::spawn(self.broker.clone().run_flusher(self.stop_tx.subscribe()));
        self.supervisor.start().await;
        tokio::spawn(self.health.clone().run(self.stop_tx.subscribe()));

        info!(
            "🎉 Pipeline operational - tier {}, {} markets, {} symbols",
            profile.tier,
            profile.markets.len(),
            self.symbols.total_symbols()
        );
        Ok(())
    }

    /// Reverse creation order: health loop and flusher observe the stop
    /// signal, then the upstream sessions drain.
    pub async fn stop(&self) {
        info!("Stopping pipeline");
        let _ = self.stop_tx.send(true);
        self.supervisor.stop_all().await;
        info!("Pipeline stopped");
    }
}
