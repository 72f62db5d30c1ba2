use crate::config::Config;
use crate::dedup::DedupIndex;
use crate::media::MediaPipeline;
use crate::orchestrator::{SyncOrchestrator, SyncResources};
use crate::shutdown::sleep_or_cancel;
use crate::traits::SourceFeed;
use crate::types::{CycleReport, Result};
use crate::watermark::WatermarkStore;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Totals over one pass across every configured account
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub accounts: usize,
    pub failed_accounts: usize,
    pub published: usize,
    pub renoted: usize,
    pub skipped: usize,
}

impl PassSummary {
    fn add(&mut self, report: &CycleReport) {
        self.published += report.published;
        self.renoted += report.renoted;
        self.skipped += report.skipped;
    }
}

/// Polls every account in turn, one at a time, until shutdown
pub struct MirrorDaemon {
    config: Config,
    resources: SyncResources,
    orchestrators: Vec<SyncOrchestrator>,
    cancel: CancellationToken,
}

impl MirrorDaemon {
    pub async fn new(config: Config, source: Arc<dyn SourceFeed>, cancel: CancellationToken) -> Result<Self> {
        tokio::fs::create_dir_all(&config.storage.data_dir).await?;

        let dedup = DedupIndex::new(&config.storage.dedup_database_url()).await?;
        let resources = SyncResources {
            source,
            dedup: Arc::new(dedup),
            watermarks: Arc::new(WatermarkStore::new(&config.storage.data_dir)),
            media: Arc::new(MediaPipeline::new(config.media.clone(), config.nsfw.clone())?),
        };

        Self::with_resources(config, resources, cancel)
    }

    pub fn with_resources(config: Config, resources: SyncResources, cancel: CancellationToken) -> Result<Self> {
        let orchestrators = config
            .accounts
            .iter()
            .map(|account| SyncOrchestrator::new(account, &config, &resources, cancel.clone()))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            config,
            resources,
            orchestrators,
            cancel,
        })
    }

    /// Log which target account each source account posts as
    pub async fn log_identities(&self) {
        for orchestrator in &self.orchestrators {
            let publisher = orchestrator.publisher();
            match publisher.whoami().await {
                Ok(identity) => info!(
                    "@{} -> @{}@{}",
                    orchestrator.handle(),
                    identity.username,
                    publisher.host()
                ),
                Err(e) => warn!(
                    "@{} -> (could not resolve target account on {}: {})",
                    orchestrator.handle(),
                    publisher.host(),
                    e
                ),
            }
        }
    }

    /// One sequential pass over every account. A failing account is logged
    /// and the pass moves on.
    pub async fn run_pass(&self) -> PassSummary {
        let mut summary = PassSummary::default();

        for orchestrator in &self.orchestrators {
            if self.cancel.is_cancelled() {
                break;
            }
            summary.accounts += 1;

            match orchestrator.run_cycle().await {
                Ok(report) => summary.add(&report),
                Err(e) => {
                    error!("Cycle for @{} failed: {}", orchestrator.handle(), e);
                    summary.failed_accounts += 1;
                }
            }
        }

        info!(
            "Pass done: {} accounts ({} failed), {} published, {} renoted, {} skipped",
            summary.accounts, summary.failed_accounts, summary.published, summary.renoted, summary.skipped
        );
        summary
    }

    /// Run passes until cancelled, or exactly one when `once` is set
    pub async fn run(&self, once: bool) -> Result<()> {
        info!(
            "Mirroring {} accounts via {}",
            self.orchestrators.len(),
            self.resources.source.source_name()
        );
        self.log_identities().await;

        let interval = Duration::from_secs(self.config.crawl.interval_secs);
        loop {
            self.run_pass().await;

            if once {
                break;
            }
            info!("Next pass in {:?}", interval);
            if !sleep_or_cancel(&self.cancel, interval).await {
                break;
            }
        }

        info!("Stopping; {} items indexed", self.resources.dedup.count().await.unwrap_or(-1));
        self.resources.dedup.close().await;
        Ok(())
    }
}
