//! Probe Daemon
//!
//! Periodically rescans the node and feeds new or changed device snapshots
//! to the add-event handler. Failed devices are retried with exponential
//! backoff while their error is retryable. Devices failing permanently are
//! only attempted again once their snapshot changes.

use super::add_handler::{AddOutcome, EventReport, ProbeEvent};
use crate::config::ProbeConfig;
use crate::error::{Error, ErrorAction, Result};
use crate::hardware::{BlockDevice, HardwareScanner};
use backoff::ExponentialBackoffBuilder;
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const INITIAL_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Rescan loop of the probe
pub struct ProbeDaemon {
    scanner: HardwareScanner,
    event: ProbeEvent,
    rescan_interval: Duration,
    max_retry_elapsed: Duration,
    /// Last successfully processed snapshot per device path
    processed: HashMap<String, BlockDevice>,
    ready: Arc<AtomicBool>,
}

impl ProbeDaemon {
    pub fn new(scanner: HardwareScanner, event: ProbeEvent, config: &ProbeConfig) -> Self {
        Self {
            scanner,
            event,
            rescan_interval: config.rescan_interval,
            max_retry_elapsed: config.max_retry_elapsed,
            processed: HashMap::new(),
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag set once the first scan has been processed
    pub fn readiness(&self) -> Arc<AtomicBool> {
        self.ready.clone()
    }

    /// Rescan until cancelled
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        let mut interval = tokio::time::interval(self.rescan_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval = ?self.rescan_interval, "probe daemon started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("probe daemon stopping");
                    return Ok(());
                }
                _ = interval.tick() => {
                    if let Err(e) = self.rescan().await {
                        warn!(error = %e, "rescan failed");
                    }
                }
            }
        }
    }

    /// Scan the node once and process every new or changed device
    pub async fn rescan(&mut self) -> Result<EventReport> {
        let devices = self.scanner.discover().await?;
        let present: HashSet<String> = devices.iter().map(|d| d.dev_path.clone()).collect();
        self.processed.retain(|path, _| present.contains(path));

        let changed: Vec<BlockDevice> = devices
            .into_iter()
            .filter(|d| self.processed.get(&d.dev_path) != Some(d))
            .collect();
        if changed.is_empty() {
            debug!("no device changes");
            self.ready.store(true, Ordering::Relaxed);
            return Ok(EventReport::default());
        }

        info!(count = changed.len(), "processing add events");
        let mut report = self.event.add_block_devices(changed.clone()).await?;

        let this = &*self;
        let retried: Vec<(BlockDevice, Result<AddOutcome>)> =
            stream::iter(std::mem::take(&mut report.failures))
                .then(move |(device, err)| async move {
                    if err.is_retryable() {
                        let result = this.retry(&device).await;
                        (device, result)
                    } else {
                        (device, Err(err))
                    }
                })
                .collect()
                .await;

        for (device, result) in retried {
            match result {
                Ok(outcome) => report.outcomes.push((device.dev_path.clone(), outcome)),
                Err(e) => {
                    error!(device = %device.dev_path, error = %e, "giving up on add event");
                    report.failures.push((device, e));
                }
            }
        }

        let snapshots: HashMap<String, BlockDevice> =
            changed.into_iter().map(|d| (d.dev_path.clone(), d)).collect();
        for (path, _) in &report.outcomes {
            if let Some(device) = snapshots.get(path) {
                self.processed.insert(path.clone(), device.clone());
            }
        }
        // permanent failures wait for the device snapshot to change
        for (device, err) in &report.failures {
            if !err.is_retryable() {
                self.processed.insert(device.dev_path.clone(), device.clone());
            }
        }

        self.ready.store(true, Ordering::Relaxed);
        info!(
            processed = report.outcomes.len(),
            failed = report.failures.len(),
            "rescan complete"
        );
        Ok(report)
    }

    /// Retry one device against fresh resource snapshots
    async fn retry(&self, device: &BlockDevice) -> Result<AddOutcome> {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(INITIAL_RETRY_INTERVAL)
            .with_max_elapsed_time(Some(self.max_retry_elapsed))
            .build();

        backoff::future::retry(policy, || async move {
            debug!(device = %device.dev_path, "retrying add event");
            let list = self
                .event
                .controller()
                .list_block_devices()
                .await
                .map_err(to_backoff)?;
            self.event
                .add_block_device(device.clone(), &list)
                .await
                .map_err(to_backoff)
        })
        .await
    }
}

fn to_backoff(err: Error) -> backoff::Error<Error> {
    match err.action() {
        ErrorAction::RequeueAfter(delay) => backoff::Error::retry_after(err, delay),
        ErrorAction::RequeueWithBackoff => backoff::Error::transient(err),
        ErrorAction::NoRequeue => backoff::Error::permanent(err),
    }
}
