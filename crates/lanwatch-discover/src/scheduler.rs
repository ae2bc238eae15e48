//! Scan scheduling loop.
//!
//! Runs one engine session right away and then one per interval, folding
//! every observation into the shared [`DeviceStore`] as it arrives. The loop
//! owns the ARP sweeper's lifetime: however it ends, running sweeps are
//! cancelled and joined before it returns.

use std::sync::Arc;

use lanwatch_core::DeviceStore;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::arp::Sweeper;
use crate::engine::{Engine, SessionReport};

/// Periodic discovery feeding a device store.
pub struct ScanLoop {
    engine: Engine,
    store: Arc<DeviceStore>,
    sweeper: Option<Arc<Sweeper>>,
    interval: Duration,
}

impl ScanLoop {
    pub fn new(engine: Engine, store: Arc<DeviceStore>, interval: Duration) -> Self {
        Self {
            engine,
            store,
            sweeper: None,
            interval,
        }
    }

    /// Shut `sweeper` down when the loop exits.
    pub fn with_sweeper(mut self, sweeper: Arc<Sweeper>) -> Self {
        self.sweeper = Some(sweeper);
        self
    }

    pub fn store(&self) -> &Arc<DeviceStore> {
        &self.store
    }

    /// Run a single session, upserting each observation as it arrives.
    pub async fn run_once(&self, shutdown: &CancellationToken) -> SessionReport {
        let report = self
            .engine
            .stream(shutdown, |device| {
                self.store.upsert(device.clone());
            })
            .await;

        for failure in &report.failures {
            tracing::debug!(
                session_id = %report.session_id,
                scanner = failure.scanner,
                error = %failure.error,
                "Scanner did not complete"
            );
        }

        report
    }

    /// Scan until `shutdown` is cancelled. Returns the number of completed
    /// cycles.
    pub async fn run(&self, shutdown: CancellationToken) -> usize {
        // `interval` panics on a zero period.
        let mut ticker = interval(self.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            interval_secs = self.interval.as_secs(),
            scanners = ?self.engine.scanner_names(),
            "Scan loop started"
        );

        let mut cycles = 0;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let report = self.run_once(&shutdown).await;
            cycles += 1;

            tracing::info!(
                cycle = cycles,
                observed = report.devices.len(),
                known = self.store.len(),
                duration_ms = report.elapsed.as_millis(),
                "Scan cycle complete"
            );
        }

        if let Some(sweeper) = &self.sweeper {
            sweeper.shutdown().await;
        }

        tracing::info!(cycles, "Scan loop stopped");
        cycles
    }
}
