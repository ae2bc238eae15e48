//! Discovery engine.
//!
//! Runs every registered scanner concurrently under one deadline and merges
//! their observations into a single arrival-ordered stream. A scanner that
//! fails, panics, or overstays the deadline is reported and otherwise
//! ignored; whatever the others found is still delivered.

use std::sync::Arc;
use std::time::Duration;

use lanwatch_core::{Device, MacAddress};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;
use crate::net::{LocalNetwork, NetworkResolver, SystemResolver};
use crate::scanner::{DeviceSink, ScanContext, Scanner};

/// Default session deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long scanners get to return after the deadline before being aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(100);

const SINK_CAPACITY: usize = 256;

/// Callback invoked with the local network at the start of every session.
pub type SubnetHook = Arc<dyn Fn(&LocalNetwork) + Send + Sync>;

/// Maps a MAC address to a hardware vendor name.
pub trait VendorLookup: Send + Sync {
    fn vendor(&self, mac: &MacAddress) -> Option<String>;
}

/// A scanner that did not complete its part of a session cleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannerFailure {
    pub scanner: &'static str,
    pub error: String,
}

/// Outcome of one engine session.
#[derive(Debug)]
pub struct SessionReport {
    pub session_id: Uuid,
    /// Observations in arrival order. The same IP may appear more than once.
    pub devices: Vec<Device>,
    pub failures: Vec<ScannerFailure>,
    pub elapsed: Duration,
}

pub struct Engine {
    scanners: Vec<Arc<dyn Scanner>>,
    timeout: Duration,
    subnet_hook: Option<SubnetHook>,
    vendors: Option<Arc<dyn VendorLookup>>,
    resolver: Arc<dyn NetworkResolver>,
}

impl Engine {
    pub fn new(scanners: Vec<Arc<dyn Scanner>>) -> Self {
        Self {
            scanners,
            timeout: DEFAULT_TIMEOUT,
            subnet_hook: None,
            vendors: None,
            resolver: Arc::new(SystemResolver::default()),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Invoke `hook` with the resolved local network once per session.
    pub fn with_subnet_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&LocalNetwork) + Send + Sync + 'static,
    {
        self.subnet_hook = Some(Arc::new(hook));
        self
    }

    pub fn with_vendor_lookup(mut self, vendors: Arc<dyn VendorLookup>) -> Self {
        self.vendors = Some(vendors);
        self
    }

    pub fn with_network_resolver(mut self, resolver: Arc<dyn NetworkResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn scanner_names(&self) -> Vec<&'static str> {
        self.scanners.iter().map(|s| s.name()).collect()
    }

    /// Run one session and collect its observations.
    pub async fn run(&self) -> SessionReport {
        self.stream(&CancellationToken::new(), |_| {}).await
    }

    /// Run one session, handing each observation to `on_device` as it
    /// arrives. The session ends when every scanner has returned, the
    /// timeout elapses, or `shutdown` is cancelled.
    pub async fn stream<F>(&self, shutdown: &CancellationToken, mut on_device: F) -> SessionReport
    where
        F: FnMut(&Device),
    {
        let session_id = Uuid::new_v4();
        let started = Instant::now();
        let ctx = self.session_context(shutdown);

        tracing::debug!(
            session_id = %session_id,
            scanners = ?self.scanner_names(),
            timeout_ms = self.timeout.as_millis(),
            "Starting discovery session"
        );

        let (tx, mut rx) = mpsc::channel(SINK_CAPACITY);
        let handles: Vec<(&'static str, JoinHandle<Result<()>>)> = self
            .scanners
            .iter()
            .map(|scanner| {
                let scanner = scanner.clone();
                let ctx = ctx.clone();
                let sink = DeviceSink::new(tx.clone(), ctx.clone());
                let name = scanner.name();
                (name, tokio::spawn(async move { scanner.scan(&ctx, &sink).await }))
            })
            .collect();
        drop(tx);

        let mut devices = Vec::new();
        {
            let done = ctx.done();
            tokio::pin!(done);
            loop {
                tokio::select! {
                    received = rx.recv() => match received {
                        Some(mut device) => {
                            self.enrich(&mut device);
                            on_device(&device);
                            devices.push(device);
                        }
                        // Every sink is gone: all scanners returned.
                        None => break,
                    },
                    _ = &mut done => break,
                }
            }
        }

        // Anything still in flight belongs to a session that is over.
        ctx.cancel();
        rx.close();
        drop(rx);

        let failures = collect_failures(handles).await;
        let elapsed = started.elapsed();

        tracing::info!(
            session_id = %session_id,
            devices = devices.len(),
            failed = failures.len(),
            duration_ms = elapsed.as_millis(),
            "Discovery session complete"
        );

        SessionReport {
            session_id,
            devices,
            failures,
            elapsed,
        }
    }

    fn session_context(&self, shutdown: &CancellationToken) -> ScanContext {
        let ctx = ScanContext::child_of(shutdown, self.timeout);

        match self.resolver.resolve() {
            Ok(network) => {
                if let Some(hook) = &self.subnet_hook {
                    hook(&network);
                }
                ctx.with_network(network)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not resolve local network");
                ctx
            }
        }
    }

    fn enrich(&self, device: &mut Device) {
        if device.vendor.is_some() {
            return;
        }
        if let (Some(vendors), Some(mac)) = (&self.vendors, device.mac.as_ref()) {
            device.vendor = vendors.vendor(mac);
        }
    }
}

/// Wait briefly for every scanner task and record the ones that failed.
async fn collect_failures(handles: Vec<(&'static str, JoinHandle<Result<()>>)>) -> Vec<ScannerFailure> {
    let grace = Instant::now() + SHUTDOWN_GRACE;
    let mut failures = Vec::new();

    for (scanner, mut handle) in handles {
        let error = match tokio::time::timeout_at(grace, &mut handle).await {
            Ok(Ok(Ok(()))) => continue,
            Ok(Ok(Err(e))) => e.to_string(),
            Ok(Err(join_err)) => format!("scanner task failed: {join_err}"),
            Err(_) => {
                handle.abort();
                "did not stop after the session deadline".to_string()
            }
        };

        tracing::warn!(scanner, error = %error, "Scanner failed");
        failures.push(ScannerFailure { scanner, error });
    }

    failures
}
