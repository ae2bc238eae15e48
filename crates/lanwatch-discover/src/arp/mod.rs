//! ARP-based discovery.
//!
//! The first scan kicks off a detached sweep of the whole /24 so the kernel
//! learns every neighbor; each later scan lightly re-stimulates the hosts
//! already known. Both then read whatever the neighbor cache holds.

pub mod cache;
pub mod trigger;

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use crate::error::Result;
use crate::net::LocalNetwork;
use crate::scanner::{DeviceSink, ScanContext, Scanner};

pub use cache::{platform_reader, ArpEntry, CacheReader};
pub use trigger::{Stimulus, Sweeper};

pub struct ArpScanner {
    sweeper: Arc<Sweeper>,
    reader: Arc<dyn CacheReader>,
    /// Set once the first scan has requested the full sweep.
    first_run_done: Mutex<bool>,
    known: Mutex<BTreeSet<Ipv4Addr>>,
}

impl ArpScanner {
    pub fn new(sweeper: Arc<Sweeper>) -> Self {
        Self {
            sweeper,
            reader: platform_reader(),
            first_run_done: Mutex::new(false),
            known: Mutex::default(),
        }
    }

    pub fn with_reader(mut self, reader: Arc<dyn CacheReader>) -> Self {
        self.reader = reader;
        self
    }

    /// True exactly once per scanner.
    fn claim_first_run(&self) -> bool {
        let mut done = self.first_run_done.lock().unwrap_or_else(PoisonError::into_inner);
        !std::mem::replace(&mut *done, true)
    }

    fn known_hosts(&self) -> Vec<Ipv4Addr> {
        let known = self.known.lock().unwrap_or_else(PoisonError::into_inner);
        known.iter().copied().collect()
    }

    /// Replace the refresh set with the latest cache read, limited to the
    /// local subnet when it is known.
    fn remember(&self, ips: Vec<Ipv4Addr>, network: Option<&LocalNetwork>) {
        let subnet = network.map(LocalNetwork::subnet);
        let mut known = self.known.lock().unwrap_or_else(PoisonError::into_inner);
        *known = ips
            .into_iter()
            .filter(|ip| subnet.map_or(true, |net| net.contains(ip)))
            .collect();
    }
}

#[async_trait]
impl Scanner for ArpScanner {
    fn name(&self) -> &'static str {
        "arp"
    }

    async fn scan(&self, ctx: &ScanContext, sink: &DeviceSink) -> Result<()> {
        if self.claim_first_run() {
            match ctx.network() {
                Some(network) => {
                    tracing::info!(
                        scanner = self.name(),
                        network = %network,
                        "First ARP scan, triggering full subnet sweep"
                    );
                    self.sweeper.start(network);
                }
                None => tracing::warn!(
                    scanner = self.name(),
                    "Could not get local network for ARP trigger"
                ),
            }
        } else {
            self.sweeper.refresh(self.known_hosts(), ctx).await;
        }

        let emitted = cache::read_cache(self.reader.as_ref(), ctx, sink).await?;
        self.remember(emitted, ctx.network());
        Ok(())
    }
}
