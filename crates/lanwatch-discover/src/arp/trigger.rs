//! ARP active triggering.
//!
//! Sending ARP requests directly needs raw sockets, so we provoke the kernel
//! into resolving link-layer addresses itself: any unicast UDP write or TCP
//! connect to an on-link address makes the OS ARP for it first, and the
//! answer lands in the neighbor cache whether or not anything is listening.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::SweepConfig;
use crate::net::LocalNetwork;
use crate::scanner::ScanContext;

/// Ceiling on simultaneous stimulation workers.
pub const MAX_CONCURRENT_TRIGGERS: usize = 200;

/// Shared write deadline for one target's UDP triggers.
const TRIGGER_DEADLINE: Duration = Duration::from_millis(1200);
const TCP_DIAL_TIMEOUT: Duration = Duration::from_millis(300);
/// Upper bound on the per-cycle refresh.
const REFRESH_BUDGET: Duration = Duration::from_millis(500);

/// Only /24 networks are swept.
const SWEEP_PREFIX_LEN: u8 = 24;

const UDP_TRIGGER_PORTS: [u16; 3] = [9, 1900, 5353];
const TCP_TRIGGER_PORTS: [u16; 5] = [80, 443, 22, 554, 8009];

/// Something that makes the OS resolve a neighbor's link-layer address.
#[async_trait]
pub trait Stimulus: Send + Sync {
    /// Full stimulation used by subnet sweeps.
    async fn stimulate(&self, ip: Ipv4Addr);

    /// Cheaper stimulation used between sweeps.
    async fn refresh(&self, ip: Ipv4Addr);
}

/// Stimulation through ordinary, unprivileged sockets.
#[derive(Debug, Default, Clone, Copy)]
pub struct SocketStimulus;

#[async_trait]
impl Stimulus for SocketStimulus {
    async fn stimulate(&self, ip: Ipv4Addr) {
        send_arp_target(ip).await;
    }

    async fn refresh(&self, ip: Ipv4Addr) {
        send_udp_triggers(ip, Instant::now() + TRIGGER_DEADLINE).await;
    }
}

/// Poke `ip` over UDP and TCP so its MAC ends up in the neighbor cache.
/// Every attempt is time-boxed and every error is ignored.
pub async fn send_arp_target(ip: Ipv4Addr) {
    send_udp_triggers(ip, Instant::now() + TRIGGER_DEADLINE).await;

    for port in TCP_TRIGGER_PORTS {
        let addr = SocketAddrV4::new(ip, port);
        if let Ok(Ok(stream)) = tokio::time::timeout(TCP_DIAL_TIMEOUT, TcpStream::connect(addr)).await {
            drop(stream);
        }
    }
}

async fn send_udp_triggers(ip: Ipv4Addr, deadline: Instant) {
    for port in UDP_TRIGGER_PORTS {
        let addr = SocketAddrV4::new(ip, port);
        if let Ok(Err(e)) = tokio::time::timeout_at(deadline, udp_poke(addr)).await {
            tracing::trace!(%addr, error = %e, "UDP trigger failed");
        }
    }
}

async fn udp_poke(addr: SocketAddrV4) -> std::io::Result<()> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.connect(addr).await?;
    socket.send(&[0]).await?;
    Ok(())
}

/// Every host address of the network except the local one.
///
/// Network and broadcast addresses are excluded, so a /24 yields 254
/// addresses, or 253 when the local address falls inside it.
pub fn candidate_hosts(network: &LocalNetwork) -> Vec<Ipv4Addr> {
    let local = network.local_ip();
    network.subnet().hosts().filter(|ip| *ip != local).collect()
}

/// Stimulate every target through `stimulus` with at most `max_concurrent`
/// workers in flight. Stops dispatching once `cancel` fires, but lets
/// in-flight workers finish. Returns how many targets were dispatched.
pub async fn sweep(
    targets: Vec<Ipv4Addr>,
    stimulus: Arc<dyn Stimulus>,
    max_concurrent: usize,
    cancel: CancellationToken,
) -> usize {
    fan_out(targets, max_concurrent, cancel, move |ip| {
        let stimulus = stimulus.clone();
        async move { stimulus.stimulate(ip).await }
    })
    .await
}

async fn fan_out<F, Fut>(
    targets: Vec<Ipv4Addr>,
    max_concurrent: usize,
    cancel: CancellationToken,
    work: F,
) -> usize
where
    F: Fn(Ipv4Addr) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
    let mut workers = JoinSet::new();
    let mut dispatched = 0;

    for ip in targets {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let job = work(ip);
        workers.spawn(async move {
            // Held until the worker ends, however it ends.
            let _permit = permit;
            job.await;
        });
        dispatched += 1;
    }

    while workers.join_next().await.is_some() {}
    dispatched
}

#[derive(Debug, Default)]
struct SweepState {
    /// Latched by the first sweep and never cleared.
    started: bool,
    running: bool,
}

/// Owns the full-subnet sweep: runs it at most once per sweeper, detached
/// from the caller, and can cancel and join it on shutdown.
pub struct Sweeper {
    timeout: Duration,
    max_concurrent: usize,
    stimulus: Arc<dyn Stimulus>,
    state: Arc<Mutex<SweepState>>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl Sweeper {
    /// `timeout` bounds dispatching of the sweep. Workers already in flight
    /// when it fires run to their own deadlines.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            max_concurrent: MAX_CONCURRENT_TRIGGERS,
            stimulus: Arc::new(SocketStimulus),
            state: Arc::default(),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn from_config(config: &SweepConfig) -> Self {
        Self::new(config.timeout()).with_max_concurrent(config.max_concurrent)
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    pub fn with_stimulus(mut self, stimulus: Arc<dyn Stimulus>) -> Self {
        self.stimulus = stimulus;
        self
    }

    /// Subnet hook: sweep `network` unless a sweep has already been started.
    pub fn trigger(&self, network: &LocalNetwork) {
        self.start(network);
    }

    /// Start the detached sweep of `network`. Only the first successful call
    /// sweeps; every later call returns `false`. Returns whether a sweep was
    /// started.
    pub fn start(&self, network: &LocalNetwork) -> bool {
        if network.prefix_len() != SWEEP_PREFIX_LEN {
            tracing::debug!(
                subnet = %network.subnet(),
                prefix = network.prefix_len(),
                "Skipping ARP trigger, not a /24 network"
            );
            return false;
        }
        if self.cancel.is_cancelled() {
            return false;
        }

        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.started {
                return false;
            }
            state.started = true;
            state.running = true;
        }

        let targets = candidate_hosts(network);
        let subnet = network.subnet();
        let stimulus = self.stimulus.clone();
        let state = self.state.clone();
        let cancel = self.cancel.child_token();
        let (timeout, max_concurrent) = (self.timeout, self.max_concurrent);

        tracing::info!(subnet = %subnet, targets = targets.len(), "Triggering ARP requests for subnet");

        self.tracker.spawn(async move {
            let started = Instant::now();
            let work = sweep(targets, stimulus, max_concurrent, cancel.clone());
            tokio::pin!(work);

            // On timeout stop dispatching, then let in-flight workers finish.
            let (dispatched, timed_out) = tokio::select! {
                dispatched = &mut work => (dispatched, false),
                _ = tokio::time::sleep(timeout) => {
                    cancel.cancel();
                    (work.await, true)
                }
            };

            tracing::debug!(
                subnet = %subnet,
                dispatched,
                timed_out,
                duration_ms = started.elapsed().as_millis(),
                "ARP triggering completed"
            );
            state.lock().unwrap_or_else(PoisonError::into_inner).running = false;
        });

        true
    }

    /// Lightly re-stimulate `targets` before a cache read. Bounded by the
    /// refresh budget and by the session deadline.
    pub async fn refresh(&self, targets: Vec<Ipv4Addr>, ctx: &ScanContext) {
        if targets.is_empty() || ctx.is_done() {
            return;
        }

        let budget = REFRESH_BUDGET.min(ctx.remaining());
        let stimulus = self.stimulus.clone();
        let count = targets.len();
        let work = fan_out(targets, self.max_concurrent, self.cancel.child_token(), move |ip| {
            let stimulus = stimulus.clone();
            async move { stimulus.refresh(ip).await }
        });

        if tokio::time::timeout(budget, work).await.is_err() {
            tracing::trace!(targets = count, "ARP refresh cut short");
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).running
    }

    /// Stop dispatching new targets and wait for running sweeps to drain.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}
