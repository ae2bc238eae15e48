//! The scanner contract.
//!
//! Every discovery method implements [`Scanner`]. The engine runs all of
//! them concurrently under one [`ScanContext`] and collects what they emit
//! through a shared [`DeviceSink`].

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use lanwatch_core::Device;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::net::LocalNetwork;

/// A pluggable discovery strategy.
#[async_trait]
pub trait Scanner: Send + Sync {
    /// Short identifier used in logs and failure reports.
    fn name(&self) -> &'static str;

    /// Emit discovered devices into `sink` until done or `ctx` expires.
    ///
    /// Implementations must return promptly once `ctx` is done, whether or
    /// not they found anything.
    async fn scan(&self, ctx: &ScanContext, sink: &DeviceSink) -> Result<()>;
}

/// Deadline and cancellation shared by every scanner in one session.
#[derive(Debug, Clone)]
pub struct ScanContext {
    deadline: Instant,
    cancel: CancellationToken,
    network: Option<LocalNetwork>,
}

impl ScanContext {
    /// A standalone context expiring `timeout` from now.
    pub fn new(timeout: Duration) -> Self {
        Self::child_of(&CancellationToken::new(), timeout)
    }

    /// A context expiring after `timeout`, or earlier if `parent` is cancelled.
    pub fn child_of(parent: &CancellationToken, timeout: Duration) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            cancel: parent.child_token(),
            network: None,
        }
    }

    pub fn with_network(mut self, network: LocalNetwork) -> Self {
        self.network = Some(network);
        self
    }

    /// The local network resolved for this session, if resolution succeeded.
    pub fn network(&self) -> Option<&LocalNetwork> {
        self.network.as_ref()
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_done(&self) -> bool {
        self.cancel.is_cancelled() || Instant::now() >= self.deadline
    }

    /// End the session early.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Resolves once the deadline passes or the context is cancelled.
    pub async fn done(&self) {
        tokio::select! {
            _ = tokio::time::sleep_until(self.deadline) => {}
            _ = self.cancel.cancelled() => {}
        }
    }

    /// Drive `fut` until it completes or the context is done.
    pub async fn run_until<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            out = fut => Some(out),
            _ = self.done() => None,
        }
    }
}

/// Write side of a session's observation stream.
#[derive(Debug, Clone)]
pub struct DeviceSink {
    tx: mpsc::Sender<Device>,
    ctx: ScanContext,
}

impl DeviceSink {
    pub fn new(tx: mpsc::Sender<Device>, ctx: ScanContext) -> Self {
        Self { tx, ctx }
    }

    /// Queue a device for the session.
    ///
    /// Returns `false` once the session no longer accepts observations,
    /// which is the scanner's cue to stop.
    pub async fn emit(&self, device: Device) -> bool {
        if self.ctx.is_done() {
            return false;
        }
        matches!(self.ctx.run_until(self.tx.send(device)).await, Some(Ok(())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanwatch_core::DiscoveryMethod;

    fn device(ip: &str) -> Device {
        Device::parse(ip, DiscoveryMethod::Arp).unwrap()
    }

    #[tokio::test]
    async fn test_done_resolves_at_deadline() {
        let ctx = ScanContext::new(Duration::from_millis(20));
        assert!(!ctx.is_done());

        ctx.done().await;

        assert!(ctx.is_done());
        assert_eq!(ctx.remaining(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_parent_cancellation_propagates() {
        let parent = CancellationToken::new();
        let ctx = ScanContext::child_of(&parent, Duration::from_secs(60));

        parent.cancel();

        assert!(ctx.is_done());
        assert!(ctx.run_until(std::future::pending::<()>()).await.is_none());
    }

    #[tokio::test]
    async fn test_cancelling_context_leaves_parent_alone() {
        let parent = CancellationToken::new();
        let ctx = ScanContext::child_of(&parent, Duration::from_secs(60));

        ctx.cancel();

        assert!(ctx.is_done());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn test_sink_stops_after_context_done() {
        let ctx = ScanContext::new(Duration::from_secs(5));
        let (tx, mut rx) = mpsc::channel(4);
        let sink = DeviceSink::new(tx, ctx.clone());

        assert!(sink.emit(device("10.0.0.1")).await);
        ctx.cancel();
        assert!(!sink.emit(device("10.0.0.2")).await);

        assert_eq!(rx.recv().await.unwrap().key(), "10.0.0.1");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sink_send_on_full_channel_gives_up_at_deadline() {
        let ctx = ScanContext::new(Duration::from_millis(30));
        let (tx, _rx) = mpsc::channel(1);
        let sink = DeviceSink::new(tx, ctx);

        assert!(sink.emit(device("10.0.0.1")).await);
        // Channel is full and nobody reads; the deadline must unblock us.
        assert!(!sink.emit(device("10.0.0.2")).await);
    }

    #[tokio::test]
    async fn test_sink_reports_closed_receiver() {
        let ctx = ScanContext::new(Duration::from_secs(5));
        let (tx, rx) = mpsc::channel(1);
        let sink = DeviceSink::new(tx, ctx);
        drop(rx);

        assert!(!sink.emit(device("10.0.0.1")).await);
    }
}
