//! CLI entry point for the lanwatch LAN discovery engine.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use lanwatch_core::{Device, DeviceStore};

use lanwatch_discover::arp::{ArpScanner, Sweeper};
use lanwatch_discover::config::DiscoverConfig;
use lanwatch_discover::engine::Engine;
use lanwatch_discover::mdns::MdnsScanner;
use lanwatch_discover::net::SystemResolver;
use lanwatch_discover::scanner::Scanner;
use lanwatch_discover::scheduler::ScanLoop;
use lanwatch_discover::ssdp::SsdpScanner;

#[derive(Parser)]
#[command(name = "lanwatch-discover")]
#[command(about = "Discover devices on the local network without elevated privileges")]
struct Cli {
    /// Run a single discovery session, print the devices found, and exit.
    #[arg(long)]
    once: bool,

    /// Rescan on an interval until interrupted.
    #[arg(long)]
    daemon: bool,

    /// Print results (and, in daemon mode, logs) as JSON.
    #[arg(long)]
    json: bool,

    /// Interface to scan from (otherwise chosen automatically).
    #[arg(short, long)]
    interface: Option<String>,

    /// Override the session deadline, in milliseconds.
    #[arg(long)]
    duration_ms: Option<u64>,

    /// Config file prefix (default: lanwatch).
    #[arg(short, long, default_value = "lanwatch")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.json {
        fmt().with_env_filter(filter).json().init();
    } else {
        fmt().with_env_filter(filter).init();
    }

    let mut config = DiscoverConfig::load(&cli.config)?;
    if let Some(interface) = cli.interface.clone() {
        config.interface = Some(interface);
    }
    if let Some(duration_ms) = cli.duration_ms {
        config.scan_duration_ms = duration_ms;
    }

    if !cli.once && !cli.daemon {
        anyhow::bail!("Specify --once (single session) or --daemon (continuous scanning)");
    }

    let sweeper = Arc::new(Sweeper::from_config(&config.sweep));
    let engine = build_engine(&config, sweeper.clone())?;
    let store = Arc::new(DeviceStore::new());
    let scan_loop =
        ScanLoop::new(engine, store.clone(), config.scan_interval()).with_sweeper(sweeper.clone());

    if cli.once {
        let report = scan_loop.run_once(&CancellationToken::new()).await;
        sweeper.shutdown().await;

        for failure in &report.failures {
            tracing::warn!(scanner = failure.scanner, error = %failure.error, "Scanner failed");
        }
        print_devices(&store.snapshot(), report.elapsed, cli.json)?;
    } else {
        store.add_listener(|device: &Device| {
            tracing::info!(
                ip = %device.ip,
                mac = %device.mac.map(|m| m.to_string()).unwrap_or_default(),
                hostname = ?device.hostname,
                vendor = ?device.vendor,
                methods = ?device.methods,
                "Device updated"
            );
        });

        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl-C");
                return;
            }
            tracing::info!("Shutdown requested");
            signal.cancel();
        });

        scan_loop.run(shutdown).await;
        tracing::info!(devices = store.len(), "Exiting");
    }

    Ok(())
}

fn build_engine(config: &DiscoverConfig, sweeper: Arc<Sweeper>) -> anyhow::Result<Engine> {
    let mut scanners: Vec<Arc<dyn Scanner>> = Vec::new();
    if config.scanners.arp.enabled {
        scanners.push(Arc::new(ArpScanner::new(sweeper.clone())));
    }
    if config.scanners.ssdp.enabled {
        scanners.push(Arc::new(SsdpScanner::new()));
    }
    if config.scanners.mdns.enabled {
        scanners.push(Arc::new(MdnsScanner::new()));
    }
    if scanners.is_empty() {
        anyhow::bail!("Every scanner is disabled in the configuration");
    }

    let resolver = match &config.interface {
        Some(name) => SystemResolver::with_interface(name),
        None => SystemResolver::default(),
    };

    let mut engine = Engine::new(scanners)
        .with_timeout(config.scan_duration())
        .with_network_resolver(Arc::new(resolver));

    // The sweeper latches its single full sweep, so the hook and the ARP
    // scanner's first run cannot both sweep.
    if config.scanners.arp.enabled {
        engine = engine.with_subnet_hook(move |network| sweeper.trigger(network));
    }

    Ok(engine)
}

fn print_devices(devices: &[Device], elapsed: Duration, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(devices)?);
        return Ok(());
    }

    println!(
        "{:<16} {:<18} {:<28} {:<20} METHODS",
        "IP", "MAC", "HOSTNAME", "VENDOR"
    );
    for device in devices {
        let methods: Vec<String> = device.methods.iter().map(ToString::to_string).collect();
        println!(
            "{:<16} {:<18} {:<28} {:<20} {}",
            device.ip.to_string(),
            device.mac.map(|m| m.to_string()).unwrap_or_else(|| "-".into()),
            device.hostname.as_deref().unwrap_or("-"),
            device.vendor.as_deref().unwrap_or("-"),
            methods.join(",")
        );
    }
    println!("{} device(s) found in {} ms", devices.len(), elapsed.as_millis());
    Ok(())
}
