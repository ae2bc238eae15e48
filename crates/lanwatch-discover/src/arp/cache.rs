//! Neighbor cache readers.
//!
//! Reading the ARP table is the only platform-specific step of ARP
//! discovery. Linux exposes it as `/proc/net/arp`; macOS and the BSDs only
//! through `arp -an`. Anything else gets [`UnsupportedReader`].

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use lanwatch_core::{Device, DiscoveryMethod, MacAddress};
use tokio::process::Command;

use crate::error::{DiscoverError, Result};
use crate::scanner::{DeviceSink, ScanContext};

/// One resolved row of the neighbor table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpEntry {
    pub ip: Ipv4Addr,
    pub mac: MacAddress,
    pub interface: Option<String>,
}

impl ArpEntry {
    fn into_device(self) -> Device {
        let device = Device::new(IpAddr::V4(self.ip), DiscoveryMethod::Arp).with_mac(self.mac);
        match self.interface {
            Some(interface) => device.with_extra("arp.interface", interface),
            None => device,
        }
    }
}

/// Source of current neighbor-table entries.
#[async_trait]
pub trait CacheReader: Send + Sync {
    async fn read(&self) -> Result<Vec<ArpEntry>>;
}

/// The reader for the platform this binary was built for.
pub fn platform_reader() -> Arc<dyn CacheReader> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(ProcNetArpReader::default())
    }
    #[cfg(any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd"
    ))]
    {
        Arc::new(ArpCommandReader::default())
    }
    #[cfg(not(any(
        target_os = "linux",
        target_os = "macos",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd"
    )))]
    {
        Arc::new(UnsupportedReader)
    }
}

/// Read the cache once and emit one ARP observation per entry.
/// Returns the addresses that were emitted.
pub async fn read_cache(
    reader: &dyn CacheReader,
    ctx: &ScanContext,
    sink: &DeviceSink,
) -> Result<Vec<Ipv4Addr>> {
    let entries = match ctx.run_until(reader.read()).await {
        Some(entries) => entries?,
        None => return Ok(Vec::new()),
    };

    let mut emitted = Vec::with_capacity(entries.len());
    for entry in entries {
        let ip = entry.ip;
        if !sink.emit(entry.into_device()).await {
            break;
        }
        emitted.push(ip);
    }

    tracing::debug!(entries = emitted.len(), "Read ARP cache");
    Ok(emitted)
}

// ── Linux ─────────────────────────────────────────────────────────

/// Reads the kernel's table from procfs.
#[derive(Debug, Clone)]
pub struct ProcNetArpReader {
    path: PathBuf,
}

impl ProcNetArpReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for ProcNetArpReader {
    fn default() -> Self {
        Self::new("/proc/net/arp")
    }
}

#[async_trait]
impl CacheReader for ProcNetArpReader {
    async fn read(&self) -> Result<Vec<ArpEntry>> {
        let table = tokio::fs::read_to_string(&self.path).await?;
        parse_proc_net_arp(&table)
    }
}

/// Flag bit set on completed entries (`ATF_COM`).
const ATF_COM: u32 = 0x2;

/// Parse the `/proc/net/arp` table.
///
/// ```text
/// IP address       HW type     Flags       HW address            Mask     Device
/// 192.168.1.1      0x1         0x2         aa:bb:cc:dd:ee:ff     *        eth0
/// ```
///
/// Incomplete entries are skipped. Rows that do not parse are skipped too;
/// only a missing header is an error.
pub fn parse_proc_net_arp(table: &str) -> Result<Vec<ArpEntry>> {
    let mut lines = table.lines();
    match lines.next() {
        Some(header) if header.starts_with("IP address") => {}
        _ => return Err(DiscoverError::CacheParse("missing /proc/net/arp header".into())),
    }

    Ok(lines.filter_map(parse_proc_line).collect())
}

fn parse_proc_line(line: &str) -> Option<ArpEntry> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let [ip, _hw_type, flags, mac, _mask, device] = fields.as_slice() else {
        tracing::trace!(line, "Skipping malformed ARP row");
        return None;
    };

    let flags = u32::from_str_radix(flags.trim_start_matches("0x"), 16).ok()?;
    if flags & ATF_COM == 0 {
        return None;
    }

    let mac: MacAddress = mac.parse().ok()?;
    if mac.is_zero() {
        return None;
    }

    Some(ArpEntry {
        ip: ip.parse().ok()?,
        mac,
        interface: Some(device.to_string()),
    })
}

// ── macOS / BSD ───────────────────────────────────────────────────

/// Reads the table by running `arp -an`.
#[derive(Debug, Clone)]
pub struct ArpCommandReader {
    program: String,
}

impl ArpCommandReader {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for ArpCommandReader {
    fn default() -> Self {
        Self::new("arp")
    }
}

#[async_trait]
impl CacheReader for ArpCommandReader {
    async fn read(&self) -> Result<Vec<ArpEntry>> {
        let output = Command::new(&self.program)
            .arg("-an")
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DiscoverError::CacheParse(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        Ok(parse_arp_an(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parse BSD-style `arp -an` output.
///
/// ```text
/// ? (192.168.1.1) at aa:bb:cc:dd:ee:ff on en0 ifscope [ethernet]
/// ? (192.168.1.5) at (incomplete) on en0 ifscope [ethernet]
/// ```
pub fn parse_arp_an(output: &str) -> Vec<ArpEntry> {
    output.lines().filter_map(parse_arp_an_line).collect()
}

fn parse_arp_an_line(line: &str) -> Option<ArpEntry> {
    let open = line.find('(')?;
    let close = open + line[open..].find(')')?;
    let ip: Ipv4Addr = line[open + 1..close].parse().ok()?;

    let mut rest = line[close + 1..].split_whitespace();
    if rest.next()? != "at" {
        return None;
    }
    let mac: MacAddress = rest.next()?.parse().ok()?;
    if mac.is_zero() || mac.is_broadcast() || ip.is_multicast() || ip.is_broadcast() {
        return None;
    }

    let interface = match rest.next() {
        Some("on") => rest.next().map(str::to_string),
        _ => None,
    };

    Some(ArpEntry { ip, mac, interface })
}

// ── Everything else ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedReader;

#[async_trait]
impl CacheReader for UnsupportedReader {
    async fn read(&self) -> Result<Vec<ArpEntry>> {
        Err(DiscoverError::Unsupported {
            what: "ARP cache reading".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;

    const PROC_TABLE: &str = "\
IP address       HW type     Flags       HW address            Mask     Device
192.168.1.1      0x1         0x2         aa:bb:cc:dd:ee:ff     *        eth0
192.168.1.23     0x1         0x0         00:00:00:00:00:00     *        eth0
192.168.1.40     0x1         0x6         02:42:ac:11:00:02     *        docker0
garbage line
";

    const ARP_AN: &str = "\
? (192.168.1.1) at aa:bb:cc:dd:ee:ff on en0 ifscope [ethernet]
? (192.168.1.5) at (incomplete) on en0 ifscope [ethernet]
? (192.168.1.12) at 0:1a:2b:3c:4d:5e on en0 ifscope [ethernet]
? (192.168.1.255) at ff:ff:ff:ff:ff:ff on en0 ifscope [ethernet]
? (224.0.0.251) at 1:0:5e:0:0:fb on en0 ifscope permanent [ethernet]
";

    #[test]
    fn test_parse_proc_net_arp() {
        let entries = parse_proc_net_arp(PROC_TABLE).unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].ip, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(entries[0].mac.to_string(), "aa:bb:cc:dd:ee:ff");
        assert_eq!(entries[0].interface.as_deref(), Some("eth0"));
        assert_eq!(entries[1].interface.as_deref(), Some("docker0"));
    }

    #[test]
    fn test_parse_proc_net_arp_requires_header() {
        assert!(matches!(
            parse_proc_net_arp("192.168.1.1 0x1 0x2 aa:bb:cc:dd:ee:ff * eth0"),
            Err(DiscoverError::CacheParse(_))
        ));
        assert!(parse_proc_net_arp("").is_err());
    }

    #[test]
    fn test_parse_arp_an() {
        let entries = parse_arp_an(ARP_AN);

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].ip, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(entries[1].mac.to_string(), "00:1a:2b:3c:4d:5e");
        assert_eq!(entries[1].interface.as_deref(), Some("en0"));
    }

    #[tokio::test]
    async fn test_proc_reader_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(PROC_TABLE.as_bytes()).unwrap();

        let entries = ProcNetArpReader::new(file.path()).read().await.unwrap();

        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn test_proc_reader_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let reader = ProcNetArpReader::new(dir.path().join("arp"));

        assert!(matches!(reader.read().await, Err(DiscoverError::Io(_))));
    }

    #[tokio::test]
    async fn test_unsupported_reader() {
        let err = UnsupportedReader.read().await.unwrap_err();
        assert!(matches!(err, DiscoverError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn test_read_cache_emits_devices() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(PROC_TABLE.as_bytes()).unwrap();
        let reader = ProcNetArpReader::new(file.path());

        let ctx = ScanContext::new(Duration::from_secs(5));
        let (tx, mut rx) = mpsc::channel(8);
        let sink = DeviceSink::new(tx, ctx.clone());

        let emitted = read_cache(&reader, &ctx, &sink).await.unwrap();
        drop(sink);

        assert_eq!(
            emitted,
            vec![Ipv4Addr::new(192, 168, 1, 1), Ipv4Addr::new(192, 168, 1, 40)]
        );
        let first = rx.recv().await.unwrap();
        assert_eq!(first.key(), "192.168.1.1");
        assert!(first.methods.contains(&DiscoveryMethod::Arp));
        assert_eq!(first.extra_data["arp.interface"], "eth0");
        assert_eq!(rx.recv().await.unwrap().key(), "192.168.1.40");
        assert!(rx.recv().await.is_none());
    }
}
