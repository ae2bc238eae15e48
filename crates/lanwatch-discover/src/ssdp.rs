//! SSDP discovery.
//!
//! Multicasts one `M-SEARCH` for `ssdp:all` and listens for unicast replies
//! until the session ends. Every UPnP device that answers becomes an
//! observation carrying its `SERVER`, `LOCATION` and `ST` headers.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use async_trait::async_trait;
use lanwatch_core::{Device, DiscoveryMethod};
use tokio::net::UdpSocket;

use crate::error::Result;
use crate::scanner::{DeviceSink, ScanContext, Scanner};

const SSDP_MULTICAST: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(239, 255, 255, 250), 1900);

const M_SEARCH: &str = "M-SEARCH * HTTP/1.1\r\n\
HOST: 239.255.255.250:1900\r\n\
MAN: \"ssdp:discover\"\r\n\
MX: 1\r\n\
ST: ssdp:all\r\n\
\r\n";

const RECV_BUFFER: usize = 2048;

/// Headers of interest from one SSDP reply.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SsdpResponse {
    pub server: Option<String>,
    pub location: Option<String>,
    pub st: Option<String>,
    pub usn: Option<String>,
}

impl SsdpResponse {
    fn into_device(self, ip: std::net::IpAddr) -> Device {
        let mut device = Device::new(ip, DiscoveryMethod::Ssdp);
        for (key, value) in [
            ("ssdp.server", self.server),
            ("ssdp.location", self.location),
            ("ssdp.st", self.st),
            ("ssdp.usn", self.usn),
        ] {
            if let Some(value) = value {
                device = device.with_extra(key, value);
            }
        }
        device
    }
}

pub struct SsdpScanner {
    target: SocketAddr,
}

impl SsdpScanner {
    pub fn new() -> Self {
        Self {
            target: SocketAddr::V4(SSDP_MULTICAST),
        }
    }

    /// Send the search to `target` instead of the SSDP multicast group.
    pub fn with_target(target: SocketAddr) -> Self {
        Self { target }
    }
}

impl Default for SsdpScanner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Scanner for SsdpScanner {
    fn name(&self) -> &'static str {
        "ssdp"
    }

    async fn scan(&self, ctx: &ScanContext, sink: &DeviceSink) -> Result<()> {
        let bind: SocketAddr = match self.target {
            SocketAddr::V4(v4) if v4.ip().is_loopback() => (Ipv4Addr::LOCALHOST, 0).into(),
            _ => (Ipv4Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.send_to(M_SEARCH.as_bytes(), self.target).await?;

        let mut buf = [0u8; RECV_BUFFER];
        while let Some(received) = ctx.run_until(socket.recv_from(&mut buf)).await {
            let (len, from) = match received {
                Ok(r) => r,
                Err(e) => {
                    tracing::trace!(scanner = self.name(), error = %e, "SSDP receive failed");
                    continue;
                }
            };

            let Some(response) = parse_response(&String::from_utf8_lossy(&buf[..len])) else {
                continue;
            };
            if !sink.emit(response.into_device(from.ip())).await {
                break;
            }
        }

        Ok(())
    }
}

/// Parse an SSDP search reply or `NOTIFY`. Header names are case-insensitive.
pub fn parse_response(text: &str) -> Option<SsdpResponse> {
    let mut lines = text.lines();
    let status = lines.next()?.trim();
    if !(status.starts_with("HTTP/1.1 200") || status.starts_with("NOTIFY")) {
        return None;
    }

    let mut response = SsdpResponse::default();
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        let slot = match name.trim().to_ascii_lowercase().as_str() {
            "server" => &mut response.server,
            "location" => &mut response.location,
            "st" | "nt" => &mut response.st,
            "usn" => &mut response.usn,
            _ => continue,
        };
        *slot = Some(value.to_string());
    }

    Some(response)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;

    const REPLY: &str = "HTTP/1.1 200 OK\r\n\
CACHE-CONTROL: max-age=1800\r\n\
Location: http://192.168.1.30:49152/description.xml\r\n\
SERVER: Linux/5.4 UPnP/1.0 IpBridge/1.50\r\n\
ST: upnp:rootdevice\r\n\
USN: uuid:2f402f80-da50-11e1-9b23-001788255acc::upnp:rootdevice\r\n\
\r\n";

    #[test]
    fn test_parse_response() {
        let response = parse_response(REPLY).unwrap();

        assert_eq!(
            response.location.as_deref(),
            Some("http://192.168.1.30:49152/description.xml")
        );
        assert_eq!(response.server.as_deref(), Some("Linux/5.4 UPnP/1.0 IpBridge/1.50"));
        assert_eq!(response.st.as_deref(), Some("upnp:rootdevice"));
        assert!(response.usn.unwrap().starts_with("uuid:2f402f80"));
    }

    #[test]
    fn test_parse_rejects_searches_and_errors() {
        assert!(parse_response(M_SEARCH).is_none());
        assert!(parse_response("HTTP/1.1 404 Not Found\r\n\r\n").is_none());
        assert!(parse_response("").is_none());
    }

    #[test]
    fn test_parse_notify_uses_nt() {
        let notify = "NOTIFY * HTTP/1.1\r\nNT: urn:dial-multiscreen-org:service:dial:1\r\n\r\n";
        let response = parse_response(notify).unwrap();
        assert_eq!(
            response.st.as_deref(),
            Some("urn:dial-multiscreen-org:service:dial:1")
        );
    }

    #[tokio::test]
    async fn test_scan_against_local_responder() {
        let responder = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let target = responder.local_addr().unwrap();
        let reply_task = tokio::spawn(async move {
            let mut buf = [0u8; RECV_BUFFER];
            let (len, from) = responder.recv_from(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..len]).to_string();
            responder.send_to(REPLY.as_bytes(), from).await.unwrap();
            request
        });

        let ctx = ScanContext::new(Duration::from_millis(300));
        let (tx, mut rx) = mpsc::channel(4);
        let sink = DeviceSink::new(tx, ctx.clone());

        SsdpScanner::with_target(target).scan(&ctx, &sink).await.unwrap();
        drop(sink);

        let request = reply_task.await.unwrap();
        assert!(request.starts_with("M-SEARCH * HTTP/1.1"));
        assert!(request.contains("ST: ssdp:all"));

        let device = rx.recv().await.unwrap();
        assert_eq!(device.key(), "127.0.0.1");
        assert!(device.methods.contains(&DiscoveryMethod::Ssdp));
        assert_eq!(device.extra_data["ssdp.st"], "upnp:rootdevice");
        assert!(rx.recv().await.is_none());
    }
}
