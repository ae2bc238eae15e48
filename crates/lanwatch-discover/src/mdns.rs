//! mDNS / DNS-SD discovery.
//!
//! Sends a one-shot service enumeration query from an ephemeral port, so
//! responders answer by unicast, then follows up with a PTR query for every
//! service type announced. Address records name the hosts; SRV records tie
//! service instances to them.

use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};

use async_trait::async_trait;
use dns_parser::{Builder, Packet, QueryClass, QueryType, RData};
use lanwatch_core::{Device, DiscoveryMethod};
use tokio::net::UdpSocket;

use crate::error::{DiscoverError, Result};
use crate::scanner::{DeviceSink, ScanContext, Scanner};

const MDNS_MULTICAST: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(224, 0, 0, 251), 5353);
const SERVICE_ENUMERATION: &str = "_services._dns-sd._udp.local";
const MAX_SERVICE_QUERIES: usize = 32;
const RECV_BUFFER: usize = 9000;

/// Records of interest from one mDNS response.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MdnsResponse {
    /// Service types announced in reply to the enumeration query.
    pub service_types: BTreeSet<String>,
    /// Service instance name → target host name (from SRV).
    pub instances: BTreeMap<String, String>,
    /// Host name → IPv4 address (from A).
    pub addresses: BTreeMap<String, Ipv4Addr>,
}

impl MdnsResponse {
    /// One observation per advertised host. A response without address
    /// records is attributed to its sender.
    pub fn into_devices(self, source: IpAddr) -> Vec<Device> {
        if self.addresses.is_empty() {
            let device = Device::new(source, DiscoveryMethod::Mdns);
            return match self.instances.values().next() {
                Some(host) => vec![with_services(device.with_hostname(host), &self.instances, host)],
                None if !self.service_types.is_empty() => vec![device],
                None => Vec::new(),
            };
        }

        self.addresses
            .iter()
            .map(|(host, ip)| {
                let device = Device::new(IpAddr::V4(*ip), DiscoveryMethod::Mdns).with_hostname(host);
                with_services(device, &self.instances, host)
            })
            .collect()
    }
}

fn with_services(device: Device, instances: &BTreeMap<String, String>, host: &str) -> Device {
    let services: Vec<&str> = instances
        .iter()
        .filter(|(_, target)| target.as_str() == host)
        .map(|(instance, _)| instance.as_str())
        .collect();
    if services.is_empty() {
        device
    } else {
        device.with_extra("mdns.service", services.join(", "))
    }
}

pub struct MdnsScanner {
    target: SocketAddr,
}

impl MdnsScanner {
    pub fn new() -> Self {
        Self {
            target: SocketAddr::V4(MDNS_MULTICAST),
        }
    }

    /// Send queries to `target` instead of the mDNS multicast group.
    pub fn with_target(target: SocketAddr) -> Self {
        Self { target }
    }
}

impl Default for MdnsScanner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Scanner for MdnsScanner {
    fn name(&self) -> &'static str {
        "mdns"
    }

    async fn scan(&self, ctx: &ScanContext, sink: &DeviceSink) -> Result<()> {
        let bind: SocketAddr = match self.target {
            SocketAddr::V4(v4) if v4.ip().is_loopback() => (Ipv4Addr::LOCALHOST, 0).into(),
            _ => (Ipv4Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.send_to(&ptr_query(SERVICE_ENUMERATION)?, self.target).await?;

        let mut queried: BTreeSet<String> = BTreeSet::new();
        let mut buf = vec![0u8; RECV_BUFFER];
        while let Some(received) = ctx.run_until(socket.recv_from(&mut buf)).await {
            let (len, from) = match received {
                Ok(r) => r,
                Err(e) => {
                    tracing::trace!(scanner = self.name(), error = %e, "mDNS receive failed");
                    continue;
                }
            };

            let response = match parse_response(&buf[..len]) {
                Ok(response) => response,
                Err(e) => {
                    tracing::trace!(scanner = self.name(), from = %from, error = %e, "Ignoring mDNS packet");
                    continue;
                }
            };

            for service in &response.service_types {
                if queried.len() >= MAX_SERVICE_QUERIES || !queried.insert(service.clone()) {
                    continue;
                }
                let query = match ptr_query(service) {
                    Ok(query) => query,
                    Err(e) => {
                        tracing::trace!(service = %service, error = %e, "Skipping mDNS follow-up query");
                        continue;
                    }
                };
                if let Err(e) = socket.send_to(&query, self.target).await {
                    tracing::debug!(service = %service, error = %e, "mDNS follow-up query failed");
                }
            }

            for device in response.into_devices(from.ip()) {
                if !sink.emit(device).await {
                    return Ok(());
                }
            }
        }

        Ok(())
    }
}

/// Longest label the query builder accepts.
const MAX_QUERY_LABEL: usize = 62;

/// Build a PTR question for `name` with the unicast-response bit set.
/// Names the encoder cannot represent are rejected, not encoded.
fn ptr_query(name: &str) -> Result<Vec<u8>> {
    if let Some(label) = name
        .split('.')
        .find(|label| label.is_empty() || label.len() > MAX_QUERY_LABEL)
    {
        return Err(DiscoverError::Encode {
            protocol: "mDNS",
            reason: format!("label {label:?} of {name} cannot be encoded"),
        });
    }

    let mut builder = Builder::new_query(0, false);
    builder.add_question(name, true, QueryType::PTR, QueryClass::IN);
    builder.build().map_err(|_| DiscoverError::Encode {
        protocol: "mDNS",
        reason: format!("query for {name} truncated"),
    })
}

/// Extract service types, SRV targets and A records from a response.
pub fn parse_response(data: &[u8]) -> Result<MdnsResponse> {
    let packet = Packet::parse(data).map_err(|e| DiscoverError::Decode {
        protocol: "mDNS",
        reason: e.to_string(),
    })?;
    let mut response = MdnsResponse::default();

    if packet.header.query {
        return Ok(response);
    }

    for record in packet.answers.iter().chain(packet.additional.iter()) {
        let owner = trim_dot(&record.name.to_string());
        match &record.data {
            RData::PTR(ptr) => {
                let target = trim_dot(&ptr.0.to_string());
                if owner.eq_ignore_ascii_case(SERVICE_ENUMERATION) {
                    response.service_types.insert(target);
                }
            }
            RData::SRV(srv) => {
                response
                    .instances
                    .insert(owner, trim_dot(&srv.target.to_string()));
            }
            RData::A(a) => {
                if !owner.ends_with(".arpa") {
                    response.addresses.insert(owner, a.0);
                }
            }
            _ => {}
        }
    }

    Ok(response)
}

fn trim_dot(name: &str) -> String {
    name.trim_end_matches('.').to_string()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;

    const TYPE_A: u16 = 1;
    const TYPE_PTR: u16 = 12;
    const TYPE_SRV: u16 = 33;

    fn encode_name(out: &mut Vec<u8>, name: &str) {
        for label in name.split('.') {
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
        out.push(0);
    }

    /// Minimal uncompressed DNS response with the given answer records.
    fn response(records: &[(&str, u16, Vec<u8>)]) -> Vec<u8> {
        let mut out = vec![0, 0, 0x84, 0, 0, 0];
        out.extend_from_slice(&(records.len() as u16).to_be_bytes());
        out.extend_from_slice(&[0, 0, 0, 0]);
        for (name, rtype, rdata) in records {
            encode_name(&mut out, name);
            out.extend_from_slice(&rtype.to_be_bytes());
            out.extend_from_slice(&[0x00, 0x01]);
            out.extend_from_slice(&120u32.to_be_bytes());
            out.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
            out.extend_from_slice(rdata);
        }
        out
    }

    fn name_rdata(name: &str) -> Vec<u8> {
        let mut out = Vec::new();
        encode_name(&mut out, name);
        out
    }

    fn srv_rdata(port: u16, target: &str) -> Vec<u8> {
        let mut out = vec![0, 0, 0, 0];
        out.extend_from_slice(&port.to_be_bytes());
        encode_name(&mut out, target);
        out
    }

    fn printer_response() -> Vec<u8> {
        response(&[
            ("_ipp._tcp.local", TYPE_PTR, name_rdata("Office Printer._ipp._tcp.local")),
            ("Office Printer._ipp._tcp.local", TYPE_SRV, srv_rdata(631, "printer.local")),
            ("printer.local", TYPE_A, vec![192, 168, 1, 44]),
        ])
    }

    #[test]
    fn test_ptr_query_is_parseable() {
        let query = ptr_query(SERVICE_ENUMERATION).unwrap();
        let packet = Packet::parse(&query).unwrap();

        assert!(packet.header.query);
        assert_eq!(packet.questions.len(), 1);
        assert_eq!(packet.questions[0].qname.to_string(), SERVICE_ENUMERATION);
        assert!(packet.questions[0].prefer_unicast);
    }

    #[test]
    fn test_ptr_query_rejects_unencodable_names() {
        let long = format!("_{}._tcp.local", "a".repeat(62));
        let longest = format!("_{}._tcp.local", "a".repeat(61));

        for name in [long.as_str(), "_ipp.._tcp.local", ""] {
            assert!(
                matches!(ptr_query(name), Err(DiscoverError::Encode { .. })),
                "{name:?} was accepted"
            );
        }
        assert!(ptr_query(&longest).is_ok());
    }

    #[test]
    fn test_parse_service_enumeration() {
        let data = response(&[
            (SERVICE_ENUMERATION, TYPE_PTR, name_rdata("_ipp._tcp.local")),
            (SERVICE_ENUMERATION, TYPE_PTR, name_rdata("_airplay._tcp.local")),
        ]);

        let parsed = parse_response(&data).unwrap();

        assert_eq!(
            parsed.service_types.into_iter().collect::<Vec<_>>(),
            vec!["_airplay._tcp.local", "_ipp._tcp.local"]
        );
    }

    #[test]
    fn test_parse_instance_records_into_devices() {
        let parsed = parse_response(&printer_response()).unwrap();
        assert_eq!(parsed.instances["Office Printer._ipp._tcp.local"], "printer.local");

        let devices = parsed.into_devices("192.168.1.44".parse().unwrap());

        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].key(), "192.168.1.44");
        assert_eq!(devices[0].hostname.as_deref(), Some("printer.local"));
        assert_eq!(
            devices[0].extra_data["mdns.service"],
            "Office Printer._ipp._tcp.local"
        );
    }

    #[test]
    fn test_enumeration_only_response_attributed_to_sender() {
        let data = response(&[(SERVICE_ENUMERATION, TYPE_PTR, name_rdata("_hap._tcp.local"))]);
        let devices = parse_response(&data)
            .unwrap()
            .into_devices("10.0.0.12".parse().unwrap());

        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].key(), "10.0.0.12");
        assert!(devices[0].hostname.is_none());
    }

    #[test]
    fn test_parse_garbage_is_error() {
        assert!(matches!(
            parse_response(&[1, 2, 3]),
            Err(DiscoverError::Decode { protocol: "mDNS", .. })
        ));
    }

    #[tokio::test]
    async fn test_scan_against_local_responder() {
        let responder = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let target = responder.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (_, from) = responder.recv_from(&mut buf).await.unwrap();
            let enumeration = response(&[(SERVICE_ENUMERATION, TYPE_PTR, name_rdata("_ipp._tcp.local"))]);
            responder.send_to(&enumeration, from).await.unwrap();

            // Follow-up query for the announced service type.
            let (len, from) = responder.recv_from(&mut buf).await.unwrap();
            let query = Packet::parse(&buf[..len]).unwrap();
            assert_eq!(query.questions[0].qname.to_string(), "_ipp._tcp.local");
            responder.send_to(&printer_response(), from).await.unwrap();
        });

        let ctx = ScanContext::new(Duration::from_millis(300));
        let (tx, mut rx) = mpsc::channel(8);
        let sink = DeviceSink::new(tx, ctx.clone());

        MdnsScanner::with_target(target).scan(&ctx, &sink).await.unwrap();
        drop(sink);

        let mut devices = Vec::new();
        while let Some(device) = rx.recv().await {
            devices.push(device);
        }
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].key(), "127.0.0.1");
        assert_eq!(devices[1].key(), "192.168.1.44");
        assert_eq!(devices[1].hostname.as_deref(), Some("printer.local"));
    }

    #[tokio::test]
    async fn test_scan_survives_service_type_with_max_length_label() {
        let long_service = format!("_{}._tcp.local", "a".repeat(62));
        let responder = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let target = responder.local_addr().unwrap();
        let announced = long_service.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (_, from) = responder.recv_from(&mut buf).await.unwrap();
            let enumeration = response(&[
                (SERVICE_ENUMERATION, TYPE_PTR, name_rdata(&announced)),
                (SERVICE_ENUMERATION, TYPE_PTR, name_rdata("_ipp._tcp.local")),
            ]);
            responder.send_to(&enumeration, from).await.unwrap();

            // Only the encodable service type is followed up.
            let (len, _) = responder.recv_from(&mut buf).await.unwrap();
            let query = Packet::parse(&buf[..len]).unwrap();
            assert_eq!(query.questions[0].qname.to_string(), "_ipp._tcp.local");
        });

        let ctx = ScanContext::new(Duration::from_millis(300));
        let (tx, mut rx) = mpsc::channel(8);
        let sink = DeviceSink::new(tx, ctx.clone());

        let result = MdnsScanner::with_target(target).scan(&ctx, &sink).await;
        drop(sink);

        assert!(result.is_ok());
        let device = rx.recv().await.unwrap();
        assert_eq!(device.key(), "127.0.0.1");
        assert!(rx.recv().await.is_none());
    }
}
