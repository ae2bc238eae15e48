//! Core domain types for lanwatch.
//!
//! A [`Device`] is the canonical record for one host observed on the local
//! network. Scanners produce partial observations; the store merges them.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LanwatchError, Result};

// ── Discovery method ──────────────────────────────────────────────

/// Which discovery strategy contributed an observation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryMethod {
    Arp,
    Ssdp,
    Mdns,
}

impl fmt::Display for DiscoveryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Arp => write!(f, "arp"),
            Self::Ssdp => write!(f, "ssdp"),
            Self::Mdns => write!(f, "mdns"),
        }
    }
}

// ── MAC address ───────────────────────────────────────────────────

/// A 48-bit link-layer address.
///
/// Parses both `aa:bb:cc:dd:ee:ff` and `aa-bb-cc-dd-ee-ff`, and accepts the
/// unpadded octets BSD `arp` prints (`0:1a:2b:3:4:5`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(into = "String", try_from = "String")]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// All-zero address, used by neighbor tables for incomplete entries.
    pub const ZERO: MacAddress = MacAddress([0; 6]);

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == [0xff; 6]
    }
}

impl FromStr for MacAddress {
    type Err = LanwatchError;

    fn from_str(s: &str) -> Result<Self> {
        let mut octets = [0u8; 6];
        let mut parts = s.trim().split(|c| c == ':' || c == '-');

        for octet in octets.iter_mut() {
            let part = parts
                .next()
                .filter(|p| !p.is_empty() && p.len() <= 2)
                .ok_or_else(|| LanwatchError::InvalidMac(s.to_string()))?;
            *octet =
                u8::from_str_radix(part, 16).map_err(|_| LanwatchError::InvalidMac(s.to_string()))?;
        }

        if parts.next().is_some() {
            return Err(LanwatchError::InvalidMac(s.to_string()));
        }

        Ok(Self(octets))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> Self {
        mac.to_string()
    }
}

impl TryFrom<String> for MacAddress {
    type Error = LanwatchError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

// ── Device ────────────────────────────────────────────────────────

/// A host observed on the local network.
///
/// Identity is the IP address. Every other field is optional enrichment that
/// the store accumulates across observations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Device {
    pub ip: IpAddr,
    pub mac: Option<MacAddress>,
    pub hostname: Option<String>,
    pub vendor: Option<String>,
    /// Protocol-specific metadata such as `ssdp.server` or `mdns.service`.
    pub extra_data: BTreeMap<String, String>,
    pub methods: BTreeSet<DiscoveryMethod>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Device {
    /// A bare observation of `ip` by `method`, stamped with the current time.
    pub fn new(ip: IpAddr, method: DiscoveryMethod) -> Self {
        let now = Utc::now();
        Self {
            ip,
            mac: None,
            hostname: None,
            vendor: None,
            extra_data: BTreeMap::new(),
            methods: BTreeSet::from([method]),
            first_seen: now,
            last_seen: now,
        }
    }

    /// Parse `ip` from its textual form.
    pub fn parse(ip: &str, method: DiscoveryMethod) -> Result<Self> {
        let ip = ip
            .trim()
            .parse::<IpAddr>()
            .map_err(|_| LanwatchError::InvalidIp(ip.to_string()))?;
        Ok(Self::new(ip, method))
    }

    pub fn with_mac(mut self, mac: MacAddress) -> Self {
        self.mac = Some(mac);
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn with_vendor(mut self, vendor: impl Into<String>) -> Self {
        self.vendor = Some(vendor.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_data.insert(key.into(), value.into());
        self
    }

    /// Store key for this device.
    pub fn key(&self) -> String {
        self.ip.to_string()
    }

    /// Whether the device carries an address the store can key on.
    pub fn has_ip(&self) -> bool {
        !self.ip.is_unspecified()
    }

    /// Merge a later observation of the same host into this record.
    ///
    /// Fields are only ever filled or refreshed, never cleared. `mac` and
    /// `vendor` keep the first non-empty value; `hostname` and individual
    /// `extra_data` keys take the latest non-empty value. Timestamps widen to
    /// cover both observations and methods are unioned.
    pub fn merge(&mut self, other: &Device) {
        if self.mac.is_none() {
            self.mac = other.mac;
        }
        if self.vendor.as_deref().map_or(true, str::is_empty) {
            if let Some(vendor) = other.vendor.as_ref().filter(|v| !v.is_empty()) {
                self.vendor = Some(vendor.clone());
            }
        }
        if let Some(hostname) = other.hostname.as_ref().filter(|h| !h.is_empty()) {
            self.hostname = Some(hostname.clone());
        }
        for (key, value) in &other.extra_data {
            if !value.is_empty() {
                self.extra_data.insert(key.clone(), value.clone());
            }
        }
        self.methods.extend(other.methods.iter().copied());
        self.first_seen = self.first_seen.min(other.first_seen);
        self.last_seen = self.last_seen.max(other.last_seen);
    }
}
