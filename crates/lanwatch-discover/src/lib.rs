//! lanwatch-discover: Privilege-less LAN device discovery.
//!
//! Runs several discovery methods concurrently (ARP cache with active
//! triggering, SSDP, mDNS), merges their observations per session, and
//! keeps a [`lanwatch_core::DeviceStore`] up to date on a schedule.

pub mod arp;
pub mod config;
pub mod engine;
pub mod error;
pub mod mdns;
pub mod net;
pub mod scanner;
pub mod scheduler;
pub mod ssdp;

pub use engine::{Engine, ScannerFailure, SessionReport, VendorLookup};
pub use error::{DiscoverError, Result};
pub use scanner::{DeviceSink, ScanContext, Scanner};
