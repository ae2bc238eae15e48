//! lanwatch-core: Shared types, device state, and error handling for lanwatch.
//!
//! This crate provides the foundational pieces used by the discovery engine
//! and by any consumer rendering its results:
//! - The canonical [`Device`] record and its merge rules
//! - The concurrent [`DeviceStore`] with listener fan-out
//! - Common error types

pub mod error;
pub mod state;
pub mod types;

pub use error::LanwatchError;
pub use state::{DeviceStore, Listener};
pub use types::{Device, DiscoveryMethod, MacAddress};
