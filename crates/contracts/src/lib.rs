//! # Contracts
//!
//! Frozen interface contracts shared by every crate in the bridge.
//! Business crates depend on this crate only, reverse dependencies are prohibited.
//!
//! ## Time Model
//! - Frames carry device epoch seconds (`f64`) which may be absent or invalid
//! - Sinks derive their own event time from it, falling back to ingestion time

mod config;
mod device_id;
mod error;
mod frame;
mod sink;

pub use config::*;
pub use device_id::DeviceId;
pub use error::*;
pub use frame::*;
pub use sink::*;
