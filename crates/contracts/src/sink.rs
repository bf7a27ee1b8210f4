//! DeliverySink trait - the single capability every sink exposes
//!
//! The dispatcher selects exactly one implementation from configuration
//! and only talks to it through this trait.

use crate::{ContractError, FrameRecord};

/// Frame delivery trait
///
/// All sink implementations must implement this trait.
#[trait_variant::make(DeliverySink: Send)]
pub trait LocalDeliverySink {
    /// Sink name (used for logging/metrics)
    fn name(&self) -> &str;

    /// Deliver one frame to durable storage or the broker
    ///
    /// # Errors
    /// Returns the delivery failure (should include context)
    async fn deliver(&mut self, frame: &FrameRecord) -> Result<(), ContractError>;

    /// Flush buffered output (if any)
    async fn flush(&mut self) -> Result<(), ContractError>;

    /// Close sink, releasing every file handle or socket it owns
    async fn close(&mut self) -> Result<(), ContractError>;
}
