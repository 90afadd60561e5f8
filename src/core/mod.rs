//! Core types and traits for the DPA runtime
//!
//! This module contains the fundamental building blocks used throughout the library.

pub mod error;
pub mod types;
pub mod serde;

pub use self::error::{Error, ProcessingError, Result, TimeoutKind};
pub use self::types::{
    CorrelationId,
    DeviceRef,
    NetworkId,
    NetworkProfile,
    NodeAddress,
    ProcessingTime,
    RfMode,
    TransceiverSeries,
};

/// Maximal length of DPA payload data in bytes
pub const MAX_DPA_DATA_LENGTH: usize = 56;

/// Protocol bytes added to the payload of every response on the air
pub const RESPONSE_OVERHEAD: usize = 4;
