use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::{Error, Result};

/// Identifier of an IQRF network handled by the runtime
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkId(pub String);

impl NetworkId {
    /// Creates a new network identifier
    pub fn new(id: impl Into<String>) -> Self {
        NetworkId(id.into())
    }

    /// Returns the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Logical node address inside a network (NADR)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeAddress(pub u16);

impl NodeAddress {
    /// The network coordinator
    pub const COORDINATOR: NodeAddress = NodeAddress(0x00);
    /// Broadcast address
    pub const BROADCAST: NodeAddress = NodeAddress(0xFF);

    /// Returns whether this address designates the coordinator
    pub fn is_coordinator(&self) -> bool {
        *self == Self::COORDINATOR
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// Unique identifier tying a wire response back to its request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub u64);

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Reference to one device in one network
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceRef {
    /// Network the device belongs to
    pub network_id: NetworkId,
    /// Node address of the device
    pub address: NodeAddress,
}

impl DeviceRef {
    /// Creates a new device reference
    pub fn new(network_id: NetworkId, address: NodeAddress) -> Self {
        DeviceRef { network_id, address }
    }

    /// Reference to the coordinator of a network
    pub fn coordinator(network_id: NetworkId) -> Self {
        DeviceRef::new(network_id, NodeAddress::COORDINATOR)
    }
}

/// Radio operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RfMode {
    /// Standard mode, shorter timeslots
    #[default]
    Std,
    /// Low power mode, longer timeslots
    Lp,
    /// Extra low power mode
    Xlp,
}

/// Transceiver module series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TransceiverSeries {
    Tr52x,
    Tr72x,
    Tr76x,
    #[default]
    Unknown,
}

impl TransceiverSeries {
    /// Returns whether timeslot tables are known for this series
    pub fn has_timing_table(&self) -> bool {
        matches!(self, TransceiverSeries::Tr72x | TransceiverSeries::Unknown)
    }
}

/// Timing profile of one network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NetworkProfile {
    /// Transceiver series used in the network
    #[serde(default)]
    pub series: TransceiverSeries,
    /// RF mode of the network
    #[serde(default)]
    pub rf_mode: RfMode,
}

impl NetworkProfile {
    /// Creates a new network profile
    pub fn new(series: TransceiverSeries, rf_mode: RfMode) -> Self {
        NetworkProfile { series, rf_mode }
    }
}

/// Maximal time a call request may spend waiting for its result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessingTime {
    /// Give up after the duration
    Limited(Duration),
    /// Wait as long as it takes
    Unlimited,
}

impl ProcessingTime {
    /// Millisecond sentinel standing for [`ProcessingTime::Unlimited`]
    pub const UNLIMITED_MILLIS: i64 = -1;

    /// Creates a processing time from milliseconds
    pub fn from_millis(millis: i64) -> Result<Self> {
        match millis {
            Self::UNLIMITED_MILLIS => Ok(ProcessingTime::Unlimited),
            m if m > 0 => Ok(ProcessingTime::Limited(Duration::from_millis(m as u64))),
            m => Err(Error::invalid_argument(format!(
                "maximal processing time must be positive or unlimited, got {} ms",
                m
            ))),
        }
    }

    /// Checks that a limited processing time is not zero
    pub fn validate(&self) -> Result<()> {
        match self {
            ProcessingTime::Limited(d) if d.is_zero() => Err(Error::invalid_argument(
                "maximal processing time must be positive or unlimited",
            )),
            _ => Ok(()),
        }
    }

    /// Returns the limit, `None` when unlimited
    pub fn limit(&self) -> Option<Duration> {
        match self {
            ProcessingTime::Limited(d) => Some(*d),
            ProcessingTime::Unlimited => None,
        }
    }

    /// Milliseconds, [`Self::UNLIMITED_MILLIS`] when unlimited
    pub fn as_millis(&self) -> i64 {
        match self {
            ProcessingTime::Limited(d) => i64::try_from(d.as_millis()).unwrap_or(i64::MAX),
            ProcessingTime::Unlimited => Self::UNLIMITED_MILLIS,
        }
    }
}

impl fmt::Display for ProcessingTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessingTime::Limited(d) => write!(f, "{} ms", d.as_millis()),
            ProcessingTime::Unlimited => write!(f, "unlimited"),
        }
    }
}
