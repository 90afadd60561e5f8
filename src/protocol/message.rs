use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::core::{
    CorrelationId, DeviceRef, NetworkId, NodeAddress, ProcessingError, MAX_DPA_DATA_LENGTH,
};

/// Command identifier within a peripheral (PCMD)
pub type MethodId = u8;

/// Device interface (peripheral) a method call is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceInterface {
    Coordinator,
    Node,
    Os,
    Eeprom,
    Eeeprom,
    Ram,
    LedR,
    LedG,
    Spi,
    Io,
    Thermometer,
    Uart,
    Frc,
    /// User peripheral with explicit peripheral number
    Custom(u8),
}

impl DeviceInterface {
    /// Returns the peripheral number (PNUM)
    pub fn peripheral_number(&self) -> u8 {
        match self {
            DeviceInterface::Coordinator => 0x00,
            DeviceInterface::Node => 0x01,
            DeviceInterface::Os => 0x02,
            DeviceInterface::Eeprom => 0x03,
            DeviceInterface::Eeeprom => 0x04,
            DeviceInterface::Ram => 0x05,
            DeviceInterface::LedR => 0x06,
            DeviceInterface::LedG => 0x07,
            DeviceInterface::Spi => 0x08,
            DeviceInterface::Io => 0x09,
            DeviceInterface::Thermometer => 0x0A,
            DeviceInterface::Uart => 0x0C,
            DeviceInterface::Frc => 0x0D,
            DeviceInterface::Custom(pnum) => *pnum,
        }
    }
}

/// FRC peripheral commands
pub mod frc {
    use super::MethodId;

    pub const SEND: MethodId = 0x00;
    pub const EXTRA_RESULT: MethodId = 0x01;
    pub const SEND_SELECTIVE: MethodId = 0x02;
    pub const SET_FRC_PARAMS: MethodId = 0x03;
}

/// UART peripheral commands
pub mod uart {
    use super::MethodId;

    pub const OPEN: MethodId = 0x00;
    pub const CLOSE: MethodId = 0x01;
    pub const WRITE_AND_READ: MethodId = 0x02;
    pub const CLEAR_WRITE_AND_READ: MethodId = 0x03;
}

/// Response time configured for FRC collection on the nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrcResponseTime {
    Ms40,
    Ms360,
    Ms680,
    Ms1320,
    Ms2600,
    Ms5160,
    Ms10280,
    Ms20620,
}

impl FrcResponseTime {
    /// Response time in milliseconds
    pub fn millis(&self) -> u64 {
        match self {
            FrcResponseTime::Ms40 => 40,
            FrcResponseTime::Ms360 => 360,
            FrcResponseTime::Ms680 => 680,
            FrcResponseTime::Ms1320 => 1320,
            FrcResponseTime::Ms2600 => 2600,
            FrcResponseTime::Ms5160 => 5160,
            FrcResponseTime::Ms10280 => 10280,
            FrcResponseTime::Ms20620 => 20620,
        }
    }
}

impl From<FrcResponseTime> for Duration {
    fn from(time: FrcResponseTime) -> Self {
        Duration::from_millis(time.millis())
    }
}

/// Parameters needed to estimate how long an FRC sweep takes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrcTimingParams {
    /// Number of nodes bonded to the coordinator
    pub bonded_nodes: u32,
    /// Response time of the coordinator
    pub response_time: Duration,
}

impl FrcTimingParams {
    pub fn new(bonded_nodes: u32, response_time: impl Into<Duration>) -> Self {
        FrcTimingParams {
            bonded_nodes,
            response_time: response_time.into(),
        }
    }
}

/// Extra timing input attached to a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimingParams {
    #[default]
    Default,
    Frc(FrcTimingParams),
}

/// One method call on a device interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodCall {
    /// Target peripheral
    pub interface: DeviceInterface,
    /// Command within the peripheral
    pub method_id: MethodId,
    /// Argument blocks in call order
    pub args: Vec<Bytes>,
    /// Timing input for special-case peripherals
    pub timing: TimingParams,
    /// Expected response payload length, if known
    pub response_length: Option<usize>,
}

impl MethodCall {
    pub fn new(interface: DeviceInterface, method_id: MethodId, args: Vec<Bytes>) -> Self {
        MethodCall {
            interface,
            method_id,
            args,
            timing: TimingParams::Default,
            response_length: None,
        }
    }

    pub fn with_timing(mut self, timing: TimingParams) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_response_length(mut self, length: usize) -> Self {
        self.response_length = Some(length);
        self
    }

    /// Response payload length used for timeslot estimates; the maximal
    /// payload when no hint was given
    pub fn expected_response_length(&self) -> usize {
        self.response_length
            .unwrap_or(MAX_DPA_DATA_LENGTH)
            .min(MAX_DPA_DATA_LENGTH)
    }
}

/// Addressing of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestTarget {
    /// Addressed to a single node
    Unicast(NodeAddress),
    /// Addressed to every node in the network
    Broadcast,
}

/// A request travelling through the connector and the protocol layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Correlation ID
    pub id: CorrelationId,
    /// Target network
    pub network_id: NetworkId,
    /// Unicast or broadcast addressing
    pub target: RequestTarget,
    /// The call to perform
    pub call: MethodCall,
}

impl Request {
    /// Creates a request addressed to one device
    pub fn unicast(id: CorrelationId, device: &DeviceRef, call: MethodCall) -> Self {
        Request {
            id,
            network_id: device.network_id.clone(),
            target: RequestTarget::Unicast(device.address),
            call,
        }
    }

    /// Creates a request addressed to all nodes of a network
    pub fn broadcast(id: CorrelationId, network_id: NetworkId, call: MethodCall) -> Self {
        Request {
            id,
            network_id,
            target: RequestTarget::Broadcast,
            call,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self.target, RequestTarget::Broadcast)
    }

    /// Node address on the wire
    pub fn address(&self) -> NodeAddress {
        match self.target {
            RequestTarget::Unicast(address) => address,
            RequestTarget::Broadcast => NodeAddress::BROADCAST,
        }
    }

    /// Everything except a unicast to the coordinator is confirmed first
    pub fn expects_confirmation(&self) -> bool {
        match self.target {
            RequestTarget::Unicast(address) => !address.is_coordinator(),
            RequestTarget::Broadcast => true,
        }
    }

    /// Broadcasts end with their confirmation
    pub fn expects_response(&self) -> bool {
        !self.is_broadcast()
    }
}

/// Routing acknowledgment of a sent request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Confirmation {
    /// Hops used to deliver the request
    pub hops: u8,
    /// Hops the response will use
    pub hops_response: u8,
    /// Timeslot length in 10 ms units
    pub timeslot_length: u8,
}

impl Confirmation {
    pub fn new(hops: u8, hops_response: u8, timeslot_length: u8) -> Self {
        Confirmation {
            hops,
            hops_response,
            timeslot_length,
        }
    }
}

/// Raw reply received from the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Response payload
    pub data: Bytes,
    /// Additional data attached by the network (e.g. DPA value)
    pub additional_data: Bytes,
    /// When the response was received
    pub received_at: Instant,
}

impl Response {
    pub fn new(data: impl Into<Bytes>, received_at: Instant) -> Self {
        Response {
            data: data.into(),
            additional_data: Bytes::new(),
            received_at,
        }
    }

    pub fn with_additional_data(mut self, data: impl Into<Bytes>) -> Self {
        self.additional_data = data.into();
        self
    }
}

/// Correlated reply handed to the connector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallResponse {
    pub request_id: CorrelationId,
    pub main_data: Bytes,
    pub additional_data: Bytes,
    pub processing_error: Option<ProcessingError>,
}

impl CallResponse {
    pub fn success(request_id: CorrelationId, main_data: Bytes, additional_data: Bytes) -> Self {
        CallResponse {
            request_id,
            main_data,
            additional_data,
            processing_error: None,
        }
    }

    pub fn failure(request_id: CorrelationId, error: ProcessingError) -> Self {
        CallResponse {
            request_id,
            main_data: Bytes::new(),
            additional_data: Bytes::new(),
            processing_error: Some(error),
        }
    }
}

/// Unsolicited message sent by a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncMessage {
    pub network_id: NetworkId,
    pub source_node: NodeAddress,
    pub peripheral_number: u8,
    pub main_data: Bytes,
    pub additional_data: Bytes,
}
