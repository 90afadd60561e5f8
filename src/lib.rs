//! IQRF DPA runtime
//!
//! This library mediates between application code and an IQRF mesh network
//! speaking the DPA protocol. The mesh is half-duplex, so at most one request
//! may be in flight at any time: a timing state machine computes how long
//! each exchange occupies the network, and a request/response connector
//! queues calls, correlates replies and fans out unsolicited messages.
pub mod core;

pub mod connector;
pub mod network;
pub mod protocol;
pub mod runtime;
pub mod util;

// Re-export commonly used items
pub use crate::connector::{
    AsyncMessageListener, BroadcastListener, CallRequestProcessingInfo, CallRequestProcessingState,
    CallResult, ConnectorConfig, DpaConnector, ListenerId,
};
pub use crate::core::{
    CorrelationId, DeviceRef, Error, NetworkId, NetworkProfile, NodeAddress, ProcessingError,
    ProcessingTime, Result, RfMode, TransceiverSeries,
};
pub use crate::network::{DpaTransport, TransportMessage, TransportSink, WireLayer};
pub use crate::protocol::{
    DpaProtocolLayer, MethodCall, ProtocolState, ProtocolStateMachine, TimingCalculator,
};
pub use crate::runtime::{DpaRuntime, RuntimeConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
