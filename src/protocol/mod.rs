//! Protocol implementation module
//!
//! This module defines the DPA request and response values, the timing
//! calculator, the protocol state machine guarding the half-duplex mesh,
//! and the layer composing the machine with a raw transport.

pub mod layer;
pub mod message;
pub mod peripheral;
pub mod state;
pub mod timing;

pub use self::layer::{DpaProtocolLayer, LayerConfig};
pub use self::message::{
    frc, uart, AsyncMessage, CallResponse, Confirmation, DeviceInterface, FrcResponseTime,
    FrcTimingParams, MethodCall, MethodId, Request, RequestTarget, Response, TimingParams,
};
pub use self::peripheral::{FrcCall, PeripheralCall, RawCall, UartCall};
pub use self::state::{
    ProtocolConfig, ProtocolState, ProtocolStateMachine, StateMachineListener, StateTransition,
};
pub use self::timing::{frc_waiting_time, timeslot_length, FrcMode, TimingCalculator};
