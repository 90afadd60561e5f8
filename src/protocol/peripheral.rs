//! Typed peripheral calls
//!
//! Each peripheral describes its commands as a [`PeripheralCall`]; the
//! connector and the state machine only ever see the resulting
//! [`MethodCall`].

use std::time::Duration;

use bytes::Bytes;

use super::message::{
    frc, uart, DeviceInterface, FrcTimingParams, MethodCall, MethodId, TimingParams,
};

/// Response payload of FRC send commands: status byte plus collected data
const FRC_RESPONSE_LENGTH: usize = 56;

/// Response payload of FRC extra result
const FRC_EXTRA_RESULT_LENGTH: usize = 9;

/// A command on one peripheral, convertible to a generic method call
pub trait PeripheralCall {
    /// Peripheral the call is addressed to
    fn interface(&self) -> DeviceInterface;

    /// Command within the peripheral
    fn method_id(&self) -> MethodId;

    /// Argument blocks in call order
    fn args(&self) -> Vec<Bytes>;

    /// Timing input for the response wait estimate
    fn timing(&self) -> TimingParams {
        TimingParams::Default
    }

    /// Expected response payload length, if known
    fn response_length(&self) -> Option<usize> {
        None
    }

    fn into_method_call(self) -> MethodCall
    where
        Self: Sized,
    {
        let mut call = MethodCall::new(self.interface(), self.method_id(), self.args())
            .with_timing(self.timing());
        call.response_length = self.response_length();
        call
    }
}

/// FRC peripheral commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrcCall {
    /// Collects data from all bonded nodes
    Send {
        command: u8,
        user_data: Bytes,
        timing: FrcTimingParams,
    },
    /// Collects data from the selected nodes only
    SendSelective {
        command: u8,
        /// Bitmap of selected node addresses
        selected_nodes: Bytes,
        user_data: Bytes,
        timing: FrcTimingParams,
    },
    /// Reads the rest of the data collected by the previous send
    ExtraResult,
    /// Sets FRC parameters, the response carries the previous ones
    SetFrcParams { params: u8 },
}

impl PeripheralCall for FrcCall {
    fn interface(&self) -> DeviceInterface {
        DeviceInterface::Frc
    }

    fn method_id(&self) -> MethodId {
        match self {
            FrcCall::Send { .. } => frc::SEND,
            FrcCall::SendSelective { .. } => frc::SEND_SELECTIVE,
            FrcCall::ExtraResult => frc::EXTRA_RESULT,
            FrcCall::SetFrcParams { .. } => frc::SET_FRC_PARAMS,
        }
    }

    fn args(&self) -> Vec<Bytes> {
        match self {
            FrcCall::Send {
                command, user_data, ..
            } => vec![Bytes::copy_from_slice(&[*command]), user_data.clone()],
            FrcCall::SendSelective {
                command,
                selected_nodes,
                user_data,
                ..
            } => vec![
                Bytes::copy_from_slice(&[*command]),
                selected_nodes.clone(),
                user_data.clone(),
            ],
            FrcCall::ExtraResult => Vec::new(),
            FrcCall::SetFrcParams { params } => vec![Bytes::copy_from_slice(&[*params])],
        }
    }

    fn timing(&self) -> TimingParams {
        match self {
            FrcCall::Send { timing, .. } | FrcCall::SendSelective { timing, .. } => {
                TimingParams::Frc(*timing)
            }
            _ => TimingParams::Default,
        }
    }

    fn response_length(&self) -> Option<usize> {
        match self {
            FrcCall::Send { .. } | FrcCall::SendSelective { .. } => Some(FRC_RESPONSE_LENGTH),
            FrcCall::ExtraResult => Some(FRC_EXTRA_RESULT_LENGTH),
            FrcCall::SetFrcParams { .. } => Some(1),
        }
    }
}

/// UART peripheral commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UartCall {
    Open { baud_rate: u8 },
    Close,
    /// Writes `data` and reads what arrives within `timeout`
    WriteAndRead { timeout: Duration, data: Bytes },
}

impl UartCall {
    /// Read timeout in 10 ms units as sent to the node
    fn timeout_units(timeout: Duration) -> u8 {
        u8::try_from(timeout.as_millis() / 10).unwrap_or(u8::MAX)
    }
}

impl PeripheralCall for UartCall {
    fn interface(&self) -> DeviceInterface {
        DeviceInterface::Uart
    }

    fn method_id(&self) -> MethodId {
        match self {
            UartCall::Open { .. } => uart::OPEN,
            UartCall::Close => uart::CLOSE,
            UartCall::WriteAndRead { .. } => uart::WRITE_AND_READ,
        }
    }

    fn args(&self) -> Vec<Bytes> {
        match self {
            UartCall::Open { baud_rate } => vec![Bytes::copy_from_slice(&[*baud_rate])],
            UartCall::Close => Vec::new(),
            UartCall::WriteAndRead { timeout, data } => vec![
                Bytes::copy_from_slice(&[Self::timeout_units(*timeout)]),
                data.clone(),
            ],
        }
    }

    fn response_length(&self) -> Option<usize> {
        match self {
            UartCall::Open { .. } | UartCall::Close => Some(0),
            UartCall::WriteAndRead { .. } => None,
        }
    }
}

/// Any other command, described directly
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCall {
    pub interface: DeviceInterface,
    pub method_id: MethodId,
    pub args: Vec<Bytes>,
    pub response_length: Option<usize>,
}

impl RawCall {
    pub fn new(interface: DeviceInterface, method_id: MethodId, args: Vec<Bytes>) -> Self {
        RawCall {
            interface,
            method_id,
            args,
            response_length: None,
        }
    }
}

impl PeripheralCall for RawCall {
    fn interface(&self) -> DeviceInterface {
        self.interface
    }

    fn method_id(&self) -> MethodId {
        self.method_id
    }

    fn args(&self) -> Vec<Bytes> {
        self.args.clone()
    }

    fn response_length(&self) -> Option<usize> {
        self.response_length
    }
}
