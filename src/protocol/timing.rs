//! Protocol timing calculations.
//!
//! All values follow the DPA routing model: a request is routed in timeslots
//! whose length (in 10 ms units) depends on the RF mode and the payload size,
//! once per hop plus one.

use std::time::Duration;

use tracing::warn;

use crate::core::{Error, NetworkProfile, Result, RfMode, TransceiverSeries, RESPONSE_OVERHEAD};
use super::message::{frc, uart, Confirmation, DeviceInterface, Request, TimingParams};

/// Default time to wait for a confirmation
pub const DEFAULT_CONFIRMATION_TIMEOUT: Duration = Duration::from_millis(2000);

/// Extra wait for a request handled by the coordinator itself
const COORDINATOR_MARGIN: Duration = Duration::from_millis(100);

/// Slack added to routed request/response round trips, in ms
const ROUTING_MARGIN_MS: u64 = 40;

/// Length of one timeslot unit in ms
const TIMESLOT_UNIT_MS: u64 = 10;

/// FRC data collection mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrcMode {
    /// Up to 2 bits or 2 bytes of user data per node
    Standard,
    /// Longer user data, longer per-node slots
    Advanced,
}

/// Looks up the timeslot length, in 10 ms units, for a response payload.
pub fn timeslot_length(
    series: TransceiverSeries,
    rf_mode: RfMode,
    response_data_length: usize,
) -> Result<u64> {
    if !series.has_timing_table() {
        return Err(Error::UnsupportedTransceiverSeries(series));
    }

    let length = response_data_length + RESPONSE_OVERHEAD;
    match rf_mode {
        RfMode::Std => Ok(match length {
            l if l < 16 => 4,
            l if l < 39 => 5,
            _ => 6,
        }),
        RfMode::Lp => Ok(match length {
            l if l < 11 => 8,
            l if l < 33 => 9,
            l if l < 56 => 10,
            _ => 11,
        }),
        RfMode::Xlp => Err(Error::UnsupportedRfMode(rf_mode)),
    }
}

/// Duration of an FRC sweep over all bonded nodes.
pub fn frc_waiting_time(
    mode: FrcMode,
    rf_mode: RfMode,
    bonded_nodes: u32,
    response_time: Duration,
) -> Result<Duration> {
    let (per_node, margin) = match (mode, rf_mode) {
        (FrcMode::Standard, _) => (130, 250),
        (FrcMode::Advanced, RfMode::Std) => (150, 290),
        (FrcMode::Advanced, RfMode::Lp) => (200, 390),
        (FrcMode::Advanced, RfMode::Xlp) => return Err(Error::UnsupportedRfMode(rf_mode)),
    };
    Ok(Duration::from_millis(u64::from(bonded_nodes) * per_node + margin) + response_time)
}

/// How a special-case peripheral changes the usual response wait
enum SpecialTiming {
    /// Wait only for this, the usual routing estimate does not apply
    Replace(Duration),
    /// Wait for this on top of the usual routing estimate
    Extend(Duration),
}

/// Computes the waiting windows used by the protocol state machine
#[derive(Debug, Clone)]
pub struct TimingCalculator {
    confirmation_timeout: Duration,
    base_response_time: Duration,
}

impl Default for TimingCalculator {
    fn default() -> Self {
        TimingCalculator::new(DEFAULT_CONFIRMATION_TIMEOUT, Duration::ZERO)
    }
}

impl TimingCalculator {
    /// Creates a new timing calculator
    pub fn new(confirmation_timeout: Duration, base_response_time: Duration) -> Self {
        TimingCalculator {
            confirmation_timeout,
            base_response_time,
        }
    }

    pub fn time_to_wait_for_confirmation(&self) -> Duration {
        self.confirmation_timeout
    }

    pub fn base_response_time(&self) -> Duration {
        self.base_response_time
    }

    /// Time to wait for the response to `request`, counted from the
    /// confirmation (or from sending, when no confirmation applies).
    ///
    /// Failures of the FRC and UART special cases fall back to the usual
    /// estimate. An unsupported network profile still fails, since the usual
    /// estimate itself cannot be computed.
    pub fn time_to_wait_for_response(
        &self,
        request: &Request,
        confirmation: Option<&Confirmation>,
        profile: &NetworkProfile,
    ) -> Result<Duration> {
        let special = match self.special_response_time(request, profile) {
            Ok(special) => special,
            Err(e) => {
                warn!(
                    request = %request.id,
                    error = %e,
                    "special timing failed, using usual timing"
                );
                None
            }
        };

        match special {
            Some(SpecialTiming::Replace(wait)) => Ok(self.base_response_time + wait),
            Some(SpecialTiming::Extend(extra)) => {
                Ok(self.usual_response_time(request, confirmation, profile)? + extra)
            }
            None => self.usual_response_time(request, confirmation, profile),
        }
    }

    /// Mandatory pause after a broadcast confirmation while the request is
    /// still being flooded through the network.
    pub fn time_to_wait_after_confirmation(
        &self,
        confirmation: &Confirmation,
        elapsed: Duration,
    ) -> Duration {
        let routing = (u64::from(confirmation.hops) + 1)
            * u64::from(confirmation.timeslot_length)
            * TIMESLOT_UNIT_MS;
        Duration::from_millis(routing).saturating_sub(elapsed)
    }

    /// Mandatory pause after a response while its routing finishes.
    /// Requests answered by the coordinator itself need no pause.
    pub fn time_to_wait_after_response(
        &self,
        confirmation: Option<&Confirmation>,
        response_data_length: usize,
        profile: &NetworkProfile,
        elapsed: Duration,
    ) -> Result<Duration> {
        let Some(confirmation) = confirmation else {
            return Ok(Duration::ZERO);
        };
        let timeslot = timeslot_length(profile.series, profile.rf_mode, response_data_length)?;
        let routing = (u64::from(confirmation.hops_response) + 1) * timeslot * TIMESLOT_UNIT_MS;
        Ok(Duration::from_millis(routing).saturating_sub(elapsed))
    }

    fn usual_response_time(
        &self,
        request: &Request,
        confirmation: Option<&Confirmation>,
        profile: &NetworkProfile,
    ) -> Result<Duration> {
        let Some(confirmation) = confirmation else {
            return Ok(self.base_response_time + COORDINATOR_MARGIN);
        };

        let response_timeslot = timeslot_length(
            profile.series,
            profile.rf_mode,
            request.call.expected_response_length(),
        )? * TIMESLOT_UNIT_MS;

        let request_routing = (u64::from(confirmation.hops) + 1)
            * u64::from(confirmation.timeslot_length)
            * TIMESLOT_UNIT_MS;
        let response_routing = (u64::from(confirmation.hops_response) + 1) * response_timeslot;

        Ok(Duration::from_millis(request_routing + response_routing + ROUTING_MARGIN_MS)
            + self.base_response_time)
    }

    fn special_response_time(
        &self,
        request: &Request,
        profile: &NetworkProfile,
    ) -> Result<Option<SpecialTiming>> {
        match request.call.interface {
            DeviceInterface::Frc => self.frc_response_time(request, profile),
            DeviceInterface::Uart if request.call.method_id == uart::WRITE_AND_READ => {
                let timeout = request
                    .call
                    .args
                    .first()
                    .and_then(|arg| arg.first())
                    .ok_or_else(|| {
                        Error::invalid_argument("UART write and read without timeout argument")
                    })?;
                Ok(Some(SpecialTiming::Extend(Duration::from_millis(
                    u64::from(*timeout) * TIMESLOT_UNIT_MS,
                ))))
            }
            _ => Ok(None),
        }
    }

    fn frc_response_time(
        &self,
        request: &Request,
        profile: &NetworkProfile,
    ) -> Result<Option<SpecialTiming>> {
        let method = request.call.method_id;
        if method == frc::EXTRA_RESULT || method == frc::SET_FRC_PARAMS {
            return Ok(None);
        }

        let TimingParams::Frc(params) = request.call.timing else {
            return Err(Error::invalid_argument("FRC request without FRC timing parameters"));
        };

        // user data follows the FRC command (and the node selection for SEND_SELECTIVE)
        let user_data_index = match method {
            frc::SEND => Some(1),
            frc::SEND_SELECTIVE => Some(2),
            _ => None,
        };
        let mode = match user_data_index {
            Some(index) => {
                let user_data_len = request.call.args.get(index).map_or(0, |data| data.len());
                if user_data_len <= 2 {
                    FrcMode::Standard
                } else {
                    FrcMode::Advanced
                }
            }
            None => FrcMode::Standard,
        };

        let wait = frc_waiting_time(
            mode,
            profile.rf_mode,
            params.bonded_nodes,
            params.response_time,
        )?;
        Ok(Some(SpecialTiming::Replace(wait)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CorrelationId, DeviceRef, NetworkId, NodeAddress};
    use crate::protocol::message::{FrcTimingParams, MethodCall};
    use bytes::Bytes;

    const STD: NetworkProfile = NetworkProfile {
        series: TransceiverSeries::Tr72x,
        rf_mode: RfMode::Std,
    };
    const LP: NetworkProfile = NetworkProfile {
        series: TransceiverSeries::Tr72x,
        rf_mode: RfMode::Lp,
    };

    fn request_to(address: u16, call: MethodCall) -> Request {
        let device = DeviceRef::new(NetworkId::new("net"), NodeAddress(address));
        Request::unicast(CorrelationId(1), &device, call)
    }

    fn frc_send(user_data: &'static [u8], bonded_nodes: u32) -> Request {
        let call = MethodCall::new(
            DeviceInterface::Frc,
            frc::SEND,
            vec![Bytes::from_static(&[0x80]), Bytes::from_static(user_data)],
        )
        .with_timing(TimingParams::Frc(FrcTimingParams::new(
            bonded_nodes,
            Duration::from_millis(100),
        )));
        request_to(0, call)
    }

    #[test]
    fn test_std_timeslot_boundaries() {
        let series = TransceiverSeries::Tr72x;
        // arguments are payload lengths, the table is keyed by payload + 4
        assert_eq!(timeslot_length(series, RfMode::Std, 11).unwrap(), 4);
        assert_eq!(timeslot_length(series, RfMode::Std, 12).unwrap(), 5);
        assert_eq!(timeslot_length(series, RfMode::Std, 34).unwrap(), 5);
        assert_eq!(timeslot_length(series, RfMode::Std, 35).unwrap(), 6);
    }

    #[test]
    fn test_lp_timeslot_boundaries() {
        let series = TransceiverSeries::Unknown;
        assert_eq!(timeslot_length(series, RfMode::Lp, 6).unwrap(), 8);
        assert_eq!(timeslot_length(series, RfMode::Lp, 7).unwrap(), 9);
        assert_eq!(timeslot_length(series, RfMode::Lp, 28).unwrap(), 9);
        assert_eq!(timeslot_length(series, RfMode::Lp, 29).unwrap(), 10);
        assert_eq!(timeslot_length(series, RfMode::Lp, 51).unwrap(), 10);
        assert_eq!(timeslot_length(series, RfMode::Lp, 52).unwrap(), 11);
    }

    #[test]
    fn test_unsupported_profiles_fail_fast() {
        assert!(matches!(
            timeslot_length(TransceiverSeries::Tr52x, RfMode::Std, 0),
            Err(Error::UnsupportedTransceiverSeries(TransceiverSeries::Tr52x))
        ));
        assert!(matches!(
            timeslot_length(TransceiverSeries::Tr72x, RfMode::Xlp, 0),
            Err(Error::UnsupportedRfMode(RfMode::Xlp))
        ));
    }

    #[test]
    fn test_frc_waiting_time() {
        let coord = Duration::from_millis(100);
        assert_eq!(
            frc_waiting_time(FrcMode::Standard, RfMode::Std, 10, coord).unwrap(),
            Duration::from_millis(1650)
        );
        assert_eq!(
            frc_waiting_time(FrcMode::Advanced, RfMode::Std, 10, coord).unwrap(),
            Duration::from_millis(1890)
        );
        assert_eq!(
            frc_waiting_time(FrcMode::Advanced, RfMode::Lp, 10, coord).unwrap(),
            Duration::from_millis(2490)
        );
    }

    #[test]
    fn test_frc_request_timing() {
        let calc = TimingCalculator::default();

        let standard = frc_send(&[0x01, 0x02], 10);
        assert_eq!(
            calc.time_to_wait_for_response(&standard, None, &STD).unwrap(),
            Duration::from_millis(1650)
        );

        let advanced = frc_send(&[0x01, 0x02, 0x03], 10);
        assert_eq!(
            calc.time_to_wait_for_response(&advanced, None, &STD).unwrap(),
            Duration::from_millis(1890)
        );
        assert_eq!(
            calc.time_to_wait_for_response(&advanced, None, &LP).unwrap(),
            Duration::from_millis(2490)
        );
    }

    #[test]
    fn test_frc_extra_result_uses_usual_timing() {
        let calc = TimingCalculator::default();
        let call = MethodCall::new(DeviceInterface::Frc, frc::EXTRA_RESULT, vec![]);
        assert_eq!(
            calc.time_to_wait_for_response(&request_to(0, call), None, &STD).unwrap(),
            Duration::from_millis(100)
        );
    }

    #[test]
    fn test_frc_without_params_falls_back() {
        let calc = TimingCalculator::default();
        let args = vec![Bytes::from_static(&[0x00])];
        let call = MethodCall::new(DeviceInterface::Frc, frc::SEND, args);
        assert_eq!(
            calc.time_to_wait_for_response(&request_to(0, call), None, &STD).unwrap(),
            Duration::from_millis(100)
        );
    }

    #[test]
    fn test_usual_timing_with_confirmation() {
        let calc = TimingCalculator::default();
        let call = MethodCall::new(DeviceInterface::Os, 0x00, vec![]);
        let confirmation = Confirmation::new(1, 1, 6);

        // (1+1)*6*10 + (1+1)*6*10 + 40
        assert_eq!(
            calc.time_to_wait_for_response(&request_to(3, call), Some(&confirmation), &STD)
                .unwrap(),
            Duration::from_millis(280)
        );
    }

    #[test]
    fn test_base_response_time_is_added() {
        let calc = TimingCalculator::new(DEFAULT_CONFIRMATION_TIMEOUT, Duration::from_millis(500));
        let call = MethodCall::new(DeviceInterface::Os, 0x00, vec![]).with_response_length(2);
        let confirmation = Confirmation::new(0, 0, 4);

        // 1*4*10 + 1*4*10 + 40 + 500
        assert_eq!(
            calc.time_to_wait_for_response(&request_to(1, call.clone()), Some(&confirmation), &STD)
                .unwrap(),
            Duration::from_millis(620)
        );
        assert_eq!(
            calc.time_to_wait_for_response(&request_to(0, call), None, &STD).unwrap(),
            Duration::from_millis(600)
        );
    }

    #[test]
    fn test_uart_timeout_extends_usual_timing() {
        let calc = TimingCalculator::default();
        let call = MethodCall::new(
            DeviceInterface::Uart,
            uart::WRITE_AND_READ,
            vec![Bytes::from_static(&[20]), Bytes::from_static(b"ping")],
        );
        assert_eq!(
            calc.time_to_wait_for_response(&request_to(0, call), None, &STD).unwrap(),
            Duration::from_millis(300)
        );

        let missing = MethodCall::new(DeviceInterface::Uart, uart::WRITE_AND_READ, vec![]);
        assert_eq!(
            calc.time_to_wait_for_response(&request_to(0, missing), None, &STD).unwrap(),
            Duration::from_millis(100)
        );
    }

    #[test]
    fn test_unsupported_profile_propagates() {
        let calc = TimingCalculator::default();
        let call = MethodCall::new(DeviceInterface::Os, 0x00, vec![]);
        let profile = NetworkProfile::new(TransceiverSeries::Tr76x, RfMode::Std);
        let confirmation = Confirmation::new(0, 0, 4);
        assert!(calc
            .time_to_wait_for_response(&request_to(2, call), Some(&confirmation), &profile)
            .is_err());
    }

    #[test]
    fn test_guard_intervals_clamp_to_zero() {
        let calc = TimingCalculator::default();
        let confirmation = Confirmation::new(2, 1, 5);

        assert_eq!(
            calc.time_to_wait_after_confirmation(&confirmation, Duration::from_millis(100)),
            Duration::from_millis(50)
        );
        assert_eq!(
            calc.time_to_wait_after_confirmation(&confirmation, Duration::from_secs(1)),
            Duration::ZERO
        );

        // (1+1) * 4 * 10 for a 3 byte response in STD
        assert_eq!(
            calc.time_to_wait_after_response(
                Some(&confirmation),
                3,
                &STD,
                Duration::from_millis(30)
            )
            .unwrap(),
            Duration::from_millis(50)
        );
        assert_eq!(
            calc.time_to_wait_after_response(None, 3, &STD, Duration::ZERO).unwrap(),
            Duration::ZERO
        );
    }
}
