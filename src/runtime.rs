//! Runtime assembly
//!
//! Wires a transport, the protocol state machine, the protocol layer and the
//! connector together and drives their lifecycle.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::connector::{ConnectorConfig, DpaConnector};
use crate::core::{Error, NetworkId, NetworkProfile, Result};
use crate::network::DpaTransport;
use crate::protocol::{DpaProtocolLayer, LayerConfig, ProtocolConfig, ProtocolStateMachine};

/// Configuration of the whole runtime
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub protocol: ProtocolConfig,
    pub layer: LayerConfig,
    pub connector: ConnectorConfig,
    /// Timing profiles of the served networks
    pub networks: HashMap<NetworkId, NetworkProfile>,
}

impl RuntimeConfig {
    /// Parses a JSON configuration; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: RuntimeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        self.protocol.validate()?;
        self.connector.validate()?;
        if self.layer.free_for_send_timeout.is_zero() {
            return Err(Error::config("free for send timeout must be positive"));
        }
        Ok(())
    }
}

/// DPA runtime: connector on top of a state machine guarded transport
pub struct DpaRuntime {
    machine: Arc<ProtocolStateMachine>,
    layer: Arc<DpaProtocolLayer>,
    connector: DpaConnector,
}

impl DpaRuntime {
    /// Assembles the runtime; call [`start`](Self::start) to run it
    pub fn new(config: RuntimeConfig, transport: Arc<dyn DpaTransport>) -> Result<Self> {
        config.validate()?;

        let machine = Arc::new(ProtocolStateMachine::new(config.protocol));
        for (network_id, profile) in config.networks {
            machine.configure(network_id, profile);
        }

        let layer = Arc::new(DpaProtocolLayer::new(config.layer, machine.clone(), transport));
        let connector = DpaConnector::new(config.connector, layer.clone())?;

        Ok(DpaRuntime {
            machine,
            layer,
            connector,
        })
    }

    pub fn start(&self) -> Result<()> {
        self.layer.start()?;
        self.connector.start()?;
        info!(version = crate::VERSION, "DPA runtime started");
        Ok(())
    }

    /// Stops the connector first, then the protocol layer and its machine
    pub async fn destroy(&self) {
        self.connector.destroy().await;
        self.layer.destroy().await;
        info!("DPA runtime destroyed");
    }

    pub fn connector(&self) -> &DpaConnector {
        &self.connector
    }

    pub fn state_machine(&self) -> &Arc<ProtocolStateMachine> {
        &self.machine
    }

    /// Sets the timing profile of a network; later calls overwrite
    pub fn configure(&self, network_id: NetworkId, profile: NetworkProfile) {
        self.machine.configure(network_id, profile);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::CallRequestProcessingState;
    use crate::core::{DeviceRef, NodeAddress, ProcessingTime, RfMode, TransceiverSeries};
    use crate::network::{TransportMessage, TransportSink};
    use crate::protocol::{
        Confirmation, DeviceInterface, MethodCall, ProtocolState, Request, Response,
        StateTransition,
    };
    use futures::future::BoxFuture;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio::sync::{broadcast, Notify};
    use tokio::time::Instant;

    #[derive(Default)]
    struct ManualTransport {
        sink: Mutex<Option<TransportSink>>,
        sent: Mutex<Vec<Request>>,
        sends: Notify,
    }

    impl ManualTransport {
        fn inject(&self, message: TransportMessage) {
            self.sink.lock().as_ref().unwrap().deliver(message).unwrap();
        }

        async fn wait_sent(&self, count: usize) {
            loop {
                let notified = self.sends.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.sent.lock().len() >= count {
                    return;
                }
                notified.await;
            }
        }
    }

    impl DpaTransport for ManualTransport {
        fn register_sink(&self, sink: TransportSink) {
            *self.sink.lock() = Some(sink);
        }

        fn send<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<()>> {
            Box::pin(async move {
                self.sent.lock().push(request.clone());
                self.sends.notify_waiters();
                Ok(())
            })
        }
    }

    async fn next_state(transitions: &mut broadcast::Receiver<StateTransition>) -> ProtocolState {
        transitions.recv().await.unwrap().to
    }

    #[tokio::test(start_paused = true)]
    async fn test_unicast_end_to_end() {
        let transport = Arc::new(ManualTransport::default());
        let runtime = DpaRuntime::new(RuntimeConfig::default(), transport.clone()).unwrap();
        let mut transitions = runtime.state_machine().subscribe();
        runtime.start().unwrap();

        let device = DeviceRef::new(NetworkId::new("iqrf"), NodeAddress(1));
        let id = runtime
            .connector()
            .call_method(
                &device,
                MethodCall::new(DeviceInterface::Os, 0x00, vec![]),
                ProcessingTime::Unlimited,
            )
            .unwrap();

        transport.wait_sent(1).await;
        assert_eq!(next_state(&mut transitions).await, ProtocolState::WaitingForConfirmation);

        transport.inject(TransportMessage::Confirmation(Confirmation::new(1, 1, 6)));
        assert_eq!(next_state(&mut transitions).await, ProtocolState::WaitingForResponse);

        transport.inject(TransportMessage::Response(Response::new(
            vec![0x12, 0x34],
            Instant::now(),
        )));
        assert_eq!(next_state(&mut transitions).await, ProtocolState::WaitingAfterResponse);
        assert_eq!(next_state(&mut transitions).await, ProtocolState::FreeForSend);

        let info = runtime.connector().wait_for_result(id).await.unwrap();
        assert_eq!(info.state, CallRequestProcessingState::ResultArrived);
        assert_eq!(&info.result.unwrap().main_data[..], &[0x12, 0x34][..]);
        runtime.destroy().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmation_timeout_resolves_error() {
        let transport = Arc::new(ManualTransport::default());
        let runtime = DpaRuntime::new(RuntimeConfig::default(), transport.clone()).unwrap();
        runtime.start().unwrap();

        let device = DeviceRef::new(NetworkId::new("iqrf"), NodeAddress(4));
        let id = runtime
            .connector()
            .call_method(
                &device,
                MethodCall::new(DeviceInterface::LedR, 0x01, vec![]),
                ProcessingTime::Unlimited,
            )
            .unwrap();

        let started = Instant::now();
        let info = runtime.connector().wait_for_result(id).await.unwrap();
        assert_eq!(info.state, CallRequestProcessingState::Error);
        assert_eq!(info.error, Some(crate::core::ProcessingError::ConfirmationTimeout));
        assert!(started.elapsed() >= Duration::from_millis(2000));
        assert!(runtime.state_machine().is_free_for_send());
        runtime.destroy().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_are_serialized() {
        let transport = Arc::new(ManualTransport::default());
        let runtime = DpaRuntime::new(RuntimeConfig::default(), transport.clone()).unwrap();
        runtime.start().unwrap();

        let coordinator = DeviceRef::coordinator(NetworkId::new("iqrf"));
        let call = MethodCall::new(DeviceInterface::Coordinator, 0x00, vec![]);
        let first = runtime
            .connector()
            .call_method(&coordinator, call.clone(), ProcessingTime::Unlimited)
            .unwrap();
        let second = runtime
            .connector()
            .call_method(&coordinator, call, ProcessingTime::Unlimited)
            .unwrap();

        transport.wait_sent(1).await;
        assert_eq!(transport.sent.lock().len(), 1);
        transport.inject(TransportMessage::Response(Response::new(vec![0x01], Instant::now())));
        runtime.connector().wait_for_result(first).await.unwrap();

        transport.wait_sent(2).await;
        transport.inject(TransportMessage::Response(Response::new(vec![0x02], Instant::now())));
        let info = runtime.connector().wait_for_result(second).await.unwrap();
        assert_eq!(&info.result.unwrap().main_data[..], &[0x02][..]);
        runtime.destroy().await;
    }

    #[test]
    fn test_config_from_json() {
        let config = RuntimeConfig::from_json_str(
            r#"{
                "protocol": { "confirmation_timeout": 3000 },
                "connector": { "max_send_attempts": 5, "between_send_pause": 50 },
                "networks": { "iqrf": { "series": "Tr72x", "rf_mode": "Lp" } }
            }"#,
        )
        .unwrap();

        assert_eq!(config.protocol.confirmation_timeout, Duration::from_millis(3000));
        assert_eq!(config.protocol.liveness_timeout, Duration::from_millis(1500));
        assert_eq!(config.connector.max_send_attempts, 5);
        assert_eq!(config.connector.between_send_pause, Duration::from_millis(50));
        assert_eq!(config.layer.free_for_send_timeout, Duration::from_secs(10));
        assert_eq!(
            config.networks[&NetworkId::new("iqrf")],
            NetworkProfile::new(TransceiverSeries::Tr72x, RfMode::Lp)
        );
    }

    #[test]
    fn test_invalid_config() {
        let zero_attempts =
            RuntimeConfig::from_json_str(r#"{ "connector": { "max_send_attempts": 0 } }"#);
        assert!(matches!(zero_attempts, Err(Error::Config(_))));

        let malformed = RuntimeConfig::from_json_str("{ not json");
        assert!(matches!(malformed, Err(Error::Json(_))));

        let missing = RuntimeConfig::from_json_file("/nonexistent/iqrf_dpa.json");
        assert!(matches!(missing, Err(Error::Io(_))));
    }
}
