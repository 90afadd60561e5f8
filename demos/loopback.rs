use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use iqrf_dpa::protocol::{
    AsyncMessage, Confirmation, DeviceInterface, FrcCall, FrcResponseTime, FrcTimingParams,
    Request, Response,
};
use iqrf_dpa::{
    CallRequestProcessingState, DeviceRef, DpaRuntime, DpaTransport, NetworkId, NetworkProfile,
    NodeAddress, ProcessingTime, Result, RfMode, RuntimeConfig, TransceiverSeries, TransportMessage,
    TransportSink,
};
use parking_lot::Mutex;
use tokio::time::{sleep, Instant};

/// Pretends to be a mesh: confirms every routed request, then echoes its
/// arguments back as the response
#[derive(Default)]
struct LoopbackTransport {
    sink: Mutex<Option<TransportSink>>,
}

impl LoopbackTransport {
    fn deliver(&self, message: TransportMessage) {
        if let Some(sink) = self.sink.lock().as_ref() {
            let _ = sink.deliver(message);
        }
    }
}

impl DpaTransport for LoopbackTransport {
    fn register_sink(&self, sink: TransportSink) {
        *self.sink.lock() = Some(sink);
    }

    fn send<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let sink = self.sink.lock().clone();
            let request = request.clone();
            tokio::spawn(async move {
                let Some(sink) = sink else { return };
                if request.expects_confirmation() {
                    sleep(Duration::from_millis(30)).await;
                    let confirmation = Confirmation::new(1, 1, 6);
                    let _ = sink.deliver(TransportMessage::Confirmation(confirmation));
                }
                if request.expects_response() {
                    sleep(Duration::from_millis(120)).await;
                    let echo: Vec<u8> =
                        request.call.args.iter().flat_map(|a| a.iter().copied()).collect();
                    let response = Response::new(echo, Instant::now());
                    let _ = sink.deliver(TransportMessage::Response(response));
                }
            });
            Ok(())
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    iqrf_dpa::util::init_tracing(tracing::Level::DEBUG);

    let network = NetworkId::new("demo");
    let mut config = RuntimeConfig::default();
    config
        .networks
        .insert(network.clone(), NetworkProfile::new(TransceiverSeries::Tr72x, RfMode::Std));

    let transport = Arc::new(LoopbackTransport::default());
    let runtime = DpaRuntime::new(config, transport.clone())?;
    runtime.start()?;

    runtime
        .connector()
        .register_async_msg_listener(Arc::new(|message: &AsyncMessage| {
            println!("async message from node {}: {:?}", message.source_node, message.main_data);
        }));

    println!("Sending requests through the loopback mesh:");
    let node = DeviceRef::new(network.clone(), NodeAddress(1));
    let mut ids = Vec::new();
    for i in 0..3u8 {
        let args = vec![Bytes::copy_from_slice(&[i])];
        let call = iqrf_dpa::MethodCall::new(DeviceInterface::Ram, 0x00, args)
            .with_response_length(1);
        ids.push(runtime.connector().call_method(&node, call, ProcessingTime::Unlimited)?);
    }

    let frc = FrcCall::Send {
        command: 0x80,
        user_data: Bytes::new(),
        timing: FrcTimingParams::new(5, FrcResponseTime::Ms40),
    };
    let coordinator = DeviceRef::coordinator(network.clone());
    ids.push(runtime.connector().call(&coordinator, frc, ProcessingTime::Unlimited)?);

    for id in ids {
        let info = runtime.connector().wait_for_result(id).await?;
        match (info.state, info.result) {
            (CallRequestProcessingState::ResultArrived, Some(result)) => {
                println!(
                    "- {} arrived: {:?} (confirmation {:?})",
                    id, result.main_data, result.confirmation
                );
            }
            _ => println!("- {} failed: {:?}", id, info.error),
        }
    }

    transport.deliver(TransportMessage::Async(AsyncMessage {
        network_id: network,
        source_node: NodeAddress(1),
        peripheral_number: 0x20,
        main_data: Bytes::from_static(b"button"),
        additional_data: Bytes::new(),
    }));
    sleep(Duration::from_millis(50)).await;

    runtime.destroy().await;
    Ok(())
}
