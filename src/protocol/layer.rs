//! DPA protocol layer
//!
//! Sits between the connector and a raw transport. Every request goes
//! through the protocol state machine before it touches the wire, and raw
//! confirmations and responses are fed to the machine before they are
//! correlated and passed up.

use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::{CorrelationId, Error, ProcessingError, ProcessingTime, Result};
use crate::network::{
    DpaTransport, InboundHandle, TransportMessage, TransportSink, WireLayer, WireMessage,
};
use crate::util::saturating_deadline;
use super::message::{CallResponse, Request};
use super::state::{ProtocolStateMachine, StateMachineListener};

/// Protocol layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerConfig {
    /// How long a send waits for the network to become free
    #[serde(serialize_with = "crate::core::serde::serialize_millis")]
    #[serde(deserialize_with = "crate::core::serde::deserialize_millis")]
    pub free_for_send_timeout: Duration,
}

impl Default for LayerConfig {
    fn default() -> Self {
        LayerConfig {
            free_for_send_timeout: Duration::from_secs(10),
        }
    }
}

/// Request currently occupying the network
#[derive(Debug, Clone, Copy)]
struct Current {
    id: CorrelationId,
    broadcast: bool,
}

struct LayerInner {
    config: LayerConfig,
    machine: Arc<ProtocolStateMachine>,
    transport: Arc<dyn DpaTransport>,
    current: Mutex<Option<Current>>,
    upstream: RwLock<Option<InboundHandle>>,
    free: Notify,
    send_lock: tokio::sync::Mutex<()>,
}

impl LayerInner {
    fn forward(&self, message: WireMessage) {
        match self.upstream.read().as_ref() {
            Some(inbound) => {
                if let Err(e) = inbound.deliver(message) {
                    warn!(error = %e, "connector gone, inbound message dropped");
                }
            }
            None => warn!("no connector registered, inbound message dropped"),
        }
    }

    fn fail_current(&self, error: ProcessingError) {
        if let Some(current) = self.current.lock().take() {
            debug!(request = %current.id, %error, "request failed in protocol layer");
            self.forward(WireMessage::Response(CallResponse::failure(current.id, error)));
        }
    }

    async fn wait_free_for_send(&self) -> Result<()> {
        let deadline = saturating_deadline(Instant::now(), self.config.free_for_send_timeout);
        loop {
            if self.machine.has_error() {
                warn!("protocol state machine in error, resetting before send");
                self.machine.reset()?;
            }
            if self.machine.is_free_for_send() {
                return Ok(());
            }
            if time::timeout_at(deadline, self.free.notified()).await.is_err() {
                return Err(Error::dispatch(format!(
                    "network not free for send within {} ms",
                    self.config.free_for_send_timeout.as_millis()
                )));
            }
        }
    }

    async fn send(&self, request: &Request) -> Result<()> {
        let _guard = self.send_lock.lock().await;
        self.wait_free_for_send().await?;

        *self.current.lock() = Some(Current {
            id: request.id,
            broadcast: request.is_broadcast(),
        });
        if let Err(e) = self.machine.new_request(request).await {
            self.current.lock().take();
            return Err(e);
        }

        if let Err(e) = self.transport.send(request).await {
            warn!(request = %request.id, error = %e, "transport send failed, abandoning exchange");
            self.current.lock().take();
            self.machine.reset()?;
            return Err(e);
        }
        debug!(request = %request.id, address = %request.address(), "request sent");
        Ok(())
    }

    async fn handle(&self, message: TransportMessage) {
        match message {
            TransportMessage::Confirmation(confirmation) => {
                match self.machine.confirmation_received(Instant::now(), confirmation).await {
                    Ok(()) => {
                        let current = {
                            let mut current = self.current.lock();
                            match *current {
                                // a broadcast ends with its confirmation
                                Some(c) if c.broadcast => current.take(),
                                other => other,
                            }
                        };
                        match current {
                            Some(current) => self.forward(WireMessage::Confirmation {
                                request_id: current.id,
                                confirmation,
                            }),
                            None => warn!("confirmation without a current request"),
                        }
                    }
                    Err(Error::StateTimeouted(_)) => debug!("late confirmation dropped"),
                    Err(e) => warn!(error = %e, "confirmation rejected"),
                }
            }
            TransportMessage::Response(response) => {
                let main_data = response.data.clone();
                let additional_data = response.additional_data.clone();
                match self.machine.response_received(response.received_at, response).await {
                    Ok(()) => match self.current.lock().take() {
                        Some(current) => self.forward(WireMessage::Response(CallResponse::success(
                            current.id,
                            main_data,
                            additional_data,
                        ))),
                        None => warn!("response without a current request"),
                    },
                    Err(Error::StateTimeouted(_)) => debug!("late response dropped"),
                    Err(e) => warn!(error = %e, "response rejected"),
                }
            }
            TransportMessage::Async(message) => self.forward(WireMessage::Async(message)),
        }
    }
}

/// Bridges state machine notifications back into the layer
struct LayerListener(Weak<LayerInner>);

impl StateMachineListener for LayerListener {
    fn on_free_for_send(&self) {
        if let Some(inner) = self.0.upgrade() {
            inner.free.notify_one();
        }
    }

    fn on_confirmation_timeouted(&self) {
        if let Some(inner) = self.0.upgrade() {
            inner.fail_current(ProcessingError::ConfirmationTimeout);
        }
    }

    fn on_response_timeouted(&self) {
        if let Some(inner) = self.0.upgrade() {
            inner.fail_current(ProcessingError::ResponseTimeout);
        }
    }

    fn on_error(&self, error: &Error) {
        if let Some(inner) = self.0.upgrade() {
            inner.fail_current(ProcessingError::Internal(error.to_string()));
            // wake a waiting sender so it can reset the machine
            inner.free.notify_one();
        }
    }
}

/// Wire layer guarded by a protocol state machine
pub struct DpaProtocolLayer {
    inner: Arc<LayerInner>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<TransportMessage>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl DpaProtocolLayer {
    /// Creates the layer and hooks it to the machine and the transport
    pub fn new(
        config: LayerConfig,
        machine: Arc<ProtocolStateMachine>,
        transport: Arc<dyn DpaTransport>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        transport.register_sink(TransportSink::new(tx));

        let inner = Arc::new(LayerInner {
            config,
            machine: machine.clone(),
            transport,
            current: Mutex::new(None),
            upstream: RwLock::new(None),
            free: Notify::new(),
            send_lock: tokio::sync::Mutex::new(()),
        });
        machine.register_listener(Arc::new(LayerListener(Arc::downgrade(&inner))));

        DpaProtocolLayer {
            inner,
            inbound: Mutex::new(Some(rx)),
            pump: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn machine(&self) -> &Arc<ProtocolStateMachine> {
        &self.inner.machine
    }

    /// Starts the state machine and the inbound pump
    pub fn start(&self) -> Result<()> {
        self.inner.machine.start()?;

        let Some(mut rx) = self.inbound.lock().take() else {
            return Ok(());
        };
        let inner = self.inner.clone();
        let shutdown = self.shutdown.clone();
        let pump = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    message = rx.recv() => match message {
                        Some(message) => inner.handle(message).await,
                        None => break,
                    },
                }
            }
            debug!("protocol layer pump stopped");
        });
        *self.pump.lock() = Some(pump);
        info!("protocol layer started");
        Ok(())
    }

    /// Stops the pump and the state machine
    pub async fn destroy(&self) {
        self.shutdown.cancel();
        let pump = self.pump.lock().take();
        if let Some(pump) = pump {
            let abort = pump.abort_handle();
            if time::timeout(self.inner.machine.config().join_timeout, pump).await.is_err() {
                warn!("protocol layer pump did not stop in time, aborting");
                abort.abort();
            }
        }
        self.inner.machine.destroy().await;
        info!("protocol layer destroyed");
    }
}

impl WireLayer for DpaProtocolLayer {
    fn register_listener(&self, inbound: InboundHandle) {
        *self.inner.upstream.write() = Some(inbound);
    }

    fn send_request<'a>(
        &'a self,
        request: &'a Request,
        _max_processing_time: ProcessingTime,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.inner.send(request))
    }
}
