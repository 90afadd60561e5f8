//! Request/response connector
//!
//! Accepts method calls from any task, dispatches them one at a time to a
//! [`WireLayer`], correlates what comes back by correlation ID and fans
//! unsolicited messages out to registered listeners.

mod async_msg;
mod registry;
mod worker;

pub use self::async_msg::{AsyncMessageListener, ListenerId};
pub use self::registry::{CallRequestProcessingInfo, CallRequestProcessingState, CallResult};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::{
    CorrelationId, DeviceRef, Error, NetworkId, ProcessingError, ProcessingTime, Result,
};
use crate::network::{Correlated, InboundHandle, WireLayer};
use crate::protocol::{AsyncMessage, MethodCall, PeripheralCall, Request};
use crate::util::current_runtime;
use self::async_msg::AsyncMsgGenerator;
use self::registry::{Notification, PendingRequest, Registry};
use self::worker::Dispatcher;

/// Receives the outcome of a broadcast call
pub trait BroadcastListener: Send + Sync {
    /// The broadcast was confirmed by the coordinator
    fn on_completed(&self, request_id: CorrelationId, result: &CallResult);

    /// The broadcast failed
    fn on_error(&self, request_id: CorrelationId, error: &ProcessingError);
}

/// Connector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    /// How many times a request is handed to the wire layer before failing
    pub max_send_attempts: u32,
    /// Pause between two attempts of one request
    #[serde(serialize_with = "crate::core::serde::serialize_millis")]
    #[serde(deserialize_with = "crate::core::serde::deserialize_millis")]
    pub attempt_pause: Duration,
    /// Minimal pause between two sends
    #[serde(serialize_with = "crate::core::serde::serialize_millis")]
    #[serde(deserialize_with = "crate::core::serde::deserialize_millis")]
    pub between_send_pause: Duration,
    /// How long a request without result is kept for a late reply
    #[serde(serialize_with = "crate::core::serde::serialize_millis")]
    #[serde(deserialize_with = "crate::core::serde::deserialize_millis")]
    pub idle_request_expiry: Duration,
    /// How long results stay available for polling
    #[serde(serialize_with = "crate::core::serde::serialize_millis")]
    #[serde(deserialize_with = "crate::core::serde::deserialize_millis")]
    pub result_lifetime: Duration,
    /// Period of idle request and result cleanup
    #[serde(serialize_with = "crate::core::serde::serialize_millis")]
    #[serde(deserialize_with = "crate::core::serde::deserialize_millis")]
    pub gc_interval: Duration,
    /// How long `destroy` waits for each task
    #[serde(serialize_with = "crate::core::serde::serialize_millis")]
    #[serde(deserialize_with = "crate::core::serde::deserialize_millis")]
    pub join_timeout: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        ConnectorConfig {
            max_send_attempts: 3,
            attempt_pause: Duration::ZERO,
            between_send_pause: Duration::ZERO,
            idle_request_expiry: Duration::from_secs(30),
            result_lifetime: Duration::from_secs(600),
            gc_interval: Duration::from_secs(1),
            join_timeout: Duration::from_millis(2000),
        }
    }
}

impl ConnectorConfig {
    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_send_attempts == 0 {
            return Err(Error::config("at least one send attempt is required"));
        }
        if self.gc_interval.is_zero() {
            return Err(Error::config("garbage collection interval must be positive"));
        }
        Ok(())
    }
}

/// State shared by the connector handle and its tasks
pub(crate) struct Shared {
    registry: Registry,
    /// Wakes the dispatcher: new request, cancellation, changed deadline
    wake: Notify,
    /// Wakes result waiters
    resolved: Notify,
    async_messages: AsyncMsgGenerator,
}

impl Shared {
    fn finish(&self, notification: Option<Notification>) {
        if let Some(notification) = notification {
            notification.deliver();
        }
        self.resolved.notify_waiters();
    }
}

struct Channels {
    responses: mpsc::UnboundedReceiver<Correlated>,
    async_messages: mpsc::UnboundedReceiver<AsyncMessage>,
}

/// DPA request/response connector
pub struct DpaConnector {
    config: ConnectorConfig,
    shared: Arc<Shared>,
    wire: Arc<dyn WireLayer>,
    next_id: AtomicU64,
    channels: Mutex<Option<Channels>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl DpaConnector {
    /// Creates a connector on top of `wire` and registers for its inbound messages
    pub fn new(config: ConnectorConfig, wire: Arc<dyn WireLayer>) -> Result<Self> {
        config.validate()?;

        let (responses_tx, responses) = mpsc::unbounded_channel();
        let (async_tx, async_messages) = mpsc::unbounded_channel();
        wire.register_listener(InboundHandle::new(responses_tx, async_tx));

        Ok(DpaConnector {
            shared: Arc::new(Shared {
                registry: Registry::new(config.result_lifetime),
                wake: Notify::new(),
                resolved: Notify::new(),
                async_messages: AsyncMsgGenerator::default(),
            }),
            config,
            wire,
            next_id: AtomicU64::new(1),
            channels: Mutex::new(Some(Channels {
                responses,
                async_messages,
            })),
            tasks: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    /// Starts the dispatcher and the async message task
    pub fn start(&self) -> Result<()> {
        let handle = current_runtime()?;
        let Some(channels) = self.channels.lock().take() else {
            debug!("connector already started");
            return Ok(());
        };

        let dispatcher = Dispatcher {
            config: self.config.clone(),
            shared: self.shared.clone(),
            wire: self.wire.clone(),
            responses: channels.responses,
            shutdown: self.shutdown.clone(),
            last_send: None,
        };

        let shared = self.shared.clone();
        let shutdown = self.shutdown.clone();
        let mut async_messages = channels.async_messages;
        let drain = async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    message = async_messages.recv() => match message {
                        Some(message) => shared.async_messages.dispatch(&message),
                        None => break,
                    },
                }
            }
            debug!("async message task stopped");
        };

        let mut tasks = self.tasks.lock();
        tasks.push(handle.spawn(dispatcher.run()));
        tasks.push(handle.spawn(drain));
        info!("connector started");
        Ok(())
    }

    /// Stops all tasks, waiting at most the join timeout for each
    pub async fn destroy(&self) {
        self.shutdown.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let abort = task.abort_handle();
            if time::timeout(self.config.join_timeout, task).await.is_err() {
                warn!("connector task did not stop in time, aborting");
                abort.abort();
            }
        }
        self.shared.resolved.notify_waiters();
        info!("connector destroyed");
    }

    fn next_id(&self) -> CorrelationId {
        CorrelationId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn submit(&self, pending: PendingRequest) -> Result<CorrelationId> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Shutdown);
        }
        pending.max_processing_time.validate()?;

        let id = pending.request.id;
        debug!(
            request = %id,
            address = %pending.request.address(),
            max_processing_time = %pending.max_processing_time,
            "call request queued"
        );
        self.shared.registry.enqueue(pending);
        self.shared.wake.notify_one();
        Ok(id)
    }

    /// Queues a call to one device and returns its correlation ID right away
    pub fn call_method(
        &self,
        device: &DeviceRef,
        call: MethodCall,
        max_processing_time: ProcessingTime,
    ) -> Result<CorrelationId> {
        self.submit(PendingRequest {
            request: Request::unicast(self.next_id(), device, call),
            max_processing_time,
            listener: None,
        })
    }

    /// Queues a typed peripheral call to one device
    pub fn call(
        &self,
        device: &DeviceRef,
        call: impl PeripheralCall,
        max_processing_time: ProcessingTime,
    ) -> Result<CorrelationId> {
        self.call_method(device, call.into_method_call(), max_processing_time)
    }

    /// Queues a call to all nodes of a network; its outcome goes to `listener`
    pub fn broadcast_call_method(
        &self,
        listener: Arc<dyn BroadcastListener>,
        network_id: NetworkId,
        call: MethodCall,
        max_processing_time: ProcessingTime,
    ) -> Result<CorrelationId> {
        self.submit(PendingRequest {
            request: Request::broadcast(self.next_id(), network_id, call),
            max_processing_time,
            listener: Some(listener),
        })
    }

    /// Current processing state of a request, `None` when unknown, cancelled
    /// or expired
    pub fn get_call_request_processing_info(
        &self,
        id: CorrelationId,
    ) -> Option<CallRequestProcessingInfo> {
        self.shared.registry.info(id)
    }

    /// Cancels a request that is not resolved yet. An in-flight request
    /// releases the dispatcher at once.
    pub fn cancel_call_request(&self, id: CorrelationId) -> bool {
        let cancelled = self.shared.registry.cancel(id);
        if cancelled {
            debug!(request = %id, "call request cancelled");
            self.shared.wake.notify_one();
            self.shared.resolved.notify_waiters();
        }
        cancelled
    }

    /// Changes the processing time of a request that is not resolved yet
    pub fn set_call_request_maximal_processing_time(
        &self,
        id: CorrelationId,
        time: ProcessingTime,
    ) -> Result<()> {
        time.validate()?;
        self.shared.registry.set_max_processing_time(id, time)?;
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Waits until the request is resolved and returns its final info
    pub async fn wait_for_result(&self, id: CorrelationId) -> Result<CallRequestProcessingInfo> {
        loop {
            let notified = self.shared.resolved.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.shared.registry.info(id) {
                Some(info) if info.is_final() => return Ok(info),
                Some(_) => {}
                None => return Err(Error::invalid_argument(format!("unknown request {}", id))),
            }
            if self.shutdown.is_cancelled() {
                return Err(Error::Shutdown);
            }
            notified.await;
        }
    }

    pub fn register_async_msg_listener(
        &self,
        listener: Arc<dyn AsyncMessageListener>,
    ) -> ListenerId {
        self.shared.async_messages.register(listener)
    }

    pub fn unregister_async_msg_listener(&self, id: ListenerId) -> bool {
        self.shared.async_messages.unregister(id)
    }
}

impl Drop for DpaConnector {
    fn drop(&mut self) {
        self.shutdown.cancel();
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}
