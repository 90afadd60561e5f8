use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use crate::core::{Error, NetworkId, NetworkProfile, Result, TimeoutKind};
use crate::util::{current_runtime, saturating_deadline};
use super::message::{Confirmation, Request, Response};
use super::timing::{TimingCalculator, DEFAULT_CONFIRMATION_TIMEOUT};

/// State of the DPA exchange currently going through the network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolState {
    /// No exchange in progress, a new request may be sent
    FreeForSend,
    /// Request sent, waiting for its routing confirmation
    WaitingForConfirmation,
    /// Confirmation did not arrive in time
    WaitingForConfirmationError,
    /// Broadcast confirmed, waiting until it is flooded through the network
    WaitingAfterConfirmation,
    /// Waiting for the response
    WaitingForResponse,
    /// Response did not arrive in time
    WaitingForResponseError,
    /// Response received, waiting until its routing finishes
    WaitingAfterResponse,
}

impl ProtocolState {
    /// Returns whether an exchange occupies the network in this state
    pub fn is_busy(&self) -> bool {
        !matches!(self, ProtocolState::FreeForSend)
    }
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtocolState::FreeForSend => "FREE_FOR_SEND",
            ProtocolState::WaitingForConfirmation => "WAITING_FOR_CONFIRMATION",
            ProtocolState::WaitingForConfirmationError => "WAITING_FOR_CONFIRMATION_ERROR",
            ProtocolState::WaitingAfterConfirmation => "WAITING_AFTER_CONFIRMATION",
            ProtocolState::WaitingForResponse => "WAITING_FOR_RESPONSE",
            ProtocolState::WaitingForResponseError => "WAITING_FOR_RESPONSE_ERROR",
            ProtocolState::WaitingAfterResponse => "WAITING_AFTER_RESPONSE",
        };
        f.write_str(name)
    }
}

/// One state change, as published to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub from: ProtocolState,
    pub to: ProtocolState,
    pub at: Instant,
}

/// Receives notifications from the state machine worker.
///
/// Callbacks run on the worker task and must not block.
pub trait StateMachineListener: Send + Sync {
    /// A new request may be sent
    fn on_free_for_send(&self) {}

    /// The confirmation of the current request did not arrive in time
    fn on_confirmation_timeouted(&self) {}

    /// The response of the current request did not arrive in time
    fn on_response_timeouted(&self) {}

    /// The machine hit an internal error and needs a reset
    fn on_error(&self, _error: &Error) {}
}

/// Protocol state machine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Time to wait for a confirmation
    #[serde(serialize_with = "crate::core::serde::serialize_millis")]
    #[serde(deserialize_with = "crate::core::serde::deserialize_millis")]
    pub confirmation_timeout: Duration,
    /// Base time added to every response wait
    #[serde(serialize_with = "crate::core::serde::serialize_millis")]
    #[serde(deserialize_with = "crate::core::serde::deserialize_millis")]
    pub base_response_time: Duration,
    /// How long a caller waits for the worker to process its event
    #[serde(serialize_with = "crate::core::serde::serialize_millis")]
    #[serde(deserialize_with = "crate::core::serde::deserialize_millis")]
    pub liveness_timeout: Duration,
    /// How long `destroy` waits for the worker to stop
    #[serde(serialize_with = "crate::core::serde::serialize_millis")]
    #[serde(deserialize_with = "crate::core::serde::deserialize_millis")]
    pub join_timeout: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig {
            confirmation_timeout: DEFAULT_CONFIRMATION_TIMEOUT,
            base_response_time: Duration::ZERO,
            liveness_timeout: Duration::from_millis(1500),
            join_timeout: Duration::from_millis(2000),
        }
    }
}

impl ProtocolConfig {
    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        if self.liveness_timeout.is_zero() {
            return Err(Error::config("liveness timeout must be positive"));
        }
        if self.confirmation_timeout.is_zero() {
            return Err(Error::config("confirmation timeout must be positive"));
        }
        Ok(())
    }
}

/// Events sent from callers to the worker
enum Event {
    NewRequest {
        request: Request,
        sent_at: Instant,
        reply: oneshot::Sender<Result<()>>,
    },
    Confirmation {
        recv_time: Instant,
        confirmation: Confirmation,
        reply: oneshot::Sender<Result<()>>,
    },
    Response {
        recv_time: Instant,
        response: Response,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// State shared between the handle and the worker
struct Shared {
    config: ProtocolConfig,
    timing: TimingCalculator,
    state: watch::Sender<ProtocolState>,
    transitions: broadcast::Sender<StateTransition>,
    error: AtomicBool,
    profiles: RwLock<HashMap<NetworkId, NetworkProfile>>,
    listener: RwLock<Option<Arc<dyn StateMachineListener>>>,
}

impl Shared {
    fn profile(&self, network_id: &NetworkId) -> NetworkProfile {
        self.profiles
            .read()
            .get(network_id)
            .copied()
            .unwrap_or_default()
    }

    fn listener(&self) -> Option<Arc<dyn StateMachineListener>> {
        self.listener.read().clone()
    }

    fn publish(&self, from: ProtocolState, to: ProtocolState) {
        self.state.send_replace(to);
        // nobody subscribed is fine
        let _ = self.transitions.send(StateTransition {
            from,
            to,
            at: Instant::now(),
        });
    }

    /// Sets the sticky error flag
    fn raise(&self, err: &Error) {
        self.error.store(true, Ordering::SeqCst);
        error!(error = %err, "protocol state machine failed, reset required");
        if let Some(listener) = self.listener() {
            listener.on_error(err);
        }
    }
}

/// The exchange the worker is currently timing
struct Exchange {
    request: Request,
    profile: NetworkProfile,
    confirmation: Option<Confirmation>,
}

/// Background task owning all transitions
struct Worker {
    shared: Arc<Shared>,
    events: mpsc::UnboundedReceiver<Event>,
    state: ProtocolState,
    deadline: Option<Instant>,
    exchange: Option<Exchange>,
    last_timeout: Option<TimeoutKind>,
}

impl Worker {
    async fn run(mut self) {
        debug!("protocol state machine worker started");
        loop {
            let outcome = match self.deadline {
                Some(deadline) => tokio::select! {
                    biased;
                    event = self.events.recv() => match event {
                        Some(event) => self.handle_event(event),
                        None => break,
                    },
                    _ = time::sleep_until(deadline) => self.on_deadline(),
                },
                None => match self.events.recv().await {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
            };

            if let Err(err) = outcome {
                self.shared.raise(&err);
                break;
            }
        }
        debug!("protocol state machine worker stopped");
    }

    fn transition(&mut self, to: ProtocolState) {
        let from = self.state;
        self.state = to;
        debug!(%from, %to, "protocol state transition");
        self.shared.publish(from, to);

        let Some(listener) = self.shared.listener() else {
            return;
        };
        match to {
            ProtocolState::FreeForSend => listener.on_free_for_send(),
            ProtocolState::WaitingForConfirmationError => listener.on_confirmation_timeouted(),
            ProtocolState::WaitingForResponseError => listener.on_response_timeouted(),
            _ => {}
        }
    }

    fn finish_exchange(&mut self) {
        self.exchange = None;
        self.deadline = None;
        self.transition(ProtocolState::FreeForSend);
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.map_or(false, |deadline| Instant::now() >= deadline)
    }

    /// Processes one caller event. `Err` is an internal error halting the worker.
    fn handle_event(&mut self, event: Event) -> Result<()> {
        match event {
            Event::NewRequest {
                request,
                sent_at,
                reply,
            } => {
                let result = self.on_new_request(request, sent_at);
                respond(reply, result)
            }
            Event::Confirmation {
                recv_time,
                confirmation,
                reply,
            } => {
                let result = self.on_confirmation(recv_time, confirmation);
                respond(reply, result)
            }
            Event::Response {
                recv_time,
                response,
                reply,
            } => {
                let result = self.on_response(recv_time, response);
                respond(reply, result)
            }
        }
    }

    fn on_new_request(&mut self, request: Request, sent_at: Instant) -> Step {
        if self.state != ProtocolState::FreeForSend {
            return Step::Refused(Error::invalid_state(format!(
                "cannot send request {} in state {}",
                request.id, self.state
            )));
        }

        let profile = self.shared.profile(&request.network_id);
        self.last_timeout = None;

        if request.expects_confirmation() {
            let wait = self.shared.timing.time_to_wait_for_confirmation();
            self.deadline = Some(saturating_deadline(sent_at, wait));
            self.exchange = Some(Exchange {
                request,
                profile,
                confirmation: None,
            });
            self.transition(ProtocolState::WaitingForConfirmation);
            return Step::Done;
        }

        let wait = match self.shared.timing.time_to_wait_for_response(&request, None, &profile) {
            Ok(wait) => wait,
            Err(e) => return Step::Failed(e),
        };
        debug!(
            request = %request.id,
            wait_ms = wait.as_millis() as u64,
            "waiting for coordinator response"
        );
        self.deadline = Some(saturating_deadline(sent_at, wait));
        self.exchange = Some(Exchange {
            request,
            profile,
            confirmation: None,
        });
        self.transition(ProtocolState::WaitingForResponse);
        Step::Done
    }

    fn on_confirmation(&mut self, recv_time: Instant, confirmation: Confirmation) -> Step {
        match self.state {
            ProtocolState::WaitingForConfirmation => {}
            ProtocolState::FreeForSend if self.last_timeout == Some(TimeoutKind::Confirmation) => {
                return Step::Refused(Error::StateTimeouted(TimeoutKind::Confirmation));
            }
            state => {
                return Step::Refused(Error::invalid_state(format!(
                    "confirmation received in state {}",
                    state
                )));
            }
        }

        if self.deadline_passed() {
            self.on_timeout(TimeoutKind::Confirmation);
            return Step::Refused(Error::StateTimeouted(TimeoutKind::Confirmation));
        }

        let Some(exchange) = self.exchange.as_mut() else {
            return Step::Failed(Error::internal("waiting for confirmation without an exchange"));
        };
        exchange.confirmation = Some(confirmation);

        if exchange.request.expects_response() {
            let wait = match self.shared.timing.time_to_wait_for_response(
                &exchange.request,
                Some(&confirmation),
                &exchange.profile,
            ) {
                Ok(wait) => wait,
                Err(e) => return Step::Failed(e),
            };
            debug!(
                request = %exchange.request.id,
                wait_ms = wait.as_millis() as u64,
                "waiting for response"
            );
            self.deadline = Some(saturating_deadline(recv_time, wait));
            self.transition(ProtocolState::WaitingForResponse);
        } else {
            let guard = self
                .shared
                .timing
                .time_to_wait_after_confirmation(&confirmation, recv_time.elapsed());
            self.deadline = Some(saturating_deadline(Instant::now(), guard));
            self.transition(ProtocolState::WaitingAfterConfirmation);
        }
        Step::Done
    }

    fn on_response(&mut self, recv_time: Instant, response: Response) -> Step {
        match self.state {
            ProtocolState::WaitingForResponse => {}
            ProtocolState::FreeForSend if self.last_timeout == Some(TimeoutKind::Response) => {
                return Step::Refused(Error::StateTimeouted(TimeoutKind::Response));
            }
            state => {
                return Step::Refused(Error::invalid_state(format!(
                    "response received in state {}",
                    state
                )));
            }
        }

        if self.deadline_passed() {
            self.on_timeout(TimeoutKind::Response);
            return Step::Refused(Error::StateTimeouted(TimeoutKind::Response));
        }

        let Some(exchange) = self.exchange.as_ref() else {
            return Step::Failed(Error::internal("waiting for response without an exchange"));
        };
        let guard = match self.shared.timing.time_to_wait_after_response(
            exchange.confirmation.as_ref(),
            response.data.len(),
            &exchange.profile,
            recv_time.elapsed(),
        ) {
            Ok(guard) => guard,
            Err(e) => return Step::Failed(e),
        };
        self.deadline = Some(saturating_deadline(Instant::now(), guard));
        self.transition(ProtocolState::WaitingAfterResponse);
        Step::Done
    }

    fn on_timeout(&mut self, kind: TimeoutKind) {
        let request = self.exchange.as_ref().map(|exchange| exchange.request.id);
        warn!(?request, %kind, "waiting timeouted");
        self.last_timeout = Some(kind);
        self.transition(match kind {
            TimeoutKind::Confirmation => ProtocolState::WaitingForConfirmationError,
            TimeoutKind::Response => ProtocolState::WaitingForResponseError,
        });
        // error states are left right away, nothing else can happen in them
        self.finish_exchange();
    }

    fn on_deadline(&mut self) -> Result<()> {
        match self.state {
            ProtocolState::WaitingForConfirmation => self.on_timeout(TimeoutKind::Confirmation),
            ProtocolState::WaitingForResponse => self.on_timeout(TimeoutKind::Response),
            ProtocolState::WaitingAfterConfirmation | ProtocolState::WaitingAfterResponse => {
                self.finish_exchange()
            }
            _ => self.deadline = None,
        }
        Ok(())
    }
}

/// Outcome of processing one event
enum Step {
    /// Transition done
    Done,
    /// Precondition not met, machine unchanged
    Refused(Error),
    /// Internal error, machine must be reset
    Failed(Error),
}

fn respond(reply: oneshot::Sender<Result<()>>, step: Step) -> Result<()> {
    match step {
        Step::Done => {
            let _ = reply.send(Ok(()));
            Ok(())
        }
        Step::Refused(err) => {
            let _ = reply.send(Err(err));
            Ok(())
        }
        Step::Failed(err) => {
            let _ = reply.send(Err(Error::internal(err.to_string())));
            Err(err)
        }
    }
}

/// Running worker and its inbox
struct Running {
    events: mpsc::UnboundedSender<Event>,
    task: JoinHandle<()>,
}

/// Timing state machine guarding the half-duplex DPA exchange.
///
/// A single background task owns the state and all timing waits. Callers
/// talk to it over a channel and wait for the transition they caused, at
/// most for the configured liveness timeout.
pub struct ProtocolStateMachine {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl ProtocolStateMachine {
    /// Creates a new protocol state machine; call [`start`](Self::start) to run it
    pub fn new(config: ProtocolConfig) -> Self {
        let (state, _) = watch::channel(ProtocolState::FreeForSend);
        let (transitions, _) = broadcast::channel(64);
        let timing = TimingCalculator::new(config.confirmation_timeout, config.base_response_time);

        ProtocolStateMachine {
            shared: Arc::new(Shared {
                config,
                timing,
                state,
                transitions,
                error: AtomicBool::new(false),
                profiles: RwLock::new(HashMap::new()),
                listener: RwLock::new(None),
            }),
            running: Mutex::new(None),
        }
    }

    /// Starts the background worker on the current tokio runtime
    pub fn start(&self) -> Result<()> {
        let handle = current_runtime()?;
        let mut running = self.running.lock();
        if running.is_none() {
            *running = Some(self.spawn_worker(&handle));
            info!("protocol state machine started");
        }
        Ok(())
    }

    fn spawn_worker(&self, handle: &Handle) -> Running {
        let (events, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            shared: self.shared.clone(),
            events: rx,
            state: *self.shared.state.borrow(),
            deadline: None,
            exchange: None,
            last_timeout: None,
        };
        Running {
            events,
            task: handle.spawn(worker.run()),
        }
    }

    /// Registers the listener, replacing any previous one
    pub fn register_listener(&self, listener: Arc<dyn StateMachineListener>) {
        *self.shared.listener.write() = Some(listener);
    }

    pub fn unregister_listener(&self) {
        *self.shared.listener.write() = None;
    }

    /// Sets the timing profile of a network; later calls overwrite
    pub fn configure(&self, network_id: NetworkId, profile: NetworkProfile) {
        debug!(%network_id, ?profile, "network timing profile configured");
        self.shared.profiles.write().insert(network_id, profile);
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.shared.config
    }

    pub fn timing(&self) -> &TimingCalculator {
        &self.shared.timing
    }

    pub fn state(&self) -> ProtocolState {
        *self.shared.state.borrow()
    }

    /// Receiver always holding the latest state
    pub fn watch_state(&self) -> watch::Receiver<ProtocolState> {
        self.shared.state.subscribe()
    }

    /// Stream of every transition from now on
    pub fn subscribe(&self) -> broadcast::Receiver<StateTransition> {
        self.shared.transitions.subscribe()
    }

    pub fn has_error(&self) -> bool {
        self.shared.error.load(Ordering::SeqCst)
    }

    pub fn is_free_for_send(&self) -> bool {
        !self.has_error() && self.state() == ProtocolState::FreeForSend
    }

    /// Announces a request that is being sent now.
    ///
    /// Fails unless the machine is free for send.
    pub async fn new_request(&self, request: &Request) -> Result<()> {
        let request = request.clone();
        let sent_at = Instant::now();
        self.submit(|reply| Event::NewRequest {
            request,
            sent_at,
            reply,
        })
        .await
    }

    /// Delivers the confirmation of the current request.
    ///
    /// Fails with [`Error::StateTimeouted`] when the confirmation window had
    /// already elapsed.
    pub async fn confirmation_received(
        &self,
        recv_time: Instant,
        confirmation: Confirmation,
    ) -> Result<()> {
        self.submit(|reply| Event::Confirmation {
            recv_time,
            confirmation,
            reply,
        })
        .await
    }

    /// Delivers the response of the current request.
    ///
    /// Fails with [`Error::StateTimeouted`] when the response window had
    /// already elapsed.
    pub async fn response_received(&self, recv_time: Instant, response: Response) -> Result<()> {
        self.submit(|reply| Event::Response {
            recv_time,
            response,
            reply,
        })
        .await
    }

    async fn submit<F>(&self, make_event: F) -> Result<()>
    where
        F: FnOnce(oneshot::Sender<Result<()>>) -> Event,
    {
        if self.has_error() {
            return Err(Error::internal("state machine is in error, reset required"));
        }

        let events = self
            .running
            .lock()
            .as_ref()
            .map(|running| running.events.clone())
            .ok_or_else(|| Error::invalid_state("state machine is not running"))?;

        let (tx, rx) = oneshot::channel();
        events
            .send(make_event(tx))
            .map_err(|_| Error::internal("state machine worker stopped"))?;

        match time::timeout(self.shared.config.liveness_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::internal("state machine worker dropped the event")),
            Err(_) => {
                let err = Error::internal(format!(
                    "state machine worker did not respond within {} ms",
                    self.shared.config.liveness_timeout.as_millis()
                ));
                self.shared.raise(&err);
                Err(err)
            }
        }
    }

    /// Forces the machine back to free for send, clears the error flag and
    /// restarts the worker.
    pub fn reset(&self) -> Result<()> {
        let handle = current_runtime()?;
        let mut running = self.running.lock();
        if let Some(old) = running.take() {
            old.task.abort();
        }

        self.shared.error.store(false, Ordering::SeqCst);
        let previous = self.shared.state.borrow().clone();
        self.shared.publish(previous, ProtocolState::FreeForSend);
        *running = Some(self.spawn_worker(&handle));
        drop(running);

        info!(%previous, "protocol state machine reset");
        if let Some(listener) = self.shared.listener() {
            listener.on_free_for_send();
        }
        Ok(())
    }

    /// Stops the worker, waiting at most the configured join timeout
    pub async fn destroy(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        // closing the inbox ends the worker loop
        drop(running.events);
        let abort = running.task.abort_handle();
        if time::timeout(self.shared.config.join_timeout, running.task).await.is_err() {
            warn!("protocol state machine worker did not stop in time, aborting");
            abort.abort();
        }
        info!("protocol state machine destroyed");
    }
}

impl Drop for ProtocolStateMachine {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CorrelationId, DeviceRef, NodeAddress, RfMode, TransceiverSeries};
    use crate::protocol::message::{DeviceInterface, MethodCall};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::broadcast::error::TryRecvError;
    use tokio_test::{assert_err, assert_ok};

    #[derive(Default)]
    struct CountingListener {
        free: AtomicUsize,
        confirmation_timeouts: AtomicUsize,
        response_timeouts: AtomicUsize,
        errors: AtomicUsize,
    }

    impl StateMachineListener for CountingListener {
        fn on_free_for_send(&self) {
            self.free.fetch_add(1, Ordering::SeqCst);
        }
        fn on_confirmation_timeouted(&self) {
            self.confirmation_timeouts.fetch_add(1, Ordering::SeqCst);
        }
        fn on_response_timeouted(&self) {
            self.response_timeouts.fetch_add(1, Ordering::SeqCst);
        }
        fn on_error(&self, _error: &Error) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn request(id: u64, address: u16) -> Request {
        let device = DeviceRef::new(NetworkId::new("net"), NodeAddress(address));
        let call = MethodCall::new(DeviceInterface::Os, 0x00, vec![]).with_response_length(2);
        Request::unicast(CorrelationId(id), &device, call)
    }

    fn started() -> (ProtocolStateMachine, Arc<CountingListener>) {
        let machine = ProtocolStateMachine::new(ProtocolConfig::default());
        let listener = Arc::new(CountingListener::default());
        machine.register_listener(listener.clone());
        machine.start().unwrap();
        (machine, listener)
    }

    fn drain(rx: &mut broadcast::Receiver<StateTransition>) -> Vec<ProtocolState> {
        let mut states = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(transition) => states.push(transition.to),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        states
    }

    #[tokio::test(start_paused = true)]
    async fn test_unicast_flow() {
        let (machine, listener) = started();
        let mut transitions = machine.subscribe();

        assert_ok!(machine.new_request(&request(1, 3)).await);
        assert_eq!(machine.state(), ProtocolState::WaitingForConfirmation);
        assert!(!machine.is_free_for_send());

        assert_ok!(
            machine
                .confirmation_received(Instant::now(), Confirmation::new(1, 1, 6))
                .await
        );
        assert_eq!(machine.state(), ProtocolState::WaitingForResponse);

        time::sleep(Duration::from_millis(100)).await;
        assert_ok!(
            machine
                .response_received(Instant::now(), Response::new(vec![0x01, 0x02], Instant::now()))
                .await
        );
        assert_eq!(machine.state(), ProtocolState::WaitingAfterResponse);

        // (1+1) * 4 * 10 ms of response routing
        time::sleep(Duration::from_millis(81)).await;
        assert_eq!(machine.state(), ProtocolState::FreeForSend);
        assert_eq!(listener.free.load(Ordering::SeqCst), 1);

        assert_eq!(
            drain(&mut transitions),
            vec![
                ProtocolState::WaitingForConfirmation,
                ProtocolState::WaitingForResponse,
                ProtocolState::WaitingAfterResponse,
                ProtocolState::FreeForSend,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_coordinator_request_skips_confirmation() {
        let (machine, _listener) = started();

        assert_ok!(machine.new_request(&request(1, 0)).await);
        assert_eq!(machine.state(), ProtocolState::WaitingForResponse);

        assert_ok!(
            machine
                .response_received(Instant::now(), Response::new(vec![0x00], Instant::now()))
                .await
        );
        // no routing after a coordinator response
        tokio::task::yield_now().await;
        time::sleep(Duration::from_millis(1)).await;
        assert_eq!(machine.state(), ProtocolState::FreeForSend);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_waits_after_confirmation() {
        let (machine, _listener) = started();
        let call = MethodCall::new(DeviceInterface::LedR, 0x01, vec![]);
        let broadcast = Request::broadcast(CorrelationId(9), NetworkId::new("net"), call);

        assert_ok!(machine.new_request(&broadcast).await);
        assert_ok!(
            machine
                .confirmation_received(Instant::now(), Confirmation::new(3, 0, 5))
                .await
        );
        assert_eq!(machine.state(), ProtocolState::WaitingAfterConfirmation);

        time::sleep(Duration::from_millis(150)).await;
        assert_eq!(machine.state(), ProtocolState::WaitingAfterConfirmation);
        time::sleep(Duration::from_millis(60)).await;
        assert_eq!(machine.state(), ProtocolState::FreeForSend);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmation_timeout_is_monotonic() {
        let (machine, listener) = started();
        let mut transitions = machine.subscribe();

        let sent = Instant::now();
        assert_ok!(machine.new_request(&request(1, 5)).await);
        time::sleep(Duration::from_millis(2100)).await;

        let mut error_at = None;
        while let Ok(transition) = transitions.try_recv() {
            if transition.to == ProtocolState::WaitingForConfirmationError {
                error_at = Some(transition.at);
            }
        }
        let error_at = error_at.expect("confirmation error state");
        let waited = error_at.duration_since(sent);
        assert!(waited >= Duration::from_millis(2000));
        assert!(waited <= Duration::from_millis(2050));

        assert_eq!(machine.state(), ProtocolState::FreeForSend);
        assert_eq!(listener.confirmation_timeouts.load(Ordering::SeqCst), 1);
        assert_eq!(listener.free.load(Ordering::SeqCst), 1);

        // arrives after the window closed
        let late = machine
            .confirmation_received(Instant::now(), Confirmation::new(1, 1, 6))
            .await;
        assert!(matches!(late, Err(Error::StateTimeouted(TimeoutKind::Confirmation))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_timeout() {
        let (machine, listener) = started();

        let mut transitions = machine.subscribe();

        // coordinator requests wait the base time plus 100 ms
        let sent = Instant::now();
        assert_ok!(machine.new_request(&request(1, 0)).await);
        time::sleep(Duration::from_millis(99)).await;
        assert_eq!(machine.state(), ProtocolState::WaitingForResponse);
        assert_eq!(listener.response_timeouts.load(Ordering::SeqCst), 0);

        time::sleep(Duration::from_millis(2)).await;
        assert_eq!(machine.state(), ProtocolState::FreeForSend);
        assert_eq!(listener.response_timeouts.load(Ordering::SeqCst), 1);

        let mut error_at = None;
        while let Ok(transition) = transitions.try_recv() {
            if transition.to == ProtocolState::WaitingForResponseError {
                error_at = Some(transition.at);
            }
        }
        let waited = error_at.expect("response error state").duration_since(sent);
        assert!(waited >= Duration::from_millis(100));
        assert!(waited <= Duration::from_millis(101));

        let late = machine
            .response_received(Instant::now(), Response::new(vec![0x00], Instant::now()))
            .await;
        assert!(matches!(late, Err(Error::StateTimeouted(TimeoutKind::Response))));
    }

    /// Blocks the worker inside the first confirmation timeout callback
    #[derive(Default)]
    struct StallingListener {
        stalled: AtomicBool,
        internal_errors: AtomicUsize,
    }

    impl StateMachineListener for StallingListener {
        fn on_confirmation_timeouted(&self) {
            if !self.stalled.swap(true, Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(300));
            }
        }
        fn on_error(&self, error: &Error) {
            if matches!(error, Error::Internal(_)) {
                self.internal_errors.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stalled_worker_sets_sticky_error() {
        let machine = ProtocolStateMachine::new(ProtocolConfig {
            confirmation_timeout: Duration::from_millis(20),
            liveness_timeout: Duration::from_millis(50),
            ..ProtocolConfig::default()
        });
        let listener = Arc::new(StallingListener::default());
        machine.register_listener(listener.clone());
        machine.start().unwrap();

        assert_ok!(machine.new_request(&request(1, 3)).await);
        while !listener.stalled.load(Ordering::SeqCst) {
            time::sleep(Duration::from_millis(5)).await;
        }

        let started = Instant::now();
        let stuck = machine
            .confirmation_received(Instant::now(), Confirmation::new(1, 1, 6))
            .await;
        assert!(matches!(stuck, Err(Error::Internal(_))));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(machine.has_error());
        assert!(!machine.is_free_for_send());
        assert_eq!(listener.internal_errors.load(Ordering::SeqCst), 1);

        // sticky until reset
        let refused = machine.new_request(&request(2, 3)).await;
        assert!(matches!(refused, Err(Error::Internal(_))));
        assert!(!machine.is_free_for_send());
        assert_eq!(listener.internal_errors.load(Ordering::SeqCst), 1);

        // let the blocked callback return before the worker is replaced
        time::sleep(Duration::from_millis(400)).await;
        assert_ok!(machine.reset());
        assert!(!machine.has_error());
        assert!(machine.is_free_for_send());
        assert_ok!(machine.new_request(&request(3, 3)).await);
        machine.destroy().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_preconditions() {
        let (machine, _listener) = started();

        assert_err!(
            machine
                .confirmation_received(Instant::now(), Confirmation::new(0, 0, 4))
                .await
        );
        assert_ok!(machine.new_request(&request(1, 4)).await);

        let second = machine.new_request(&request(2, 4)).await;
        assert!(matches!(second, Err(Error::InvalidState(_))));
        assert_eq!(machine.state(), ProtocolState::WaitingForConfirmation);

        let early = machine
            .response_received(Instant::now(), Response::new(vec![], Instant::now()))
            .await;
        assert!(matches!(early, Err(Error::InvalidState(_))));
        assert!(!machine.has_error());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_flight_under_concurrency() {
        let (machine, _listener) = started();
        let machine = Arc::new(machine);
        let mut transitions = machine.subscribe();

        let mut handles = Vec::new();
        for id in 0..8 {
            let machine = machine.clone();
            handles.push(tokio::spawn(async move {
                machine.new_request(&request(id, 2)).await.is_ok()
            }));
        }

        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);

        let states = drain(&mut transitions);
        assert_eq!(states, vec![ProtocolState::WaitingForConfirmation]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_profile_sets_sticky_error() {
        let (machine, listener) = started();
        machine.configure(
            NetworkId::new("net"),
            NetworkProfile::new(TransceiverSeries::Tr52x, RfMode::Std),
        );

        assert_ok!(machine.new_request(&request(1, 7)).await);
        let result = machine
            .confirmation_received(Instant::now(), Confirmation::new(0, 0, 4))
            .await;
        assert!(matches!(result, Err(Error::Internal(_))));
        assert!(machine.has_error());
        assert!(!machine.is_free_for_send());
        assert_eq!(listener.errors.load(Ordering::SeqCst), 1);

        // every call fails until reset
        assert!(matches!(
            machine.new_request(&request(2, 7)).await,
            Err(Error::Internal(_))
        ));

        machine.configure(NetworkId::new("net"), NetworkProfile::default());
        assert_ok!(machine.reset());
        assert!(!machine.has_error());
        assert!(machine.is_free_for_send());
        assert_ok!(machine.new_request(&request(3, 7)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_is_idempotent() {
        let (machine, listener) = started();

        assert_ok!(machine.new_request(&request(1, 3)).await);
        assert_ok!(machine.reset());
        assert_eq!(machine.state(), ProtocolState::FreeForSend);
        assert_ok!(machine.reset());
        assert_eq!(machine.state(), ProtocolState::FreeForSend);
        assert!(!machine.has_error());
        assert_eq!(listener.free.load(Ordering::SeqCst), 2);

        // the old exchange is gone, its timeout never fires
        time::sleep(Duration::from_secs(3)).await;
        assert_eq!(listener.confirmation_timeouts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_not_started() {
        let machine = ProtocolStateMachine::new(ProtocolConfig::default());
        assert!(matches!(
            machine.new_request(&request(1, 1)).await,
            Err(Error::InvalidState(_))
        ));
        machine.destroy().await;
    }

    #[tokio::test]
    async fn test_destroy_stops_worker() {
        let (machine, _listener) = started();
        machine.destroy().await;
        assert!(matches!(
            machine.new_request(&request(1, 1)).await,
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_config_defaults() {
        let config = ProtocolConfig::default();
        assert_eq!(config.confirmation_timeout, Duration::from_millis(2000));
        assert_eq!(config.liveness_timeout, Duration::from_millis(1500));
        assert!(config.validate().is_ok());

        let json = serde_json::to_string(&config).unwrap();
        let parsed: ProtocolConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.join_timeout, config.join_timeout);
    }
}
