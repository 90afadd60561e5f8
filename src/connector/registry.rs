//! Bookkeeping of call requests
//!
//! A request lives in exactly one of four places: the pending queue, the
//! in-flight slot, the idle set or the resolved set. Locks are always taken
//! in that order, so a request moving between two places is never seen in
//! neither or both.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::core::{CorrelationId, Error, ProcessingError, ProcessingTime, Result};
use crate::protocol::{CallResponse, Confirmation, Request};
use crate::util::{checked_deadline, saturating_deadline};
use super::async_msg::isolate;
use super::BroadcastListener;

/// Processing state of a call request, as seen by pollers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallRequestProcessingState {
    /// Queued, not dispatched yet
    WaitingForProcessing,
    /// Dispatched, result not known yet
    WaitingForResult,
    /// Result available
    ResultArrived,
    /// Request failed
    Error,
}

/// Result of a successfully processed call request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallResult {
    pub main_data: Bytes,
    pub additional_data: Bytes,
    /// Routing confirmation, when the request was confirmed
    pub confirmation: Option<Confirmation>,
}

/// Snapshot of a call request returned to pollers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequestProcessingInfo {
    pub state: CallRequestProcessingState,
    pub result: Option<CallResult>,
    pub error: Option<ProcessingError>,
}

impl CallRequestProcessingInfo {
    fn waiting(state: CallRequestProcessingState) -> Self {
        CallRequestProcessingInfo {
            state,
            result: None,
            error: None,
        }
    }

    fn resolved(outcome: &CallOutcome) -> Self {
        match outcome {
            Ok(result) => CallRequestProcessingInfo {
                state: CallRequestProcessingState::ResultArrived,
                result: Some(result.clone()),
                error: None,
            },
            Err(error) => CallRequestProcessingInfo {
                state: CallRequestProcessingState::Error,
                result: None,
                error: Some(error.clone()),
            },
        }
    }

    /// Returns whether the request reached a final state
    pub fn is_final(&self) -> bool {
        matches!(
            self.state,
            CallRequestProcessingState::ResultArrived | CallRequestProcessingState::Error
        )
    }
}

pub(crate) type CallOutcome = std::result::Result<CallResult, ProcessingError>;

/// Request submitted by a caller
pub(crate) struct PendingRequest {
    pub request: Request,
    pub max_processing_time: ProcessingTime,
    pub listener: Option<Arc<dyn BroadcastListener>>,
}

struct InFlight {
    pending: PendingRequest,
    sent_at: Option<Instant>,
    /// `None` while unsent, unlimited, or beyond any representable instant
    deadline: Option<Instant>,
    confirmation: Option<Confirmation>,
}

impl InFlight {
    fn id(&self) -> CorrelationId {
        self.pending.request.id
    }
}

/// Request whose processing time ran out, kept to catch a late reply
struct IdleRecord {
    broadcast: bool,
    listener: Option<Arc<dyn BroadcastListener>>,
    confirmation: Option<Confirmation>,
    expires_at: Instant,
}

struct Resolved {
    outcome: CallOutcome,
    expires_at: Instant,
}

/// Outcome waiting to be handed to a broadcast listener
pub(crate) struct Notification {
    listener: Arc<dyn BroadcastListener>,
    request_id: CorrelationId,
    outcome: CallOutcome,
}

impl Notification {
    /// Calls the listener; must be called without registry locks held
    pub(crate) fn deliver(self) {
        let Notification {
            listener,
            request_id,
            outcome,
        } = self;
        isolate("broadcast listener", || match &outcome {
            Ok(result) => listener.on_completed(request_id, result),
            Err(error) => listener.on_error(request_id, error),
        });
    }
}

/// How an inbound message matched the registry
pub(crate) enum Matched {
    /// Belongs to the in-flight request
    Current(Option<Notification>),
    /// Late reply to an idle request
    Late(Option<Notification>),
    /// Matches nothing outstanding
    Unmatched,
}

pub(crate) struct Registry {
    result_lifetime: Duration,
    pending: Mutex<VecDeque<PendingRequest>>,
    in_flight: Mutex<Option<InFlight>>,
    idle: Mutex<HashMap<CorrelationId, IdleRecord>>,
    resolved: Mutex<HashMap<CorrelationId, Resolved>>,
}

impl Registry {
    pub(crate) fn new(result_lifetime: Duration) -> Self {
        Registry {
            result_lifetime,
            pending: Mutex::new(VecDeque::new()),
            in_flight: Mutex::new(None),
            idle: Mutex::new(HashMap::new()),
            resolved: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn enqueue(&self, request: PendingRequest) {
        self.pending.lock().push_back(request);
    }

    /// Moves the next pending request into the in-flight slot
    pub(crate) fn start_next(&self) -> Option<(Request, ProcessingTime)> {
        let mut pending = self.pending.lock();
        let mut in_flight = self.in_flight.lock();
        if in_flight.is_some() {
            return None;
        }
        let next = pending.pop_front()?;
        let started = (next.request.clone(), next.max_processing_time);
        *in_flight = Some(InFlight {
            pending: next,
            sent_at: None,
            deadline: None,
            confirmation: None,
        });
        Some(started)
    }

    pub(crate) fn has_in_flight(&self) -> bool {
        self.in_flight.lock().is_some()
    }

    pub(crate) fn is_in_flight(&self, id: CorrelationId) -> bool {
        self.in_flight
            .lock()
            .as_ref()
            .map_or(false, |current| current.id() == id)
    }

    /// Starts the processing time of a dispatched request.
    /// Returns false when the request is no longer in flight.
    pub(crate) fn mark_sent(&self, id: CorrelationId, now: Instant) -> bool {
        let mut in_flight = self.in_flight.lock();
        match in_flight.as_mut() {
            Some(current) if current.id() == id => {
                current.sent_at = Some(now);
                current.deadline = current
                    .pending
                    .max_processing_time
                    .limit()
                    .and_then(|limit| checked_deadline(now, limit));
                true
            }
            _ => false,
        }
    }

    /// Deadline of the dispatched in-flight request
    pub(crate) fn in_flight_deadline(&self) -> Option<Instant> {
        self.in_flight.lock().as_ref().and_then(|current| current.deadline)
    }

    /// Resolves the in-flight request if it is still `id`
    pub(crate) fn resolve_in_flight(
        &self,
        id: CorrelationId,
        outcome: CallOutcome,
        now: Instant,
    ) -> Option<Notification> {
        let mut in_flight = self.in_flight.lock();
        if !in_flight.as_ref().map_or(false, |current| current.id() == id) {
            return None;
        }
        let current = in_flight.take()?;
        self.store_resolved(id, outcome, current.pending.listener, now)
    }

    /// Moves the in-flight request to the idle set once its deadline passed.
    /// Returns the moved request.
    pub(crate) fn expire_in_flight(
        &self,
        now: Instant,
        idle_expiry: Duration,
    ) -> Option<CorrelationId> {
        let mut in_flight = self.in_flight.lock();
        let expired = in_flight
            .as_ref()
            .and_then(|current| current.deadline)
            .map_or(false, |deadline| deadline <= now);
        if !expired {
            return None;
        }
        let current = in_flight.take()?;
        let id = current.id();
        self.idle.lock().insert(
            id,
            IdleRecord {
                broadcast: current.pending.request.is_broadcast(),
                listener: current.pending.listener,
                confirmation: current.confirmation,
                expires_at: saturating_deadline(now, idle_expiry),
            },
        );
        Some(id)
    }

    pub(crate) fn on_response(&self, response: CallResponse, now: Instant) -> Matched {
        let id = response.request_id;
        let mut in_flight = self.in_flight.lock();
        if let Some(current) = in_flight.as_ref().filter(|current| current.id() == id) {
            let outcome = outcome_of(response, current.confirmation);
            let current = in_flight.take();
            let listener = current.and_then(|current| current.pending.listener);
            return Matched::Current(self.store_resolved(id, outcome, listener, now));
        }

        let mut idle = self.idle.lock();
        match idle.remove(&id) {
            Some(record) => {
                let outcome = outcome_of(response, record.confirmation);
                Matched::Late(self.store_resolved(id, outcome, record.listener, now))
            }
            None => Matched::Unmatched,
        }
    }

    /// Records a confirmation; a broadcast is resolved by it
    pub(crate) fn on_confirmation(
        &self,
        id: CorrelationId,
        confirmation: Confirmation,
        now: Instant,
    ) -> Matched {
        let mut in_flight = self.in_flight.lock();
        if let Some(current) = in_flight.as_mut().filter(|current| current.id() == id) {
            current.confirmation = Some(confirmation);
            if !current.pending.request.is_broadcast() {
                return Matched::Current(None);
            }
            let listener = in_flight.take().and_then(|current| current.pending.listener);
            let outcome = Ok(confirmed(confirmation));
            return Matched::Current(self.store_resolved(id, outcome, listener, now));
        }

        let mut idle = self.idle.lock();
        let Some(record) = idle.get_mut(&id) else {
            return Matched::Unmatched;
        };
        if !record.broadcast {
            record.confirmation = Some(confirmation);
            return Matched::Late(None);
        }
        let listener = idle.remove(&id).and_then(|record| record.listener);
        let outcome = Ok(confirmed(confirmation));
        Matched::Late(self.store_resolved(id, outcome, listener, now))
    }

    /// Forgets a request that has not been resolved yet
    pub(crate) fn cancel(&self, id: CorrelationId) -> bool {
        let mut pending = self.pending.lock();
        if let Some(index) = pending.iter().position(|p| p.request.id == id) {
            pending.remove(index);
            return true;
        }

        let mut in_flight = self.in_flight.lock();
        if in_flight.as_ref().map_or(false, |current| current.id() == id) {
            *in_flight = None;
            return true;
        }

        self.idle.lock().remove(&id).is_some()
    }

    pub(crate) fn set_max_processing_time(
        &self,
        id: CorrelationId,
        time: ProcessingTime,
    ) -> Result<()> {
        let mut pending = self.pending.lock();
        if let Some(request) = pending.iter_mut().find(|p| p.request.id == id) {
            request.max_processing_time = time;
            return Ok(());
        }

        let mut in_flight = self.in_flight.lock();
        if let Some(current) = in_flight.as_mut().filter(|current| current.id() == id) {
            current.pending.max_processing_time = time;
            if let Some(sent_at) = current.sent_at {
                current.deadline = time.limit().and_then(|limit| checked_deadline(sent_at, limit));
            }
            return Ok(());
        }

        if self.idle.lock().contains_key(&id) {
            return Err(Error::invalid_state(format!(
                "request {} already ran out of processing time",
                id
            )));
        }
        if self.resolved.lock().contains_key(&id) {
            return Err(Error::invalid_state(format!("request {} is already resolved", id)));
        }
        Err(Error::invalid_argument(format!("unknown request {}", id)))
    }

    pub(crate) fn info(&self, id: CorrelationId) -> Option<CallRequestProcessingInfo> {
        let pending = self.pending.lock();
        if pending.iter().any(|p| p.request.id == id) {
            return Some(CallRequestProcessingInfo::waiting(
                CallRequestProcessingState::WaitingForProcessing,
            ));
        }

        let in_flight = self.in_flight.lock();
        if in_flight.as_ref().map_or(false, |current| current.id() == id) {
            return Some(CallRequestProcessingInfo::waiting(
                CallRequestProcessingState::WaitingForResult,
            ));
        }

        if self.idle.lock().contains_key(&id) {
            return Some(CallRequestProcessingInfo::waiting(
                CallRequestProcessingState::WaitingForResult,
            ));
        }

        self.resolved
            .lock()
            .get(&id)
            .map(|resolved| CallRequestProcessingInfo::resolved(&resolved.outcome))
    }

    /// Turns expired idle requests into errors and drops expired results
    pub(crate) fn collect_garbage(&self, now: Instant) -> Vec<Notification> {
        let mut idle = self.idle.lock();
        let expired: Vec<CorrelationId> = idle
            .iter()
            .filter(|(_, record)| record.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();

        let mut notifications = Vec::new();
        for id in expired {
            if let Some(record) = idle.remove(&id) {
                let notification =
                    self.store_resolved(id, Err(ProcessingError::NoResponse), record.listener, now);
                notifications.extend(notification);
            }
        }
        drop(idle);

        self.resolved
            .lock()
            .retain(|_, resolved| resolved.expires_at > now);
        notifications
    }

    fn store_resolved(
        &self,
        id: CorrelationId,
        outcome: CallOutcome,
        listener: Option<Arc<dyn BroadcastListener>>,
        now: Instant,
    ) -> Option<Notification> {
        let notification = listener.map(|listener| Notification {
            listener,
            request_id: id,
            outcome: outcome.clone(),
        });
        self.resolved.lock().insert(
            id,
            Resolved {
                outcome,
                expires_at: saturating_deadline(now, self.result_lifetime),
            },
        );
        notification
    }
}

fn outcome_of(response: CallResponse, confirmation: Option<Confirmation>) -> CallOutcome {
    match response.processing_error {
        Some(error) => Err(error),
        None => Ok(CallResult {
            main_data: response.main_data,
            additional_data: response.additional_data,
            confirmation,
        }),
    }
}

fn confirmed(confirmation: Confirmation) -> CallResult {
    CallResult {
        main_data: Bytes::new(),
        additional_data: Bytes::new(),
        confirmation: Some(confirmation),
    }
}
