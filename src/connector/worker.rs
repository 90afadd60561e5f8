//! Dispatcher task of the connector

use std::sync::Arc;

use futures::future;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::{Error, ProcessingError, ProcessingTime};
use crate::network::{Correlated, WireLayer};
use crate::protocol::Request;
use crate::util::saturating_deadline;
use super::registry::Matched;
use super::{ConnectorConfig, Shared};

/// Sends queued requests one at a time and correlates what comes back
pub(crate) struct Dispatcher {
    pub(crate) config: ConnectorConfig,
    pub(crate) shared: Arc<Shared>,
    pub(crate) wire: Arc<dyn WireLayer>,
    pub(crate) responses: mpsc::UnboundedReceiver<Correlated>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) last_send: Option<Instant>,
}

impl Dispatcher {
    pub(crate) async fn run(mut self) {
        info!("connector dispatcher started");
        let mut gc = time::interval(self.config.gc_interval);
        gc.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if let Some((request, max_processing_time)) = self.shared.registry.start_next() {
                if !self.dispatch(request, max_processing_time).await {
                    break;
                }
                continue;
            }

            let deadline = self.shared.registry.in_flight_deadline();
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                message = self.responses.recv() => match message {
                    Some(message) => self.on_wire_message(message),
                    None => {
                        warn!("wire layer closed, dispatcher stopping");
                        break;
                    }
                },
                _ = self.shared.wake.notified() => {}
                _ = wait_until(deadline) => self.on_deadline(),
                _ = gc.tick() => self.collect_garbage(),
            }
        }
        info!("connector dispatcher stopped");
    }

    /// Hands one request to the wire layer. Returns false on shutdown.
    async fn dispatch(&mut self, request: Request, max_processing_time: ProcessingTime) -> bool {
        let id = request.id;
        let attempts = self.config.max_send_attempts;
        let mut last_error: Option<Error> = None;

        for attempt in 1..=attempts {
            if let Some(last_send) = self.last_send {
                let earliest = saturating_deadline(last_send, self.config.between_send_pause);
                if earliest > Instant::now() && !self.sleep_until(earliest).await {
                    return false;
                }
            }
            if !self.shared.registry.is_in_flight(id) {
                debug!(request = %id, "request cancelled before sending");
                return true;
            }

            let sent = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return false,
                sent = self.wire.send_request(&request, max_processing_time) => sent,
            };
            self.last_send = Some(Instant::now());

            match sent {
                Ok(()) => {
                    if self.shared.registry.mark_sent(id, Instant::now()) {
                        debug!(request = %id, attempt, "request dispatched");
                    } else {
                        debug!(request = %id, "request cancelled while sending");
                    }
                    return true;
                }
                Err(e) => {
                    warn!(request = %id, attempt, attempts, error = %e, "sending request failed");
                    last_error = Some(e);
                    let resume_at = saturating_deadline(Instant::now(), self.config.attempt_pause);
                    if attempt < attempts
                        && !self.config.attempt_pause.is_zero()
                        && !self.sleep_until(resume_at).await
                    {
                        return false;
                    }
                }
            }
        }

        let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
        warn!(request = %id, attempts, %reason, "giving up on request");
        let notification = self.shared.registry.resolve_in_flight(
            id,
            Err(ProcessingError::Dispatch { attempts, reason }),
            Instant::now(),
        );
        self.shared.finish(notification);
        true
    }

    /// Sleeps unless shut down first; returns false on shutdown
    async fn sleep_until(&self, deadline: Instant) -> bool {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => false,
            _ = time::sleep_until(deadline) => true,
        }
    }

    fn on_wire_message(&self, message: Correlated) {
        let now = Instant::now();
        match message {
            Correlated::Response(response) => {
                let id = response.request_id;
                match self.shared.registry.on_response(response, now) {
                    Matched::Current(notification) => {
                        debug!(request = %id, "result arrived");
                        self.shared.finish(notification);
                    }
                    Matched::Late(notification) => {
                        info!(request = %id, "late result matched an idle request");
                        self.shared.finish(notification);
                    }
                    Matched::Unmatched => {
                        warn!(
                            request = %id,
                            "response does not match any outstanding request, discarded"
                        )
                    }
                }
            }
            Correlated::Confirmation {
                request_id,
                confirmation,
            } => match self.shared.registry.on_confirmation(request_id, confirmation, now) {
                Matched::Current(notification) | Matched::Late(notification) => {
                    debug!(request = %request_id, ?confirmation, "confirmation arrived");
                    self.shared.finish(notification);
                }
                Matched::Unmatched => {
                    warn!(
                        request = %request_id,
                        "confirmation does not match any outstanding request, discarded"
                    )
                }
            },
        }
    }

    fn on_deadline(&self) {
        if let Some(id) = self
            .shared
            .registry
            .expire_in_flight(Instant::now(), self.config.idle_request_expiry)
        {
            warn!(request = %id, "no result within maximal processing time, request moved to idle");
        }
    }

    fn collect_garbage(&self) {
        for notification in self.shared.registry.collect_garbage(Instant::now()) {
            notification.deliver();
        }
        // expired idle requests became results
        self.shared.resolved.notify_waiters();
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}
