//! Network boundary
//!
//! Traits and handles connecting the connector to whatever moves requests to
//! the mesh, and the raw transport below the protocol layer.

mod transport;

pub use self::transport::{DpaTransport, TransportMessage, TransportSink};

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::core::{CorrelationId, Error, ProcessingTime, Result};
use crate::protocol::{AsyncMessage, CallResponse, Confirmation, Request};

/// Message delivered from the wire layer to the connector
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// Correlated response, or a failure of the request
    Response(CallResponse),
    /// Routing confirmation of a request
    Confirmation {
        request_id: CorrelationId,
        confirmation: Confirmation,
    },
    /// Unsolicited message from a node
    Async(AsyncMessage),
}

/// Inbound message the dispatcher correlates with a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Correlated {
    Response(CallResponse),
    Confirmation {
        request_id: CorrelationId,
        confirmation: Confirmation,
    },
}

/// Layer the connector dispatches requests to
pub trait WireLayer: Send + Sync {
    /// Registers where inbound messages go; replaces any previous handle
    fn register_listener(&self, inbound: InboundHandle);

    /// Sends one request. Resolves once the request is handed to the wire.
    fn send_request<'a>(
        &'a self,
        request: &'a Request,
        max_processing_time: ProcessingTime,
    ) -> BoxFuture<'a, Result<()>>;
}

/// Handle for delivering inbound messages to a connector
#[derive(Debug, Clone)]
pub struct InboundHandle {
    responses: mpsc::UnboundedSender<Correlated>,
    async_messages: mpsc::UnboundedSender<AsyncMessage>,
}

impl InboundHandle {
    pub(crate) fn new(
        responses: mpsc::UnboundedSender<Correlated>,
        async_messages: mpsc::UnboundedSender<AsyncMessage>,
    ) -> Self {
        InboundHandle {
            responses,
            async_messages,
        }
    }

    /// Delivers one message; unsolicited messages take a separate queue
    pub fn deliver(&self, message: WireMessage) -> Result<()> {
        let sent = match message {
            WireMessage::Async(message) => self.async_messages.send(message).is_ok(),
            WireMessage::Response(response) => {
                self.responses.send(Correlated::Response(response)).is_ok()
            }
            WireMessage::Confirmation {
                request_id,
                confirmation,
            } => self
                .responses
                .send(Correlated::Confirmation {
                    request_id,
                    confirmation,
                })
                .is_ok(),
        };
        if sent {
            Ok(())
        } else {
            Err(Error::Shutdown)
        }
    }
}
