use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::core::{Error, Result};
use crate::protocol::{AsyncMessage, Confirmation, Request, Response};

/// Raw message received by a transport, before correlation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportMessage {
    Confirmation(Confirmation),
    Response(Response),
    Async(AsyncMessage),
}

/// Byte-level link to the coordinator (serial, SPI, CDC...)
pub trait DpaTransport: Send + Sync {
    /// Registers where received messages go; replaces any previous sink
    fn register_sink(&self, sink: TransportSink);

    /// Writes one request to the link
    fn send<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<()>>;
}

/// Handle a transport uses to hand over received messages
#[derive(Debug, Clone)]
pub struct TransportSink {
    tx: mpsc::UnboundedSender<TransportMessage>,
}

impl TransportSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<TransportMessage>) -> Self {
        TransportSink { tx }
    }

    /// Delivers one received message
    pub fn deliver(&self, message: TransportMessage) -> Result<()> {
        self.tx.send(message).map_err(|_| Error::Shutdown)
    }
}
