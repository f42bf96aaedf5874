//! Delivery boundary towards the local session manager.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::xml::Element;

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("No local recipient for '{0}'")]
    Unroutable(String),

    #[error("Delivery sink is closed")]
    Closed,
}

/// Receives stanzas that arrived over an established federation link, and
/// error replies for stanzas that could not be federated.
#[async_trait]
pub trait StanzaSink: Send + Sync {
    async fn deliver(&self, stanza: Element) -> Result<(), DeliveryError>;
}

/// Sink that forwards every stanza into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Element>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Element>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl StanzaSink for ChannelSink {
    async fn deliver(&self, stanza: Element) -> Result<(), DeliveryError> {
        self.tx.send(stanza).map_err(|_| DeliveryError::Closed)
    }
}
