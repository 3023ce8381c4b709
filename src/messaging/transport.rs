//! Transport seam beneath the messenger
//!
//! A transport owns the physical connections to peers. It delivers outgoing
//! messages to a single connected node and reports everything that happens on
//! its connections as [`TransportEvent`]s.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use super::codec::CodecError;
use super::message::Message;
use crate::cluster::NodeIdentity;

/// Capacity of the transport event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Errors raised by a transport
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Node '{0}' is not connected")]
    NotConnected(String),

    #[error("Connection closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Something that happened on a transport connection
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A peer finished its handshake
    Connected(NodeIdentity),
    /// The connection to a peer was lost
    Disconnected(String),
    /// A message arrived from a peer
    Message(Message),
}

pub type TransportEventSender = mpsc::Sender<TransportEvent>;
pub type TransportEventReceiver = mpsc::Receiver<TransportEvent>;

/// Create the channel a transport reports its events on
pub fn event_channel() -> (TransportEventSender, TransportEventReceiver) {
    mpsc::channel(EVENT_CHANNEL_CAPACITY)
}

/// Node-to-node connections
#[async_trait]
pub trait Transport: Send + Sync {
    /// Identity of the local node
    fn local_identity(&self) -> &NodeIdentity;

    /// Peers with a live connection; never includes the local node
    fn connections(&self) -> Vec<NodeIdentity>;

    /// Write a message to the connection of one peer
    async fn send_to(&self, node_id: &str, message: &Message) -> Result<(), TransportError>;
}
