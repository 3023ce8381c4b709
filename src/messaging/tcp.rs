//! TCP transport
//!
//! Every connection carries length-delimited frames (see [`super::codec`]).
//! Both sides open with a `Hello` frame naming themselves; only then is the
//! connection registered and reported as connected. Configured peers are
//! dialled in the background and re-dialled whenever their connection drops.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use super::codec::{decode_frame, encode_frame, WireFrame};
use super::message::Message;
use super::transport::{Transport, TransportError, TransportEvent, TransportEventSender};
use crate::cluster::NodeIdentity;

/// How long a peer has to send its `Hello` frame
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Outbound frames buffered per connection
const OUTBOUND_BUFFER: usize = 256;

struct Connection {
    generation: u64,
    identity: NodeIdentity,
    outbound: mpsc::Sender<Bytes>,
}

/// Transport over plain TCP connections
pub struct TcpTransport {
    identity: NodeIdentity,
    connections: DashMap<String, Connection>,
    events: TransportEventSender,
    next_generation: AtomicU64,
}

impl TcpTransport {
    /// Create a transport for the local node; nothing is bound yet
    pub fn new(identity: NodeIdentity, events: TransportEventSender) -> Arc<Self> {
        Arc::new(Self {
            identity,
            connections: DashMap::new(),
            events,
            next_generation: AtomicU64::new(0),
        })
    }

    /// Bind the listen address and accept peers in the background
    pub async fn listen(self: &Arc<Self>, address: &str) -> Result<JoinHandle<()>, TransportError> {
        let listener = TcpListener::bind(address).await?;
        info!("Node {} listening on {}", self.identity.id, listener.local_addr()?);

        let transport = self.clone();
        Ok(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        debug!("Accepted connection from {}", remote);
                        let transport = transport.clone();
                        tokio::spawn(async move {
                            if let Err(e) = transport.run_connection(stream).await {
                                warn!("Connection from {} failed: {}", remote, e);
                            }
                        });
                    }
                    Err(e) => warn!("Failed to accept connection: {}", e),
                }
            }
        }))
    }

    /// Keep a connection to `peer` open, re-dialling every `retry`
    pub fn connect_to(self: &Arc<Self>, peer: NodeIdentity, retry: Duration) -> JoinHandle<()> {
        let transport = self.clone();
        tokio::spawn(async move {
            loop {
                if !transport.connections.contains_key(&peer.id) {
                    match TcpStream::connect(&peer.address).await {
                        Ok(stream) => {
                            if let Err(e) = transport.clone().run_connection(stream).await {
                                debug!("Connection to {} ended: {}", peer.id, e);
                            }
                        }
                        Err(e) => debug!("Could not reach {} at {}: {}", peer.id, peer.address, e),
                    }
                }
                tokio::time::sleep(retry).await;
            }
        })
    }

    /// Handshake, then pump frames until the connection closes
    async fn run_connection(self: Arc<Self>, stream: TcpStream) -> Result<(), TransportError> {
        stream.set_nodelay(true)?;
        let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

        framed
            .send(encode_frame(&WireFrame::Hello(self.identity.clone()))?)
            .await?;

        let peer = match tokio::time::timeout(HANDSHAKE_TIMEOUT, framed.next()).await {
            Ok(Some(frame)) => match decode_frame(&frame?)? {
                WireFrame::Hello(peer) => peer,
                WireFrame::Message(_) => {
                    warn!("Peer sent a message before its hello, closing");
                    return Err(TransportError::Closed);
                }
            },
            Ok(None) | Err(_) => return Err(TransportError::Closed),
        };

        if peer.id == self.identity.id {
            debug!("Dropping connection to ourselves");
            return Ok(());
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let (outbound, mut outbound_rx) = mpsc::channel::<Bytes>(OUTBOUND_BUFFER);
        match self.connections.entry(peer.id.clone()) {
            Entry::Occupied(_) => {
                debug!("Dropping duplicate connection to {}", peer.id);
                return Ok(());
            }
            Entry::Vacant(slot) => {
                slot.insert(Connection {
                    generation,
                    identity: peer.clone(),
                    outbound,
                });
            }
        }
        info!("Connected to node {} ({})", peer.id, peer.address);
        let _ = self
            .events
            .send(TransportEvent::Connected(peer.clone()))
            .await;

        let (mut sink, mut frames) = framed.split();
        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
        });

        while let Some(frame) = frames.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Read error on connection to {}: {}", peer.id, e);
                    break;
                }
            };
            match decode_frame(&frame) {
                Ok(WireFrame::Message(message)) => {
                    if self.events.send(TransportEvent::Message(message)).await.is_err() {
                        break;
                    }
                }
                Ok(WireFrame::Hello(_)) => debug!("Ignoring repeated hello from {}", peer.id),
                Err(e) => warn!("Dropping undecodable frame from {}: {}", peer.id, e),
            }
        }

        writer.abort();
        let removed = self
            .connections
            .remove_if(&peer.id, |_, c| c.generation == generation)
            .is_some();
        if removed {
            info!("Disconnected from node {}", peer.id);
            let _ = self
                .events
                .send(TransportEvent::Disconnected(peer.id.clone()))
                .await;
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn local_identity(&self) -> &NodeIdentity {
        &self.identity
    }

    fn connections(&self) -> Vec<NodeIdentity> {
        self.connections
            .iter()
            .map(|c| c.identity.clone())
            .collect()
    }

    async fn send_to(&self, node_id: &str, message: &Message) -> Result<(), TransportError> {
        let outbound = self
            .connections
            .get(node_id)
            .map(|c| c.outbound.clone())
            .ok_or_else(|| TransportError::NotConnected(node_id.to_string()))?;

        let frame = encode_frame(&WireFrame::Message(message.clone()))?;
        outbound.send(frame).await.map_err(|_| TransportError::Closed)
    }
}
