//! In-process transport
//!
//! [`LocalNetwork`] connects any number of nodes living in the same process.
//! Every joined node is linked to every other one until a link is cut with
//! [`LocalNetwork::disconnect`]. Used to run whole clusters inside tests.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tracing::debug;

use super::message::Message;
use super::transport::{
    event_channel, Transport, TransportError, TransportEvent, TransportEventReceiver,
    TransportEventSender,
};
use crate::cluster::NodeIdentity;

struct Endpoint {
    identity: NodeIdentity,
    events: TransportEventSender,
}

/// Hub linking in-process nodes
#[derive(Default)]
pub struct LocalNetwork {
    endpoints: DashMap<String, Endpoint>,
    severed: DashSet<(String, String)>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a node to the network
    ///
    /// Existing members are told about the newcomer and the newcomer is told
    /// about every existing member.
    pub async fn join(
        self: &Arc<Self>,
        identity: NodeIdentity,
    ) -> (LocalTransport, TransportEventReceiver) {
        let (events, receiver) = event_channel();

        let peers: Vec<(NodeIdentity, TransportEventSender)> = self
            .endpoints
            .iter()
            .map(|e| (e.identity.clone(), e.events.clone()))
            .collect();

        self.endpoints.insert(
            identity.id.clone(),
            Endpoint {
                identity: identity.clone(),
                events: events.clone(),
            },
        );

        for (peer, peer_events) in peers {
            let _ = peer_events
                .send(TransportEvent::Connected(identity.clone()))
                .await;
            let _ = events.send(TransportEvent::Connected(peer)).await;
        }

        let transport = LocalTransport {
            identity,
            network: self.clone(),
        };
        (transport, receiver)
    }

    /// Remove a node; every remaining member sees it disconnect
    pub async fn leave(&self, id: &str) {
        if self.endpoints.remove(id).is_none() {
            return;
        }
        for sender in self.senders() {
            let _ = sender.send(TransportEvent::Disconnected(id.to_string())).await;
        }
    }

    /// Cut the link between two nodes
    pub async fn disconnect(&self, a: &str, b: &str) {
        if self.severed.insert(link_key(a, b)) {
            self.notify(a, TransportEvent::Disconnected(b.to_string())).await;
            self.notify(b, TransportEvent::Disconnected(a.to_string())).await;
        }
    }

    /// Restore a link cut by [`LocalNetwork::disconnect`]
    pub async fn reconnect(&self, a: &str, b: &str) {
        if self.severed.remove(&link_key(a, b)).is_none() {
            return;
        }
        if let Some(identity) = self.identity(b) {
            self.notify(a, TransportEvent::Connected(identity)).await;
        }
        if let Some(identity) = self.identity(a) {
            self.notify(b, TransportEvent::Connected(identity)).await;
        }
    }

    fn linked(&self, a: &str, b: &str) -> bool {
        a != b
            && self.endpoints.contains_key(a)
            && self.endpoints.contains_key(b)
            && !self.severed.contains(&link_key(a, b))
    }

    fn identity(&self, id: &str) -> Option<NodeIdentity> {
        self.endpoints.get(id).map(|e| e.identity.clone())
    }

    fn sender(&self, id: &str) -> Option<TransportEventSender> {
        self.endpoints.get(id).map(|e| e.events.clone())
    }

    fn senders(&self) -> Vec<TransportEventSender> {
        self.endpoints.iter().map(|e| e.events.clone()).collect()
    }

    async fn notify(&self, id: &str, event: TransportEvent) {
        if let Some(sender) = self.sender(id) {
            let _ = sender.send(event).await;
        }
    }
}

fn link_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// One node's handle on a [`LocalNetwork`]
pub struct LocalTransport {
    identity: NodeIdentity,
    network: Arc<LocalNetwork>,
}

#[async_trait]
impl Transport for LocalTransport {
    fn local_identity(&self) -> &NodeIdentity {
        &self.identity
    }

    fn connections(&self) -> Vec<NodeIdentity> {
        let members: Vec<NodeIdentity> = self
            .network
            .endpoints
            .iter()
            .map(|e| e.identity.clone())
            .collect();

        members
            .into_iter()
            .filter(|peer| self.network.linked(&self.identity.id, &peer.id))
            .collect()
    }

    async fn send_to(&self, node_id: &str, message: &Message) -> Result<(), TransportError> {
        if !self.network.linked(&self.identity.id, node_id) {
            return Err(TransportError::NotConnected(node_id.to_string()));
        }
        let sender = self
            .network
            .sender(node_id)
            .ok_or_else(|| TransportError::NotConnected(node_id.to_string()))?;

        debug!(
            "{} -> {} on channel {}",
            self.identity.id,
            node_id,
            message.channel()
        );
        sender
            .send(TransportEvent::Message(message.clone()))
            .await
            .map_err(|_| TransportError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::message::ChannelTarget;

    fn identity(id: &str) -> NodeIdentity {
        NodeIdentity::new(id, format!("local://{}", id))
    }

    #[tokio::test]
    async fn test_join_announces_peers() {
        let network = LocalNetwork::new();
        let (a, mut a_events) = network.join(identity("a")).await;
        let (_b, mut b_events) = network.join(identity("b")).await;

        assert!(matches!(
            a_events.recv().await,
            Some(TransportEvent::Connected(node)) if node.id == "b"
        ));
        assert!(matches!(
            b_events.recv().await,
            Some(TransportEvent::Connected(node)) if node.id == "a"
        ));
        assert_eq!(a.connections(), vec![identity("b")]);
    }

    #[tokio::test]
    async fn test_send_delivers_message() {
        let network = LocalNetwork::new();
        let (a, _a_events) = network.join(identity("a")).await;
        let (_b, mut b_events) = network.join(identity("b")).await;
        // Skip the connection notice
        b_events.recv().await;

        let message =
            Message::new("ping", "a", vec![ChannelTarget::node("b")], b"hi".to_vec()).unwrap();
        a.send_to("b", &message).await.unwrap();

        match b_events.recv().await {
            Some(TransportEvent::Message(received)) => assert_eq!(received.content(), b"hi"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_disconnect_and_reconnect() {
        let network = LocalNetwork::new();
        let (a, mut a_events) = network.join(identity("a")).await;
        let (_b, _b_events) = network.join(identity("b")).await;
        a_events.recv().await;

        network.disconnect("a", "b").await;
        assert!(matches!(
            a_events.recv().await,
            Some(TransportEvent::Disconnected(id)) if id == "b"
        ));
        assert!(a.connections().is_empty());

        let message = Message::new("ping", "a", vec![ChannelTarget::node("b")], vec![]).unwrap();
        assert!(matches!(
            a.send_to("b", &message).await,
            Err(TransportError::NotConnected(_))
        ));

        network.reconnect("a", "b").await;
        assert!(matches!(
            a_events.recv().await,
            Some(TransportEvent::Connected(node)) if node.id == "b"
        ));
        assert!(a.send_to("b", &message).await.is_ok());
    }

    #[tokio::test]
    async fn test_cannot_send_to_self() {
        let network = LocalNetwork::new();
        let (a, _events) = network.join(identity("a")).await;

        let message = Message::new("ping", "a", vec![ChannelTarget::node("a")], vec![]).unwrap();
        assert!(a.send_to("a", &message).await.is_err());
        assert!(a.connections().is_empty());
    }
}
