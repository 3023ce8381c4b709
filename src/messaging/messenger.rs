//! Messenger - addressed messaging and queries between nodes
//!
//! Plain messages are written to every connection their targets resolve to.
//! Queries must resolve to exactly one connection; the caller suspends until a
//! response with the same correlation id arrives or the timeout expires. The
//! pending-query table is the only synchronisation point between the two:
//! whoever removes the entry first (response, timeout or disconnect) decides
//! the outcome, so every query completes exactly once.
//!
//! Inbound messages other than responses are handed to listeners in the order
//! their sender wrote them: each sender gets one queue drained by one task.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use super::listeners::{ChannelListener, ChannelListeners, ChannelMessageEvent};
use super::message::{ChannelTarget, Message, MessageError, TargetType};
use super::transport::{Transport, TransportError};

/// Timeout applied to cross-node queries unless configured otherwise
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Misuse of the query/response protocol
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Message on channel '{0}' is not a query")]
    NotAQuery(String),

    #[error("Query on channel '{0}' was already answered")]
    AlreadyResponded(String),

    #[error("Query on channel '{0}' carries no correlation id")]
    MissingCorrelation(String),

    #[error("No pending query with correlation id {0}")]
    UnknownCorrelation(Uuid),
}

/// Errors returned by the messenger
#[derive(Error, Debug)]
pub enum MessengerError {
    #[error("Query on channel '{channel}' resolved to {resolved} connections, expected exactly one")]
    InvalidTarget { channel: String, resolved: usize },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Invalid message: {0}")]
    Message(#[from] MessageError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

struct PendingQuery {
    target: String,
    reply: oneshot::Sender<Message>,
}

/// Sends messages and queries over a [`Transport`]
pub struct Messenger {
    transport: Arc<dyn Transport>,
    pending: DashMap<Uuid, PendingQuery>,
    inbound: DashMap<String, mpsc::UnboundedSender<Message>>,
    listeners: ChannelListeners,
    query_timeout: Duration,
}

impl Messenger {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            pending: DashMap::new(),
            inbound: DashMap::new(),
            listeners: ChannelListeners::new(),
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    /// Set the timeout used by [`Messenger::query`]
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Id of the local node
    pub fn local_id(&self) -> &str {
        &self.transport.local_identity().id
    }

    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    pub fn listeners(&self) -> &ChannelListeners {
        &self.listeners
    }

    /// Register a listener for a channel
    pub fn register_listener(
        &self,
        channel: impl Into<String>,
        priority: i32,
        listener: Arc<dyn ChannelListener>,
    ) {
        self.listeners.register(channel, priority, listener);
    }

    /// Number of queries waiting for a response
    pub fn pending_queries(&self) -> usize {
        self.pending.len()
    }

    /// Build a message sent by the local node
    pub fn message(
        &self,
        channel: impl Into<String>,
        targets: Vec<ChannelTarget>,
        content: Vec<u8>,
    ) -> Result<Message, MessageError> {
        Message::new(channel, self.local_id(), targets, content)
    }

    /// Node ids the targets of a message resolve to, without duplicates
    ///
    /// NODE targets resolve to that node's connection if one exists; SERVICE,
    /// GROUP and ALL targets fan out to every connection.
    pub fn resolve(&self, targets: &[ChannelTarget]) -> Vec<String> {
        let connections: Vec<String> = self
            .transport
            .connections()
            .into_iter()
            .map(|identity| identity.id)
            .collect();

        let mut resolved: Vec<String> = Vec::new();
        for target in targets {
            let matches: Vec<&String> = match (target.target_type, &target.value) {
                (TargetType::Node, Some(id)) => connections.iter().filter(|c| *c == id).collect(),
                (TargetType::Node, None) => vec![],
                (TargetType::Service | TargetType::Group | TargetType::All, _) => {
                    connections.iter().collect()
                }
            };
            for id in matches {
                if !resolved.contains(id) {
                    resolved.push(id.clone());
                }
            }
        }
        resolved
    }

    /// Fire-and-forget delivery to every resolved connection
    ///
    /// Write failures are logged. Returns the number of connections written to.
    pub async fn send(&self, message: Message) -> usize {
        let mut delivered = 0;
        for node_id in self.resolve(message.targets()) {
            match self.transport.send_to(&node_id, &message).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(
                    "Failed to send message on channel {} to {}: {}",
                    message.channel(),
                    node_id,
                    e
                ),
            }
        }
        delivered
    }

    /// Send a query using the configured timeout
    pub async fn query(&self, message: Message) -> Result<Option<Message>, MessengerError> {
        self.send_query(message, self.query_timeout).await
    }

    /// Send a query and wait for its response
    ///
    /// `Ok(None)` means no response: the timeout expired, the peer dropped
    /// off mid-flight, or the write to it failed.
    pub async fn send_query(
        &self,
        message: Message,
        timeout: Duration,
    ) -> Result<Option<Message>, MessengerError> {
        let resolved = self.resolve(message.targets());
        let [target] = resolved.as_slice() else {
            return Err(MessengerError::InvalidTarget {
                channel: message.channel().to_string(),
                resolved: resolved.len(),
            });
        };

        let correlation_id = Uuid::new_v4();
        let message = message.into_query(correlation_id);
        let (reply, mut response) = oneshot::channel();
        self.pending.insert(
            correlation_id,
            PendingQuery {
                target: target.clone(),
                reply,
            },
        );

        if let Err(e) = self.transport.send_to(target, &message).await {
            self.pending.remove(&correlation_id);
            warn!(
                "Query on channel {} to {} could not be sent: {}",
                message.channel(),
                target,
                e
            );
            return Ok(None);
        }

        match tokio::time::timeout(timeout, &mut response).await {
            Ok(Ok(answer)) => Ok(Some(answer)),
            // Slot dropped: the peer disconnected while we were waiting
            Ok(Err(_)) => Ok(None),
            Err(_) => {
                if self.pending.remove(&correlation_id).is_some() {
                    warn!(
                        "Query on channel {} to {} timed out after {:?}",
                        message.channel(),
                        target,
                        timeout
                    );
                    return Ok(None);
                }
                // A response claimed the slot as the timer fired; it is already in flight
                Ok(response.await.ok())
            }
        }
    }

    /// Answer a query received from a peer
    pub async fn respond(&self, original: &Message, content: Vec<u8>) -> Result<(), MessengerError> {
        if !original.is_query() {
            return Err(ProtocolError::NotAQuery(original.channel().to_string()).into());
        }
        if original.correlation_id().is_none() {
            return Err(ProtocolError::MissingCorrelation(original.channel().to_string()).into());
        }
        if !original.claim_response() {
            return Err(ProtocolError::AlreadyResponded(original.channel().to_string()).into());
        }

        let response = Message::response_for(original, self.local_id(), content);
        self.transport
            .send_to(original.sender(), &response)
            .await
            .map_err(MessengerError::from)
    }

    /// Entry point for messages arriving from the transport
    ///
    /// Responses complete their pending query inline. Everything else goes to
    /// the sender's inbound queue, so listeners see one sender's messages in
    /// arrival order and a listener that issues a query of its own never holds
    /// up response processing.
    pub fn handle_incoming(self: &Arc<Self>, message: Message) {
        if message.is_response() {
            if let Err(e) = self.complete(message) {
                warn!("Dropping response: {}", e);
            }
            return;
        }

        let mut queue = self
            .inbound
            .entry(message.sender().to_string())
            .or_insert_with(|| self.spawn_inbound());
        if let Err(mpsc::error::SendError(message)) = queue.send(message) {
            let fresh = self.spawn_inbound();
            let _ = fresh.send(message);
            *queue = fresh;
        }
    }

    /// Drop the inbound queue of a node that went away
    ///
    /// Messages already queued are still dispatched.
    pub fn close_inbound(&self, node_id: &str) -> bool {
        self.inbound.remove(node_id).is_some()
    }

    fn spawn_inbound(self: &Arc<Self>) -> mpsc::UnboundedSender<Message> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let messenger: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let Some(messenger) = messenger.upgrade() else {
                    break;
                };
                messenger.dispatch(message).await;
            }
        });
        tx
    }

    /// Run the listeners for a message and answer it if it is a query
    pub async fn dispatch(&self, message: Message) {
        let mut event = ChannelMessageEvent::new(message);
        let invoked = self.listeners.fire(&mut event).await;
        let (message, response) = event.into_parts();

        if !message.is_query() {
            return;
        }
        if invoked == 0 {
            debug!("No listener for query on channel {}", message.channel());
        }

        // Unanswered queries get an empty response so the caller does not wait out its timeout
        let content = response.unwrap_or_default();
        if let Err(e) = self.respond(&message, content).await {
            warn!(
                "Failed to answer query on channel {} from {}: {}",
                message.channel(),
                message.sender(),
                e
            );
        }
    }

    /// Hand a response to the query waiting for it
    pub fn complete(&self, response: Message) -> Result<(), ProtocolError> {
        let correlation_id = response
            .correlation_id()
            .ok_or_else(|| ProtocolError::MissingCorrelation(response.channel().to_string()))?;

        let (_, pending) = self
            .pending
            .remove(&correlation_id)
            .ok_or(ProtocolError::UnknownCorrelation(correlation_id))?;

        if pending.reply.send(response).is_err() {
            debug!("Caller of query {} is gone", correlation_id);
        }
        Ok(())
    }

    /// Fail every query waiting on a node that went away
    ///
    /// Returns how many queries were completed with no response.
    pub fn fail_pending_for(&self, node_id: &str) -> usize {
        let ids: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|entry| entry.target == node_id)
            .map(|entry| *entry.key())
            .collect();

        // Dropping the reply sender wakes the caller with "no response"
        ids.into_iter()
            .filter(|id| self.pending.remove(id).is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::NodeIdentity;
    use crate::messaging::listeners::PRIORITY_NORMAL;
    use crate::messaging::local::LocalNetwork;
    use crate::messaging::transport::{TransportEvent, TransportEventReceiver};
    use tokio::time::Instant;

    async fn node(network: &Arc<LocalNetwork>, id: &str) -> (Arc<Messenger>, TransportEventReceiver) {
        let (transport, events) = network
            .join(NodeIdentity::new(id, format!("local://{}", id)))
            .await;
        (Arc::new(Messenger::new(Arc::new(transport))), events)
    }

    /// Feed transport events into a messenger, like the cluster runtime does
    fn pump(messenger: Arc<Messenger>, mut events: TransportEventReceiver) {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    TransportEvent::Message(message) => messenger.handle_incoming(message),
                    TransportEvent::Disconnected(id) => {
                        messenger.close_inbound(&id);
                        messenger.fail_pending_for(&id);
                    }
                    TransportEvent::Connected(_) => {}
                }
            }
        });
    }

    fn echo_listener() -> Arc<dyn ChannelListener> {
        Arc::new(|event: &mut ChannelMessageEvent| {
            let mut answer = b"echo:".to_vec();
            answer.extend_from_slice(event.content());
            let _ = event.set_response(answer);
        })
    }

    #[tokio::test]
    async fn test_query_round_trip() {
        let network = LocalNetwork::new();
        let (a, a_events) = node(&network, "a").await;
        let (b, b_events) = node(&network, "b").await;
        b.register_listener("echo", PRIORITY_NORMAL, echo_listener());
        pump(a.clone(), a_events);
        pump(b.clone(), b_events);

        let message = a
            .message("echo", vec![ChannelTarget::node("b")], b"ping".to_vec())
            .unwrap();
        let response = a.query(message).await.unwrap().unwrap();

        assert_eq!(response.content(), b"echo:ping");
        assert_eq!(response.sender(), "b");
        assert_eq!(a.pending_queries(), 0);
    }

    #[tokio::test]
    async fn test_query_without_listener_gets_empty_response() {
        let network = LocalNetwork::new();
        let (a, a_events) = node(&network, "a").await;
        let (b, b_events) = node(&network, "b").await;
        pump(a.clone(), a_events);
        pump(b.clone(), b_events);

        let message = a
            .message("nobody_listens", vec![ChannelTarget::node("b")], vec![])
            .unwrap();
        let response = a.query(message).await.unwrap().unwrap();
        assert!(response.content().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_query_times_out() {
        let network = LocalNetwork::new();
        let (a, a_events) = node(&network, "a").await;
        // b joins but never processes its events
        let (_b, _b_events) = node(&network, "b").await;
        pump(a.clone(), a_events);

        let message = a
            .message("echo", vec![ChannelTarget::node("b")], vec![])
            .unwrap();
        let started = Instant::now();
        let response = a.query(message).await.unwrap();

        assert!(response.is_none());
        let elapsed = started.elapsed();
        assert!(elapsed >= DEFAULT_QUERY_TIMEOUT);
        assert!(elapsed < DEFAULT_QUERY_TIMEOUT + Duration::from_millis(100));
        assert_eq!(a.pending_queries(), 0);
    }

    #[tokio::test]
    async fn test_query_to_unknown_node_fails_fast() {
        let network = LocalNetwork::new();
        let (a, _events) = node(&network, "a").await;

        let message = a
            .message("echo", vec![ChannelTarget::node("ghost")], vec![])
            .unwrap();
        let result = a.query(message).await;

        assert!(matches!(
            result,
            Err(MessengerError::InvalidTarget { resolved: 0, .. })
        ));
        assert_eq!(a.pending_queries(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_query_rejected() {
        let network = LocalNetwork::new();
        let (a, _a_events) = node(&network, "a").await;
        let (_b, _b_events) = node(&network, "b").await;
        let (_c, _c_events) = node(&network, "c").await;

        let message = a.message("echo", vec![ChannelTarget::all()], vec![]).unwrap();
        assert!(matches!(
            a.query(message).await,
            Err(MessengerError::InvalidTarget { resolved: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_resolve_deduplicates_targets() {
        let network = LocalNetwork::new();
        let (a, _a_events) = node(&network, "a").await;
        let (_b, _b_events) = node(&network, "b").await;
        let (_c, _c_events) = node(&network, "c").await;

        let resolved = a.resolve(&[
            ChannelTarget::node("c"),
            ChannelTarget::group("lobby"),
            ChannelTarget::node("a"),
        ]);
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0], "c");
        assert!(resolved.contains(&"b".to_string()));

        // Duplicate node targets still make a valid single-target query
        assert_eq!(
            a.resolve(&[ChannelTarget::node("b"), ChannelTarget::node("b")]),
            vec!["b".to_string()]
        );
    }

    #[tokio::test]
    async fn test_send_broadcast() {
        let network = LocalNetwork::new();
        let (a, _a_events) = node(&network, "a").await;
        let (_b, mut b_events) = node(&network, "b").await;
        let (_c, mut c_events) = node(&network, "c").await;

        let message = a
            .message("announce", vec![ChannelTarget::all()], b"hi".to_vec())
            .unwrap();
        assert_eq!(a.send(message).await, 2);

        for events in [&mut b_events, &mut c_events] {
            loop {
                match events.recv().await {
                    Some(TransportEvent::Message(message)) => {
                        assert_eq!(message.content(), b"hi");
                        break;
                    }
                    Some(_) => continue,
                    None => panic!("event channel closed"),
                }
            }
        }
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_query() {
        let network = LocalNetwork::new();
        let (a, a_events) = node(&network, "a").await;
        let (_b, _b_events) = node(&network, "b").await;
        pump(a.clone(), a_events);

        let querying = {
            let a = a.clone();
            tokio::spawn(async move {
                let message = a
                    .message("echo", vec![ChannelTarget::node("b")], vec![])
                    .unwrap();
                a.send_query(message, Duration::from_secs(60)).await
            })
        };

        while a.pending_queries() == 0 {
            tokio::task::yield_now().await;
        }
        network.disconnect("a", "b").await;

        let result = querying.await.unwrap().unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_respond_rules() {
        let network = LocalNetwork::new();
        let (a, _a_events) = node(&network, "a").await;
        let (b, _b_events) = node(&network, "b").await;

        let plain = a.message("c", vec![ChannelTarget::node("b")], vec![]).unwrap();
        assert!(matches!(
            b.respond(&plain, vec![]).await,
            Err(MessengerError::Protocol(ProtocolError::NotAQuery(_)))
        ));

        let query = plain.into_query(Uuid::new_v4());
        assert!(b.respond(&query, vec![1]).await.is_ok());
        assert!(matches!(
            b.respond(&query, vec![2]).await,
            Err(MessengerError::Protocol(ProtocolError::AlreadyResponded(_)))
        ));
    }

    #[tokio::test]
    async fn test_unknown_correlation_dropped() {
        let network = LocalNetwork::new();
        let (a, _a_events) = node(&network, "a").await;

        let query = Message::new("c", "b", vec![ChannelTarget::node("a")], vec![])
            .unwrap()
            .into_query(Uuid::new_v4());
        let stray = Message::response_for(&query, "b", vec![]);

        assert!(matches!(
            a.complete(stray),
            Err(ProtocolError::UnknownCorrelation(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_queries_complete_independently() {
        let network = LocalNetwork::new();
        let (a, a_events) = node(&network, "a").await;
        let (b, b_events) = node(&network, "b").await;
        b.register_listener("echo", PRIORITY_NORMAL, echo_listener());
        pump(a.clone(), a_events);
        pump(b.clone(), b_events);

        let tasks: Vec<_> = (0..32u8)
            .map(|i| {
                let a = a.clone();
                tokio::spawn(async move {
                    let message = a
                        .message("echo", vec![ChannelTarget::node("b")], vec![i])
                        .unwrap();
                    (i, a.query(message).await.unwrap().unwrap())
                })
            })
            .collect();

        for task in tasks {
            let (i, response) = task.await.unwrap();
            assert_eq!(response.content(), &[b'e', b'c', b'h', b'o', b':', i]);
        }
        assert_eq!(a.pending_queries(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_listener_sees_messages_in_send_order() {
        let network = LocalNetwork::new();
        let (a, a_events) = node(&network, "a").await;
        let (b, b_events) = node(&network, "b").await;
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorder = seen.clone();
        b.register_listener(
            "sequence",
            PRIORITY_NORMAL,
            Arc::new(move |event: &mut ChannelMessageEvent| {
                let mut bytes = [0u8; 2];
                bytes.copy_from_slice(event.content());
                recorder.lock().unwrap().push(u16::from_be_bytes(bytes));
            }),
        );
        pump(a.clone(), a_events);
        pump(b.clone(), b_events);

        const COUNT: u16 = 2000;
        for i in 0..COUNT {
            let message = a
                .message("sequence", vec![ChannelTarget::node("b")], i.to_be_bytes().to_vec())
                .unwrap();
            assert_eq!(a.send(message).await, 1);
        }

        tokio::time::timeout(Duration::from_secs(10), async {
            while seen.lock().unwrap().len() < COUNT as usize {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("listener did not see every message");

        let seen = seen.lock().unwrap();
        assert!(seen.iter().copied().eq(0..COUNT));
    }

    #[tokio::test]
    async fn test_inbound_queue_reopens_after_close() {
        let network = LocalNetwork::new();
        let (a, a_events) = node(&network, "a").await;
        let (b, b_events) = node(&network, "b").await;
        let seen = Arc::new(std::sync::Mutex::new(0usize));
        let counter = seen.clone();
        b.register_listener(
            "ping",
            PRIORITY_NORMAL,
            Arc::new(move |_: &mut ChannelMessageEvent| {
                *counter.lock().unwrap() += 1;
            }),
        );
        pump(a.clone(), a_events);
        pump(b.clone(), b_events);

        for round in 1..=2 {
            let message = a.message("ping", vec![ChannelTarget::node("b")], vec![]).unwrap();
            a.send(message).await;
            while *seen.lock().unwrap() < round {
                tokio::task::yield_now().await;
            }
            assert!(b.close_inbound("a"));
        }
        assert!(!b.close_inbound("a"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_response_racing_timeout_completes_once() {
        let network = LocalNetwork::new();
        let (a, _a_events) = node(&network, "a").await;
        let (_b, mut b_events) = node(&network, "b").await;

        for _ in 0..300 {
            let querying = {
                let a = a.clone();
                tokio::spawn(async move {
                    let message = a
                        .message("echo", vec![ChannelTarget::node("b")], vec![])
                        .unwrap();
                    a.send_query(message, Duration::from_millis(2)).await.unwrap()
                })
            };

            let query = loop {
                match b_events.recv().await {
                    Some(TransportEvent::Message(message)) => break message,
                    Some(_) => continue,
                    None => panic!("event channel closed"),
                }
            };
            std::thread::sleep(Duration::from_micros(1900));
            let completed = a.complete(Message::response_for(&query, "b", vec![1])).is_ok();

            let response = querying.await.unwrap();
            // Exactly one of response and timeout wins
            assert_eq!(response.is_some(), completed);
            if let Some(response) = response {
                assert_eq!(response.content(), &[1]);
            }
            assert_eq!(a.pending_queries(), 0);
        }
    }
}
