//! Channel listeners
//!
//! Incoming messages are dispatched by channel name to the listeners
//! registered for it. Listeners run one after another in priority order
//! (lower values first, equal priorities in registration order). For a query,
//! any listener may fill the response slot of the event, but only once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use super::message::Message;
use super::messenger::ProtocolError;

/// Runs before every other listener
pub const PRIORITY_HIGHEST: i32 = -64;
pub const PRIORITY_NORMAL: i32 = 0;
/// Runs after every other listener
pub const PRIORITY_LOWEST: i32 = 64;

/// A received message being dispatched to listeners
#[derive(Debug)]
pub struct ChannelMessageEvent {
    message: Message,
    response: Option<Vec<u8>>,
}

impl ChannelMessageEvent {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            response: None,
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn channel(&self) -> &str {
        self.message.channel()
    }

    pub fn sender(&self) -> &str {
        self.message.sender()
    }

    pub fn content(&self) -> &[u8] {
        self.message.content()
    }

    pub fn is_query(&self) -> bool {
        self.message.is_query()
    }

    /// Answer the query carried by this event
    pub fn set_response(&mut self, content: Vec<u8>) -> Result<(), ProtocolError> {
        if !self.message.is_query() {
            return Err(ProtocolError::NotAQuery(self.message.channel().to_string()));
        }
        if self.response.is_some() {
            return Err(ProtocolError::AlreadyResponded(
                self.message.channel().to_string(),
            ));
        }
        self.response = Some(content);
        Ok(())
    }

    pub fn response(&self) -> Option<&[u8]> {
        self.response.as_deref()
    }

    pub fn into_parts(self) -> (Message, Option<Vec<u8>>) {
        (self.message, self.response)
    }
}

/// Handles messages on a channel
#[async_trait]
pub trait ChannelListener: Send + Sync {
    async fn on_message(&self, event: &mut ChannelMessageEvent);
}

#[async_trait]
impl<F> ChannelListener for F
where
    F: Fn(&mut ChannelMessageEvent) + Send + Sync,
{
    async fn on_message(&self, event: &mut ChannelMessageEvent) {
        self(event)
    }
}

#[derive(Clone)]
struct RegisteredListener {
    priority: i32,
    seq: u64,
    listener: Arc<dyn ChannelListener>,
}

/// Listeners keyed by channel name
#[derive(Default)]
pub struct ChannelListeners {
    channels: DashMap<String, Vec<RegisteredListener>>,
    next_seq: AtomicU64,
}

impl ChannelListeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for a channel
    pub fn register(
        &self,
        channel: impl Into<String>,
        priority: i32,
        listener: Arc<dyn ChannelListener>,
    ) {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let mut listeners = self.channels.entry(channel.into()).or_default();
        listeners.push(RegisteredListener {
            priority,
            seq,
            listener,
        });
        listeners.sort_by_key(|l| (l.priority, l.seq));
    }

    /// Drop every listener of a channel
    pub fn unregister_channel(&self, channel: &str) -> usize {
        self.channels
            .remove(channel)
            .map(|(_, listeners)| listeners.len())
            .unwrap_or(0)
    }

    /// Number of listeners registered for a channel
    pub fn count(&self, channel: &str) -> usize {
        self.channels.get(channel).map(|l| l.len()).unwrap_or(0)
    }

    /// Dispatch an event to the listeners of its channel
    ///
    /// Returns how many listeners were invoked.
    pub async fn fire(&self, event: &mut ChannelMessageEvent) -> usize {
        // Copy out so no map lock is held while listeners run
        let listeners: Vec<Arc<dyn ChannelListener>> = match self.channels.get(event.channel()) {
            Some(registered) => registered.iter().map(|l| l.listener.clone()).collect(),
            None => return 0,
        };

        for listener in &listeners {
            listener.on_message(event).await;
        }
        listeners.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::message::ChannelTarget;
    use std::sync::Mutex;
    use uuid::Uuid;

    fn message(query: bool) -> Message {
        let message =
            Message::new("test", "node-1", vec![ChannelTarget::node("node-2")], vec![]).unwrap();
        if query {
            message.into_query(Uuid::new_v4())
        } else {
            message
        }
    }

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> Arc<dyn ChannelListener> {
        let log = log.clone();
        Arc::new(move |_event: &mut ChannelMessageEvent| {
            log.lock().unwrap().push(name);
        })
    }

    #[tokio::test]
    async fn test_priority_order() {
        let listeners = ChannelListeners::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        listeners.register("test", PRIORITY_LOWEST, recorder(&log, "lowest"));
        listeners.register("test", PRIORITY_NORMAL, recorder(&log, "normal-1"));
        listeners.register("test", PRIORITY_HIGHEST, recorder(&log, "highest"));
        listeners.register("test", PRIORITY_NORMAL, recorder(&log, "normal-2"));

        let mut event = ChannelMessageEvent::new(message(false));
        assert_eq!(listeners.fire(&mut event).await, 4);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["highest", "normal-1", "normal-2", "lowest"]
        );
    }

    #[tokio::test]
    async fn test_other_channels_not_invoked() {
        let listeners = ChannelListeners::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        listeners.register("other", PRIORITY_NORMAL, recorder(&log, "other"));

        let mut event = ChannelMessageEvent::new(message(false));
        assert_eq!(listeners.fire(&mut event).await, 0);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_response_slot_set_once() {
        let mut event = ChannelMessageEvent::new(message(true));

        assert!(event.set_response(vec![1]).is_ok());
        assert!(matches!(
            event.set_response(vec![2]),
            Err(ProtocolError::AlreadyResponded(_))
        ));
        assert_eq!(event.response(), Some(&[1u8][..]));
    }

    #[test]
    fn test_response_to_plain_message_rejected() {
        let mut event = ChannelMessageEvent::new(message(false));
        assert!(matches!(
            event.set_response(vec![1]),
            Err(ProtocolError::NotAQuery(_))
        ));
    }

    #[test]
    fn test_unregister_channel() {
        let listeners = ChannelListeners::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        listeners.register("test", PRIORITY_NORMAL, recorder(&log, "a"));
        listeners.register("test", PRIORITY_NORMAL, recorder(&log, "b"));

        assert_eq!(listeners.count("test"), 2);
        assert_eq!(listeners.unregister_channel("test"), 2);
        assert_eq!(listeners.count("test"), 0);
    }
}
