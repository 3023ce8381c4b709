//! Channel messages exchanged between nodes
//!
//! A [`Message`] is addressed to one or more [`ChannelTarget`]s and names the
//! operation it carries through its channel. Messages are validated when they
//! are built and are not modified afterwards; the messenger derives query and
//! response variants from them.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors raised when building a message
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("Message channel must not be empty")]
    EmptyChannel,

    #[error("Message on channel '{0}' has no targets")]
    NoTargets(String),

    #[error("{0} target requires a value")]
    MissingTargetValue(TargetType),
}

/// Kind of receiver a message is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetType {
    /// One specific node
    Node,
    /// A service, wherever it runs
    Service,
    /// Every service in a group
    Group,
    /// Every connected node
    All,
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TargetType::Node => "NODE",
            TargetType::Service => "SERVICE",
            TargetType::Group => "GROUP",
            TargetType::All => "ALL",
        };
        f.write_str(name)
    }
}

/// A single message target
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelTarget {
    #[serde(rename = "type")]
    pub target_type: TargetType,

    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl ChannelTarget {
    pub fn node(id: impl Into<String>) -> Self {
        Self {
            target_type: TargetType::Node,
            value: Some(id.into()),
        }
    }

    pub fn service(name: impl Into<String>) -> Self {
        Self {
            target_type: TargetType::Service,
            value: Some(name.into()),
        }
    }

    pub fn group(name: impl Into<String>) -> Self {
        Self {
            target_type: TargetType::Group,
            value: Some(name.into()),
        }
    }

    pub fn all() -> Self {
        Self {
            target_type: TargetType::All,
            value: None,
        }
    }

    fn validate(&self) -> Result<(), MessageError> {
        match (self.target_type, &self.value) {
            (TargetType::All, _) => Ok(()),
            (kind, Some(value)) if value.is_empty() => Err(MessageError::MissingTargetValue(kind)),
            (_, Some(_)) => Ok(()),
            (kind, None) => Err(MessageError::MissingTargetValue(kind)),
        }
    }
}

/// A message on a named channel
#[derive(Debug, Clone)]
pub struct Message {
    channel: String,
    sender: String,
    targets: Vec<ChannelTarget>,
    content: Vec<u8>,
    query: bool,
    correlation_id: Option<Uuid>,

    // Shared between clones so a query is answered at most once
    responded: Arc<AtomicBool>,
}

impl Message {
    /// Build a plain message
    pub fn new(
        channel: impl Into<String>,
        sender: impl Into<String>,
        targets: Vec<ChannelTarget>,
        content: Vec<u8>,
    ) -> Result<Self, MessageError> {
        let channel = channel.into();
        if channel.is_empty() {
            return Err(MessageError::EmptyChannel);
        }
        if targets.is_empty() {
            return Err(MessageError::NoTargets(channel));
        }
        for target in &targets {
            target.validate()?;
        }

        Ok(Self {
            channel,
            sender: sender.into(),
            targets,
            content,
            query: false,
            correlation_id: None,
            responded: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Rebuild a message decoded from the wire
    pub(crate) fn from_wire(
        channel: String,
        sender: String,
        targets: Vec<ChannelTarget>,
        content: Vec<u8>,
        query: bool,
        correlation_id: Option<Uuid>,
    ) -> Result<Self, MessageError> {
        let mut message = Self::new(channel, sender, targets, content)?;
        message.query = query;
        message.correlation_id = correlation_id;
        Ok(message)
    }

    /// Query variant of this message with a fresh correlation id
    pub fn into_query(self, correlation_id: Uuid) -> Self {
        Self {
            query: true,
            correlation_id: Some(correlation_id),
            responded: Arc::new(AtomicBool::new(false)),
            ..self
        }
    }

    /// Response to `original`, routed back to its sender
    pub fn response_for(original: &Message, sender: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            channel: original.channel.clone(),
            sender: sender.into(),
            targets: vec![ChannelTarget::node(original.sender.clone())],
            content,
            query: false,
            correlation_id: original.correlation_id,
            responded: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Id of the sending node
    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn targets(&self) -> &[ChannelTarget] {
        &self.targets
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn into_content(self) -> Vec<u8> {
        self.content
    }

    pub fn is_query(&self) -> bool {
        self.query
    }

    /// Whether this message answers an earlier query
    pub fn is_response(&self) -> bool {
        !self.query && self.correlation_id.is_some()
    }

    pub fn correlation_id(&self) -> Option<Uuid> {
        self.correlation_id
    }

    /// Take the right to answer this query; true only for the first caller
    pub(crate) fn claim_response(&self) -> bool {
        self.responded
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_message() {
        let message = Message::new(
            "test_channel",
            "node-1",
            vec![ChannelTarget::node("node-2")],
            b"hello".to_vec(),
        )
        .unwrap();

        assert_eq!(message.channel(), "test_channel");
        assert_eq!(message.sender(), "node-1");
        assert_eq!(message.content(), b"hello");
        assert!(!message.is_query());
        assert!(!message.is_response());
    }

    #[test]
    fn test_validation() {
        assert_eq!(
            Message::new("", "node-1", vec![ChannelTarget::all()], vec![]).unwrap_err(),
            MessageError::EmptyChannel
        );
        assert!(matches!(
            Message::new("c", "node-1", vec![], vec![]),
            Err(MessageError::NoTargets(_))
        ));
        assert_eq!(
            Message::new("c", "node-1", vec![ChannelTarget::node("")], vec![]).unwrap_err(),
            MessageError::MissingTargetValue(TargetType::Node)
        );

        let groupless = ChannelTarget {
            target_type: TargetType::Group,
            value: None,
        };
        assert!(Message::new("c", "node-1", vec![groupless], vec![]).is_err());
    }

    #[test]
    fn test_query_and_response() {
        let id = Uuid::new_v4();
        let query = Message::new("c", "node-1", vec![ChannelTarget::node("node-2")], vec![1])
            .unwrap()
            .into_query(id);

        assert!(query.is_query());
        assert_eq!(query.correlation_id(), Some(id));

        let response = Message::response_for(&query, "node-2", vec![2]);
        assert!(response.is_response());
        assert_eq!(response.correlation_id(), Some(id));
        assert_eq!(response.sender(), "node-2");
        assert_eq!(response.targets(), &[ChannelTarget::node("node-1")]);
    }

    #[test]
    fn test_claim_response_once_across_clones() {
        let query = Message::new("c", "node-1", vec![ChannelTarget::node("node-2")], vec![])
            .unwrap()
            .into_query(Uuid::new_v4());
        let copy = query.clone();

        assert!(query.claim_response());
        assert!(!copy.claim_response());
    }

    #[test]
    fn test_target_json_shape() {
        let json = serde_json::to_value(ChannelTarget::node("node-7")).unwrap();
        assert_eq!(json["type"], "NODE");
        assert_eq!(json["value"], "node-7");

        let json = serde_json::to_value(ChannelTarget::all()).unwrap();
        assert_eq!(json["type"], "ALL");
        assert!(json.get("value").is_none());
    }
}
