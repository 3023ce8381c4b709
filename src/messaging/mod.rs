//! Node-to-node messaging
//!
//! Messages travel on named channels and are addressed to nodes, services,
//! groups or the whole cluster. The [`Messenger`] adds a request/response mode
//! (queries) on top of any [`Transport`].

pub mod codec;
pub mod listeners;
pub mod local;
pub mod message;
pub mod messenger;
pub mod tcp;
pub mod transport;

pub use codec::{decode_frame, encode_frame, CodecError, WireFrame};
pub use listeners::{
    ChannelListener, ChannelListeners, ChannelMessageEvent, PRIORITY_HIGHEST, PRIORITY_LOWEST,
    PRIORITY_NORMAL,
};
pub use local::{LocalNetwork, LocalTransport};
pub use message::{ChannelTarget, Message, MessageError, TargetType};
pub use messenger::{Messenger, MessengerError, ProtocolError, DEFAULT_QUERY_TIMEOUT};
pub use tcp::TcpTransport;
pub use transport::{
    event_channel, Transport, TransportError, TransportEvent, TransportEventReceiver,
    TransportEventSender,
};
