//! Frame encoding for node-to-node connections
//!
//! Each frame (already delimited by the transport) is laid out as
//!
//! ```text
//! u32 header length | JSON header | u32 content length | content bytes
//! ```
//!
//! The header names the frame kind and carries the message envelope; the
//! content is passed through untouched.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::message::{ChannelTarget, Message, MessageError};
use crate::cluster::NodeIdentity;

/// Errors while encoding or decoding frames
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Invalid frame header: {0}")]
    Header(#[from] serde_json::Error),

    #[error("Frame truncated: expected {expected} bytes, {available} available")]
    Truncated { expected: usize, available: usize },

    #[error("Invalid message: {0}")]
    Message(#[from] MessageError),
}

/// A frame on a node connection
#[derive(Debug, Clone)]
pub enum WireFrame {
    /// First frame on every connection, announcing the peer
    Hello(NodeIdentity),
    /// A channel message
    Message(Message),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum FrameHeader {
    Hello {
        node: NodeIdentity,
    },
    Message {
        channel: String,
        sender: String,
        targets: Vec<ChannelTarget>,
        query: bool,
        #[serde(rename = "correlationId")]
        #[serde(default)]
        #[serde(skip_serializing_if = "Option::is_none")]
        correlation_id: Option<Uuid>,
    },
}

/// Encode a frame into its byte representation
pub fn encode_frame(frame: &WireFrame) -> Result<Bytes, CodecError> {
    let (header, content): (FrameHeader, &[u8]) = match frame {
        WireFrame::Hello(node) => (FrameHeader::Hello { node: node.clone() }, &[]),
        WireFrame::Message(message) => (
            FrameHeader::Message {
                channel: message.channel().to_string(),
                sender: message.sender().to_string(),
                targets: message.targets().to_vec(),
                query: message.is_query(),
                correlation_id: message.correlation_id(),
            },
            message.content(),
        ),
    };

    let header = serde_json::to_vec(&header)?;
    let mut buf = BytesMut::with_capacity(8 + header.len() + content.len());
    buf.put_u32(header.len() as u32);
    buf.put_slice(&header);
    buf.put_u32(content.len() as u32);
    buf.put_slice(content);
    Ok(buf.freeze())
}

/// Decode a frame produced by [`encode_frame`]
pub fn decode_frame(mut buf: &[u8]) -> Result<WireFrame, CodecError> {
    let header = read_chunk(&mut buf)?;
    let content = read_chunk(&mut buf)?;

    match serde_json::from_slice::<FrameHeader>(header)? {
        FrameHeader::Hello { node } => Ok(WireFrame::Hello(node)),
        FrameHeader::Message {
            channel,
            sender,
            targets,
            query,
            correlation_id,
        } => {
            let message = Message::from_wire(
                channel,
                sender,
                targets,
                content.to_vec(),
                query,
                correlation_id,
            )?;
            Ok(WireFrame::Message(message))
        }
    }
}

fn read_chunk<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], CodecError> {
    if buf.remaining() < 4 {
        return Err(CodecError::Truncated {
            expected: 4,
            available: buf.remaining(),
        });
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(CodecError::Truncated {
            expected: len,
            available: buf.remaining(),
        });
    }
    let current: &'a [u8] = *buf;
    let (chunk, rest) = current.split_at(len);
    *buf = rest;
    Ok(chunk)
}
