/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Control payloads exchanged by connections and links, and the codec
//! seam used to turn them into frame bodies.
//!
//! Only the fields the connection and link machinery reads or sets are
//! modelled. The wire encoding is delegated to a [`Codec`]; the default
//! [`BincodeCodec`] is sufficient for peers built on this crate.

use std::fmt;

use bytes::Bytes;
use enum_as_inner::EnumAsInner;
use serde::Deserialize;
use serde::Serialize;

/// Symbolic AMQP error conditions used by this crate.
pub mod condition {
    /// An operator intervened to close the connection.
    pub const CONNECTION_FORCED: &str = "amqp:connection:forced";
    /// A frame could not be parsed or arrived where it is not allowed.
    pub const FRAMING_ERROR: &str = "amqp:connection:framing-error";
    /// The peer sent more transfers than it had credit for.
    pub const TRANSFER_LIMIT_EXCEEDED: &str = "amqp:link:transfer-limit-exceeded";
    /// The link was detached by this side without the peer asking.
    pub const DETACH_FORCED: &str = "amqp:link:detach-forced";
    /// A message exceeded the link's maximum message size.
    pub const MESSAGE_SIZE_EXCEEDED: &str = "amqp:link:message-size-exceeded";
    /// A local resource limit was exceeded.
    pub const RESOURCE_LIMIT_EXCEEDED: &str = "amqp:resource-limit-exceeded";
    /// Internal failure.
    pub const INTERNAL_ERROR: &str = "amqp:internal-error";
    /// The peer attempted something not permitted in the current state.
    pub const NOT_ALLOWED: &str = "amqp:not-allowed";
}

/// An error carried by Close and Detach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCondition {
    /// The symbolic condition, e.g. `amqp:connection:forced`.
    pub condition: String,
    /// Optional human readable description.
    pub description: Option<String>,
}

impl ErrorCondition {
    /// A new error condition with a description.
    pub fn new(condition: &str, description: impl Into<String>) -> Self {
        Self {
            condition: condition.to_string(),
            description: Some(description.into()),
        }
    }
}

impl fmt::Display for ErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(description) => write!(f, "{}: {}", self.condition, description),
            None => write!(f, "{}", self.condition),
        }
    }
}

/// The role of a link endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Transfers flow out of this endpoint.
    Sender,
    /// Transfers flow into this endpoint.
    Receiver,
}

impl Role {
    /// The role the peer endpoint must have.
    pub fn peer(self) -> Role {
        match self {
            Role::Sender => Role::Receiver,
            Role::Receiver => Role::Sender,
        }
    }
}

/// Connection open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Open {
    /// The id of the sending container.
    pub container_id: String,
    /// The virtual host the sender is connecting to.
    pub hostname: Option<String>,
    /// The largest frame the sender will accept.
    pub max_frame_size: u32,
    /// The number of channels the sender supports.
    pub channel_max: u16,
    /// The sender's idle timeout in milliseconds. `None` or 0 disables
    /// heartbeats from the peer's side.
    pub idle_time_out: Option<u32>,
}

/// Connection close.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Close {
    /// Why the connection is closing, if not normally.
    pub error: Option<ErrorCondition>,
}

/// Link attach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attach {
    /// Link name, unique per container pair and direction.
    pub name: String,
    /// Handle chosen by the sender of this frame.
    pub handle: u32,
    /// Role of the sender of this frame.
    pub role: Role,
    /// Source address.
    pub source: Option<String>,
    /// Target address.
    pub target: Option<String>,
    /// Initial delivery count; set by the sending role only.
    pub initial_delivery_count: Option<u32>,
    /// Largest message the sender of this frame accepts.
    pub max_message_size: Option<u64>,
}

/// Link detach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Detach {
    /// Handle of the detaching link.
    pub handle: u32,
    /// Whether the link is closed rather than suspended.
    pub closed: bool,
    /// Why the link is detaching, if not normally.
    pub error: Option<ErrorCondition>,
}

/// Link flow state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flow {
    /// Handle of the link.
    pub handle: u32,
    /// The sender's view of the delivery count.
    pub delivery_count: u32,
    /// Credit granted to the sender.
    pub link_credit: u32,
    /// Messages the sender has ready.
    pub available: u32,
    /// Asks the sender to use up or give back its credit.
    pub drain: bool,
    /// Asks the peer to reply with its own flow state.
    pub echo: bool,
}

/// Message transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    /// Handle of the link.
    pub handle: u32,
    /// Session-scoped delivery id.
    pub delivery_id: u32,
    /// Link-scoped delivery tag.
    pub delivery_tag: Bytes,
    /// More frames of this message follow.
    pub more: bool,
    /// Message payload, or a fragment of it when `more` is set.
    pub payload: Bytes,
}

/// Any control payload this crate exchanges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, EnumAsInner)]
pub enum Performative {
    /// Connection open.
    Open(Open),
    /// Connection close.
    Close(Close),
    /// Link attach.
    Attach(Attach),
    /// Link detach.
    Detach(Detach),
    /// Link flow.
    Flow(Flow),
    /// Message transfer.
    Transfer(Transfer),
}

impl Performative {
    /// The performative's name, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Performative::Open(_) => "open",
            Performative::Close(_) => "close",
            Performative::Attach(_) => "attach",
            Performative::Detach(_) => "detach",
            Performative::Flow(_) => "flow",
            Performative::Transfer(_) => "transfer",
        }
    }
}

/// Errors encoding or decoding a performative.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("encode {0}: {1}")]
    Encode(&'static str, #[source] bincode::Error),
    #[error("decode: {0}")]
    Decode(#[source] bincode::Error),
}

/// Encodes performatives into frame bodies and back.
pub trait Codec: Send + Sync + fmt::Debug + 'static {
    /// Encode a performative into a frame body.
    fn encode(&self, performative: &Performative) -> Result<Bytes, CodecError>;

    /// Decode a frame body.
    fn decode(&self, body: Bytes) -> Result<Performative, CodecError>;
}

/// A [`Codec`] using bincode.
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeCodec;

impl Codec for BincodeCodec {
    fn encode(&self, performative: &Performative) -> Result<Bytes, CodecError> {
        bincode::serialize(performative)
            .map(Bytes::from)
            .map_err(|err| CodecError::Encode(performative.name(), err))
    }

    fn decode(&self, body: Bytes) -> Result<Performative, CodecError> {
        bincode::deserialize(&body).map_err(CodecError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bincode_codec() {
        let codec = BincodeCodec;
        let flow = Performative::Flow(Flow {
            handle: 3,
            delivery_count: u32::MAX,
            link_credit: 10,
            available: 2,
            drain: true,
            echo: false,
        });
        let body = codec.encode(&flow).unwrap();
        assert_eq!(codec.decode(body).unwrap(), flow);
    }

    #[test]
    fn test_decode_garbage() {
        let err = BincodeCodec
            .decode(Bytes::from_static(&[0xff, 0xff, 0xff, 0xff]))
            .unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }

    #[test]
    fn test_error_condition_display() {
        let error = ErrorCondition::new(condition::CONNECTION_FORCED, "shutting down");
        assert_eq!(error.to_string(), "amqp:connection:forced: shutting down");
        assert_eq!(Role::Sender.peer(), Role::Receiver);
    }
}
