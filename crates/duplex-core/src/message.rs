//! The wire-level message unit.
//!
//! A [`Message`] carries a channel routing key, an opaque CBOR payload, and
//! the identity/correlation fields that the socket layer stamps. Replies
//! travel on a derived channel, `"{channel}_reply_{message_id}"`, so the
//! request/response machinery reuses the ordinary handler registry.

use ciborium::value::Value;
use uuid::Uuid;

/// Reserved channel for the authentication handshake.
pub const AUTH_CHANNEL: &str = "_auth_";

/// Reserved channel on which the server assigns the client its identity.
pub const CLIENT_ID_CHANNEL: &str = "_client_id_";

/// A single routable message.
///
/// `sender_id` equal to [`Uuid::nil`] denotes server origin; clients never
/// pick the nil identifier for themselves.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Routing key. Non-empty.
    pub channel: String,
    /// Opaque payload; the socket never inspects it outside the reserved
    /// handshake channels.
    pub data: Option<Value>,
    /// Fresh per message.
    pub message_id: Uuid,
    /// Present iff this message is a reply; equals the request's id.
    pub reply_to: Option<Uuid>,
    /// Originating peer; nil for the server.
    pub sender_id: Uuid,
    /// Present when the server directs a message at a specific client.
    pub target_id: Option<Uuid>,
}

impl Message {
    /// Create a message on `channel` with a fresh id.
    pub fn new(channel: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            channel: channel.into(),
            data,
            message_id: Uuid::new_v4(),
            reply_to: None,
            sender_id: Uuid::nil(),
            target_id: None,
        }
    }

    /// Create a reply to `request` carrying `data`.
    ///
    /// The reply travels on the derived reply channel. Correlation fields
    /// (`reply_to`, `sender_id`, `target_id`) are stamped by the socket when
    /// the reply is sent.
    pub fn reply(request: &Message, data: Option<Value>) -> Self {
        Self::new(Self::reply_channel(&request.channel, request.message_id), data)
    }

    /// The derived reply channel for a request on `channel` with id
    /// `message_id`: the literal pattern `"{channel}_reply_{message_id}"`.
    pub fn reply_channel(channel: &str, message_id: Uuid) -> String {
        format!("{channel}_reply_{message_id}")
    }

    /// Whether this message is a reply.
    pub fn is_reply(&self) -> bool {
        self.reply_to.is_some()
    }

    /// Look up `key` in a map-shaped payload.
    ///
    /// Returns `None` when there is no payload, the payload is not a map, or
    /// the key is absent.
    pub fn data_entry(&self, key: &str) -> Option<&Value> {
        let entries = self.data.as_ref()?.as_map()?;
        entries
            .iter()
            .find(|(k, _)| k.as_text() == Some(key))
            .map(|(_, v)| v)
    }
}
