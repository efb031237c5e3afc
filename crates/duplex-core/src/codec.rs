//! CBOR codec for the duplex wire format.
//!
//! A message is one CBOR array of six stable slots:
//!
//! | slot | field      | encoding                     |
//! |------|------------|------------------------------|
//! | 0    | channel    | text                         |
//! | 1    | data       | any CBOR value, null if none |
//! | 2    | reply_to   | 16-byte bytes or null        |
//! | 3    | message_id | 16-byte bytes                |
//! | 4    | sender_id  | 16-byte bytes                |
//! | 5    | target_id  | 16-byte bytes or null        |
//!
//! The slot positions are the wire contract; alternative codecs must keep
//! them stable.

use std::io::Cursor;

use ciborium::value::Value;
use uuid::Uuid;

use crate::error::{DuplexError, DuplexResult};
use crate::message::Message;

/// Symmetric message serialization contract.
///
/// Implementations must satisfy `decode(encode(m)) == m` field-wise, with
/// structural equality on the payload.
pub trait MessageCodec: Send + Sync {
    fn encode(&self, message: &Message) -> DuplexResult<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> DuplexResult<Message>;
}

/// The reference codec: self-describing CBOR with fixed field slots.
#[derive(Debug, Default, Clone, Copy)]
pub struct CborCodec;

impl MessageCodec for CborCodec {
    fn encode(&self, message: &Message) -> DuplexResult<Vec<u8>> {
        if message.channel.is_empty() {
            return Err(DuplexError::Codec("message channel is empty".into()));
        }
        let slots = Value::Array(vec![
            Value::Text(message.channel.clone()),
            message.data.clone().unwrap_or(Value::Null),
            optional_id_slot(message.reply_to),
            id_slot(message.message_id),
            id_slot(message.sender_id),
            optional_id_slot(message.target_id),
        ]);
        let mut buf = Vec::new();
        ciborium::into_writer(&slots, &mut buf)?;
        Ok(buf)
    }

    fn decode(&self, bytes: &[u8]) -> DuplexResult<Message> {
        let value: Value = ciborium::from_reader(Cursor::new(bytes))?;
        let slots = match value {
            Value::Array(slots) => slots,
            other => {
                return Err(DuplexError::Codec(format!(
                    "expected message array, got {other:?}"
                )))
            }
        };
        let [channel, data, reply_to, message_id, sender_id, target_id]: [Value; 6] =
            slots.try_into().map_err(|slots: Vec<Value>| {
                DuplexError::Codec(format!("expected 6 message slots, got {}", slots.len()))
            })?;

        let channel = match channel {
            Value::Text(channel) if !channel.is_empty() => channel,
            other => {
                return Err(DuplexError::Codec(format!(
                    "invalid channel slot: {other:?}"
                )))
            }
        };
        let data = match data {
            Value::Null => None,
            value => Some(value),
        };
        let reply_to = take_optional_id(reply_to, "reply_to")?;
        let message_id = take_id(message_id, "message_id")?;
        let sender_id = take_id(sender_id, "sender_id")?;
        let target_id = take_optional_id(target_id, "target_id")?;

        Ok(Message {
            channel,
            data,
            message_id,
            reply_to,
            sender_id,
            target_id,
        })
    }
}

fn id_slot(id: Uuid) -> Value {
    Value::Bytes(id.as_bytes().to_vec())
}

fn optional_id_slot(id: Option<Uuid>) -> Value {
    id.map(id_slot).unwrap_or(Value::Null)
}

fn take_id(value: Value, slot: &str) -> DuplexResult<Uuid> {
    match value {
        Value::Bytes(bytes) => Uuid::from_slice(&bytes)
            .map_err(|e| DuplexError::Codec(format!("invalid {slot} slot: {e}"))),
        other => Err(DuplexError::Codec(format!(
            "invalid {slot} slot: {other:?}"
        ))),
    }
}

fn take_optional_id(value: Value, slot: &str) -> DuplexResult<Option<Uuid>> {
    match value {
        Value::Null => Ok(None),
        value => take_id(value, slot).map(Some),
    }
}
