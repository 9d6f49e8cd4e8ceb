use std::any::{Any, TypeId};

use anyhow::bail;
use bytes::BytesMut;
use rustc_hash::FxHashMap;

use crate::error::RemoteError;

/// Well-known message id carried by datagram handshake packets. Reserved -
///  the registry refuses application registrations for it.
pub const UDP_CONNECT_MESSAGE_ID: i32 = i32::MAX;

type EncodeFn = Box<dyn Fn(&(dyn Any + Send), &mut BytesMut) + Send + Sync>;
type DecodeFn = Box<dyn Fn(&[u8]) -> anyhow::Result<Box<dyn Any + Send>> + Send + Sync>;

struct EncodeEntry {
    message_id: i32,
    encode: EncodeFn,
}

struct DecodeEntry {
    type_name: &'static str,
    decode: DecodeFn,
}

/// Bidirectional mapping between a 32-bit message id and the (encode, decode)
///  pair for one message type.
///
/// Registration happens at startup on a mutable registry, which is then frozen
///  behind an `Arc` in the shared context. There is deliberately no interior
///  mutability: the map must be complete before the first session starts, and
///  lookups then need no synchronization.
pub struct MessageRegistry {
    encoders: FxHashMap<TypeId, EncodeEntry>,
    decoders: FxHashMap<i32, DecodeEntry>,
}

impl MessageRegistry {
    pub fn new() -> MessageRegistry {
        MessageRegistry {
            encoders: FxHashMap::default(),
            decoders: FxHashMap::default(),
        }
    }

    pub fn register<T: Send + 'static>(
        &mut self,
        message_id: i32,
        encode: impl Fn(&T, &mut BytesMut) + Send + Sync + 'static,
        decode: impl Fn(&[u8]) -> anyhow::Result<T> + Send + Sync + 'static,
    ) -> anyhow::Result<()> {
        if message_id == UDP_CONNECT_MESSAGE_ID {
            bail!("message id {} is reserved for the datagram handshake", message_id);
        }
        if self.decoders.contains_key(&message_id) {
            bail!("registering a second codec for message id {}", message_id);
        }
        if self.encoders.contains_key(&TypeId::of::<T>()) {
            bail!("registering a second message id for type {}", std::any::type_name::<T>());
        }

        self.encoders.insert(TypeId::of::<T>(), EncodeEntry {
            message_id,
            encode: Box::new(move |message, buf| {
                let message = message.downcast_ref::<T>()
                    .expect("encoder entry is keyed by its own TypeId");
                encode(message, buf);
            }),
        });
        self.decoders.insert(message_id, DecodeEntry {
            type_name: std::any::type_name::<T>(),
            decode: Box::new(move |body| {
                Ok(Box::new(decode(body)?) as Box<dyn Any + Send>)
            }),
        });
        Ok(())
    }

    /// Serializes `message` into `buf`, resolving the codec by the runtime
    ///  type. `type_name` is only used for the error message.
    pub fn encode(
        &self,
        type_name: &'static str,
        message: &(dyn Any + Send),
        buf: &mut BytesMut,
    ) -> Result<i32, RemoteError> {
        let entry = self.encoders.get(&message.type_id())
            .ok_or(RemoteError::UnknownMessageType(type_name))?;
        (entry.encode)(message, buf);
        Ok(entry.message_id)
    }

    pub fn decode(&self, message_id: i32, body: &[u8]) -> Result<Box<dyn Any + Send>, RemoteError> {
        let entry = self.decoders.get(&message_id)
            .ok_or(RemoteError::UnknownMessageId(message_id))?;
        (entry.decode)(body)
            .map_err(|e| RemoteError::Decode(format!("{}: {}", entry.type_name, e)))
    }
}

impl Default for MessageRegistry {
    fn default() -> Self {
        Self::new()
    }
}
