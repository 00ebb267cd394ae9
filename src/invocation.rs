//! Invocation framing and method identity.
//!
//! A broadcast invocation travels as a msgpack array: `[method_id, args…]`
//! for fire-and-forget calls, `[method_id, message_id, args…]` when a
//! correlated response is expected. The argument bytes are produced by the
//! configured [`Serializer`](crate::serializer::Serializer) and appended
//! raw after the header, so peers only need to agree on the method id, not
//! on shared type metadata.

use bytes::Bytes;

use crate::error::Error;

pub type MethodId = u32;
pub type MessageId = u64;

const FNV_OFFSET: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Stable, process-independent method identifier: 32-bit FNV-1a over the
/// UTF-8 method name. Callers may override it per invocation.
pub fn method_id(name: &str) -> MethodId {
    let mut hash = FNV_OFFSET;
    for byte in name.as_bytes() {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Context handed to the serializer alongside the argument list.
#[derive(Debug, Clone, Copy)]
pub struct SerializationContext<'a> {
    pub method_name: &'a str,
    pub method_id: MethodId,
    pub message_id: Option<MessageId>,
}

/// A decoded (or about-to-be-framed) method call.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub method_id: MethodId,
    pub message_id: Option<MessageId>,
    /// Raw argument bytes in the serializer's encoding.
    pub args: Bytes,
}

impl Invocation {
    /// Frames this invocation into a single wire buffer.
    pub fn frame(&self) -> Result<Bytes, Error> {
        let mut buf = Vec::with_capacity(self.args.len() + 16);

        match self.message_id {
            None => {
                rmp::encode::write_array_len(&mut buf, 2)?;
                rmp::encode::write_u32(&mut buf, self.method_id)?;
            }
            Some(mid) => {
                rmp::encode::write_array_len(&mut buf, 3)?;
                rmp::encode::write_u32(&mut buf, self.method_id)?;
                rmp::encode::write_u64(&mut buf, mid)?;
            }
        }

        buf.extend_from_slice(&self.args);

        Ok(buf.into())
    }

    /// Parses a wire buffer produced by [`Invocation::frame`]. The argument
    /// bytes are sliced out of `bytes` without copying.
    pub fn decode(bytes: Bytes) -> Result<Self, Error> {
        let mut rd: &[u8] = &bytes;

        let len = rmp::decode::read_array_len(&mut rd)?;
        let (method_id, message_id) = match len {
            2 => (rmp::decode::read_u32(&mut rd)?, None),
            3 => {
                let method_id = rmp::decode::read_u32(&mut rd)?;
                let message_id = rmp::decode::read_u64(&mut rd)?;
                (method_id, Some(message_id))
            }
            other => {
                return Err(Error::Frame(format!(
                    "invocation frame must have 2 or 3 elements, got {}",
                    other
                )))
            }
        };

        let offset = bytes.len() - rd.len();

        Ok(Invocation {
            method_id,
            message_id,
            args: bytes.slice(offset..),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_known_vectors() {
        assert_eq!(method_id(""), 0x811c9dc5);
        assert_eq!(method_id("a"), 0xe40c292c);
        assert_eq!(method_id("foobar"), 0xbf9cf968);
    }

    #[test]
    fn frame_roundtrip_fire_and_forget() {
        let inv = Invocation {
            method_id: method_id("OnMessage"),
            message_id: None,
            args: Bytes::from_static(b"\x92\xa5hello\x2a"),
        };

        let decoded = Invocation::decode(inv.frame().unwrap()).unwrap();

        assert_eq!(decoded.method_id, inv.method_id);
        assert_eq!(decoded.message_id, None);
        assert_eq!(decoded.args, inv.args);
    }

    #[test]
    fn frame_roundtrip_with_message_id() {
        let inv = Invocation {
            method_id: 7,
            message_id: Some(42),
            args: Bytes::from_static(b"\x90"),
        };

        let decoded = Invocation::decode(inv.frame().unwrap()).unwrap();

        assert_eq!(decoded.method_id, 7);
        assert_eq!(decoded.message_id, Some(42));
        assert_eq!(decoded.args, inv.args);
    }

    #[test]
    fn decode_rejects_bad_arity() {
        let mut buf = Vec::new();
        rmp::encode::write_array_len(&mut buf, 5).unwrap();

        assert!(matches!(
            Invocation::decode(buf.into()),
            Err(Error::Frame(_))
        ));
    }
}
