//! The 3-part wire envelope used whenever a broadcast crosses a backplane.
//!
//! Wire shape: a msgpack array header of 3, the exclude key sequence (nil
//! when absent), the target key sequence (nil when absent), then the raw
//! invocation payload appended as trailing bytes. Key sequences go through
//! the configured [`Serializer`], the same codec as invocation arguments,
//! so any peer with the key type can filter without knowing the payload's
//! method signature.

use bytes::Bytes;
use smallvec::SmallVec;

use crate::error::Error;
use crate::group::GroupKey;
use crate::serializer::Serializer;

pub type KeyList<K> = SmallVec<[K; 4]>;

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<K: GroupKey> {
    pub excludes: Option<KeyList<K>>,
    pub targets: Option<KeyList<K>>,
    pub payload: Bytes,
}

impl<K: GroupKey> Envelope<K> {
    pub fn new(excludes: Option<KeyList<K>>, targets: Option<KeyList<K>>, payload: Bytes) -> Self {
        Self {
            excludes,
            targets,
            payload,
        }
    }

    /// Whether a member registered under `key` is admitted by this
    /// envelope's exclude/target refinement.
    pub fn admits(&self, key: &K) -> bool {
        if let Some(excludes) = &self.excludes {
            if excludes.contains(key) {
                return false;
            }
        }

        if let Some(targets) = &self.targets {
            if !targets.contains(key) {
                return false;
            }
        }

        true
    }

    pub fn encode(&self, serializer: &dyn Serializer) -> Result<Bytes, Error> {
        let mut buf = Vec::with_capacity(self.payload.len() + 32);

        rmp::encode::write_array_len(&mut buf, 3)?;

        serializer.serialize_keys(&mut buf, &self.excludes)?;
        serializer.serialize_keys(&mut buf, &self.targets)?;

        buf.extend_from_slice(&self.payload);

        Ok(buf.into())
    }

    /// Decodes an envelope, slicing the payload out of `bytes` without
    /// copying.
    pub fn decode(bytes: Bytes, serializer: &dyn Serializer) -> Result<Self, Error> {
        let mut rd: &[u8] = &bytes;

        let len = rmp::decode::read_array_len(&mut rd)?;
        if len != 3 {
            return Err(Error::Frame(format!(
                "envelope must have 3 elements, got {}",
                len
            )));
        }

        let mut offset = bytes.len() - rd.len();

        let (excludes, used) = serializer.decode_keys::<Option<KeyList<K>>>(&bytes[offset..])?;
        offset += used;

        let (targets, used) = serializer.decode_keys::<Option<KeyList<K>>>(&bytes[offset..])?;
        offset += used;

        Ok(Envelope {
            excludes,
            targets,
            payload: bytes.slice(offset..),
        })
    }
}
