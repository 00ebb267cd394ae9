//! The byte-level argument codec seam.
//!
//! The serializer only encodes/decodes argument lists; invocation framing
//! and envelope framing live in [`invocation`](crate::invocation) and
//! [`envelope`](crate::envelope). The trait is object safe through
//! `erased-serde`, with typed helpers provided on `dyn Serializer`.

use serde::de::DeserializeOwned;

use crate::error::Error;
use crate::invocation::SerializationContext;

pub trait Serializer: Send + Sync + 'static {
    /// Appends the encoded argument list to `buf`.
    fn serialize_args(
        &self,
        buf: &mut Vec<u8>,
        args: &dyn erased_serde::Serialize,
        ctx: &SerializationContext<'_>,
    ) -> Result<(), Error>;

    /// Runs `f` against a deserializer positioned over `bytes`.
    fn deserialize_with(
        &self,
        bytes: &[u8],
        ctx: &SerializationContext<'_>,
        f: &mut dyn FnMut(&mut dyn erased_serde::Deserializer<'_>) -> Result<(), erased_serde::Error>,
    ) -> Result<(), Error>;

    /// Appends an encoded envelope key sequence to `buf`. Key sequences
    /// travel in the same codec as argument lists.
    fn serialize_keys(
        &self,
        buf: &mut Vec<u8>,
        keys: &dyn erased_serde::Serialize,
    ) -> Result<(), Error>;

    /// Runs `f` against a deserializer positioned over `bytes` and returns
    /// the number of bytes consumed, so the caller can keep slicing the
    /// envelope.
    fn deserialize_keys(
        &self,
        bytes: &[u8],
        f: &mut dyn FnMut(&mut dyn erased_serde::Deserializer<'_>) -> Result<(), erased_serde::Error>,
    ) -> Result<usize, Error>;
}

impl dyn Serializer {
    /// Decodes one typed value from `bytes`.
    pub fn decode_value<T: DeserializeOwned>(
        &self,
        bytes: &[u8],
        ctx: &SerializationContext<'_>,
    ) -> Result<T, Error> {
        let mut out = None;

        self.deserialize_with(bytes, ctx, &mut |de| {
            out = Some(erased_serde::deserialize::<T>(de)?);
            Ok(())
        })?;

        out.ok_or_else(|| Error::Frame("serializer produced no value".into()))
    }

    /// Decodes one key sequence from the front of `bytes`, returning the
    /// value and the encoded length.
    pub fn decode_keys<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<(T, usize), Error> {
        let mut out = None;

        let used = self.deserialize_keys(bytes, &mut |de| {
            out = Some(erased_serde::deserialize::<T>(de)?);
            Ok(())
        })?;

        match out {
            Some(value) => Ok((value, used)),
            None => Err(Error::Frame("serializer produced no value".into())),
        }
    }
}

/// Default codec: compact MessagePack via `rmp-serde`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MessagePackSerializer;

impl Serializer for MessagePackSerializer {
    fn serialize_args(
        &self,
        buf: &mut Vec<u8>,
        args: &dyn erased_serde::Serialize,
        _ctx: &SerializationContext<'_>,
    ) -> Result<(), Error> {
        let mut rmp_se = rmp_serde::Serializer::new(buf);
        let mut se = <dyn erased_serde::Serializer>::erase(&mut rmp_se);
        args.erased_serialize(&mut se)?;

        Ok(())
    }

    fn deserialize_with(
        &self,
        bytes: &[u8],
        _ctx: &SerializationContext<'_>,
        f: &mut dyn FnMut(&mut dyn erased_serde::Deserializer<'_>) -> Result<(), erased_serde::Error>,
    ) -> Result<(), Error> {
        let mut rmp_de = rmp_serde::Deserializer::new(bytes);
        let mut de = <dyn erased_serde::Deserializer>::erase(&mut rmp_de);
        f(&mut de)?;

        Ok(())
    }

    fn serialize_keys(
        &self,
        buf: &mut Vec<u8>,
        keys: &dyn erased_serde::Serialize,
    ) -> Result<(), Error> {
        let mut rmp_se = rmp_serde::Serializer::new(buf);
        let mut se = <dyn erased_serde::Serializer>::erase(&mut rmp_se);
        keys.erased_serialize(&mut se)?;

        Ok(())
    }

    fn deserialize_keys(
        &self,
        bytes: &[u8],
        f: &mut dyn FnMut(&mut dyn erased_serde::Deserializer<'_>) -> Result<(), erased_serde::Error>,
    ) -> Result<usize, Error> {
        let mut rd: &[u8] = bytes;

        {
            let mut rmp_de = rmp_serde::Deserializer::new(&mut rd);
            let mut de = <dyn erased_serde::Deserializer>::erase(&mut rmp_de);
            f(&mut de)?;
        }

        Ok(bytes.len() - rd.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invocation::method_id;

    fn ctx<'a>(name: &'a str) -> SerializationContext<'a> {
        SerializationContext {
            method_name: name,
            method_id: method_id(name),
            message_id: None,
        }
    }

    #[test]
    fn roundtrip_tuple_args() {
        let serializer = MessagePackSerializer;
        let ctx = ctx("Send");

        let mut buf = Vec::new();
        serializer
            .serialize_args(&mut buf, &("alice".to_string(), 42u32), &ctx)
            .unwrap();

        let s: &dyn Serializer = &serializer;
        let (name, value): (String, u32) = s.decode_value(&buf, &ctx).unwrap();

        assert_eq!(name, "alice");
        assert_eq!(value, 42);
    }

    #[test]
    fn decode_keys_reports_the_consumed_length() {
        let serializer = MessagePackSerializer;

        let mut buf = Vec::new();
        serializer
            .serialize_keys(&mut buf, &Some(vec!["a".to_string()]))
            .unwrap();
        let key_len = buf.len();
        buf.extend_from_slice(b"trailing payload");

        let s: &dyn Serializer = &serializer;
        let (keys, used) = s.decode_keys::<Option<Vec<String>>>(&buf).unwrap();

        assert_eq!(keys, Some(vec!["a".to_string()]));
        assert_eq!(used, key_len);
    }

    #[test]
    fn decode_error_surfaces() {
        let serializer = MessagePackSerializer;
        let s: &dyn Serializer = &serializer;

        let res: Result<(String, u32), _> = s.decode_value(b"\xc0", &ctx("Send"));
        assert!(res.is_err());
    }
}
