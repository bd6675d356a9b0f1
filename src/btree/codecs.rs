//! Generic serialization seam for tree keys and values. The tree itself only
//! ever handles `Key`/`Vec<u8>`; these traits let a caller work in terms of
//! their own typed keys and values at the `Exchange` boundary.

use crate::error::Result;

/// Encodes/decodes a typed key to/from its order-preserving byte encoding.
pub trait KeyCodec: Sized {
    fn encode_key(value: &Self, out: &mut Vec<u8>);
    fn decode_key(bytes: &[u8]) -> Result<Self>;
}

/// Encodes/decodes a typed value to/from its opaque byte representation. The
/// tree never interprets value bytes; this is purely a caller convenience.
pub trait ValCodec: Sized {
    fn encode_val(value: &Self, out: &mut Vec<u8>);
    fn decode_val(bytes: &[u8]) -> Result<Self>;
}

impl KeyCodec for u64 {
    fn encode_key(value: &Self, out: &mut Vec<u8>) {
        out.extend_from_slice(&value.to_be_bytes());
    }

    fn decode_key(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 8] = bytes
            .try_into()
            .map_err(|_| crate::error::Error::InvalidKey("u64 key must be 8 bytes"))?;
        Ok(u64::from_be_bytes(arr))
    }
}

impl ValCodec for u64 {
    fn encode_val(value: &Self, out: &mut Vec<u8>) {
        out.extend_from_slice(&value.to_be_bytes());
    }

    fn decode_val(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 8] = bytes
            .try_into()
            .map_err(|_| crate::error::Error::InvalidKey("u64 value must be 8 bytes"))?;
        Ok(u64::from_be_bytes(arr))
    }
}

impl KeyCodec for Vec<u8> {
    fn encode_key(value: &Self, out: &mut Vec<u8>) {
        out.extend_from_slice(value);
    }

    fn decode_key(bytes: &[u8]) -> Result<Self> {
        Ok(bytes.to_vec())
    }
}

impl ValCodec for Vec<u8> {
    fn encode_val(value: &Self, out: &mut Vec<u8>) {
        out.extend_from_slice(value);
    }

    fn decode_val(bytes: &[u8]) -> Result<Self> {
        Ok(bytes.to_vec())
    }
}

impl KeyCodec for String {
    fn encode_key(value: &Self, out: &mut Vec<u8>) {
        out.extend_from_slice(value.as_bytes());
    }

    fn decode_key(bytes: &[u8]) -> Result<Self> {
        String::from_utf8(bytes.to_vec())
            .map_err(|_| crate::error::Error::InvalidKey("key bytes are not valid utf-8"))
    }
}

impl ValCodec for String {
    fn encode_val(value: &Self, out: &mut Vec<u8>) {
        out.extend_from_slice(value.as_bytes());
    }

    fn decode_val(bytes: &[u8]) -> Result<Self> {
        String::from_utf8(bytes.to_vec())
            .map_err(|_| crate::error::Error::InvalidKey("value bytes are not valid utf-8"))
    }
}
