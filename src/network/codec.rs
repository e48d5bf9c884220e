//! The single bincode configuration all wire data goes through.
//!
//! Fixed-int encoding keeps every integer at its declared width in
//! little-endian order, so a message (and in particular a serialized input)
//! always occupies the same number of bytes. Deterministic sizes are what the
//! input compressor's fixed-width framing relies on.

use serde::{de::DeserializeOwned, Serialize};

fn config() -> impl bincode::config::Config {
    bincode::config::standard().with_fixed_int_encoding()
}

/// Serializes a value into a fresh byte vector.
pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::error::EncodeError> {
    bincode::serde::encode_to_vec(value, config())
}

/// Deserializes a value from the front of the given bytes.
pub(crate) fn decode<T: DeserializeOwned>(
    bytes: &[u8],
) -> Result<T, bincode::error::DecodeError> {
    bincode::serde::decode_from_slice(bytes, config()).map(|(value, _)| value)
}

/// The serialized width of the type's default value. Input types serialize
/// every value at this same width (fixed-int encoding, fixed layout).
pub(crate) fn serialized_size<T: Serialize + Default>(
) -> Result<usize, bincode::error::EncodeError> {
    encode(&T::default()).map(|bytes| bytes.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Frame;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize, Default)]
    struct Sample {
        a: u16,
        b: i32,
    }

    #[test]
    fn roundtrip() {
        let value = Sample { a: 7, b: -3 };
        let bytes = encode(&value).unwrap();
        let back: Sample = decode(&bytes).unwrap();
        assert_eq!(value, back);
    }

    #[test]
    fn fixed_int_encoding_is_little_endian() {
        let bytes = encode(&0x1234u16).unwrap();
        assert_eq!(bytes, vec![0x34, 0x12]);
        let bytes = encode(&Frame::new(1)).unwrap();
        assert_eq!(bytes, vec![1, 0, 0, 0]);
    }

    #[test]
    fn serialized_size_matches_encoding() {
        assert_eq!(serialized_size::<Sample>().unwrap(), 6);
        assert_eq!(serialized_size::<u8>().unwrap(), 1);
    }

    #[test]
    fn truncated_input_fails_to_decode() {
        let bytes = encode(&Sample { a: 1, b: 2 }).unwrap();
        let result: Result<Sample, _> = decode(&bytes[..3]);
        assert!(result.is_err());
    }
}
