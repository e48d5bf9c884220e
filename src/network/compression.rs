//! Input compression: XOR-delta against a reference input, then run-length
//! encoding of the (mostly zero) delta stream.
//!
//! Inputs barely change between consecutive frames, so XORing a burst of
//! pending inputs against the last acknowledged one yields long runs of zero
//! bytes, which the RLE stage collapses into `(count, value)` pairs. The
//! intermediate delta stream lives in a thread-local scratch buffer that is
//! reused across calls and hard-capped, so a runaway input type fails loudly
//! instead of ballooning memory.

use std::cell::RefCell;
use std::fmt;

/// Upper bound for the thread-local scratch buffer.
const MAX_SCRATCH_BYTES: usize = 256 * 1024;

thread_local! {
    /// Reused delta-stream scratch. Thread-local so independent sessions on
    /// different threads never contend, and safe to reuse because nothing in
    /// the engine suspends mid-call.
    static SCRATCH: RefCell<Vec<u8>> = const { RefCell::new(Vec::new()) };
}

/// Why compressing or decompressing an input burst failed.
///
/// [`CompressionError::Overflow`] on the encode path is a programming error
/// (the input type is far larger than this engine is meant for); every other
/// variant indicates a malformed or corrupted packet on the decode path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionError {
    /// The delta stream would exceed the scratch budget.
    Overflow {
        /// Bytes the operation would have needed.
        required: usize,
        /// The fixed scratch budget.
        limit: usize,
    },
    /// An RLE stream must be a sequence of `(count, value)` pairs; an odd
    /// number of bytes cannot be one.
    OddLength {
        /// Length of the offending stream.
        length: usize,
    },
    /// A run of zero bytes never occurs in a valid stream.
    ZeroRunCount {
        /// Byte offset of the offending pair.
        offset: usize,
    },
    /// The expanded delta stream does not divide into fixed-width inputs.
    WidthMismatch {
        /// Length of the expanded stream.
        length: usize,
        /// The expected input width.
        width: usize,
    },
    /// The reference input was empty.
    EmptyReference,
}

impl fmt::Display for CompressionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overflow { required, limit } => write!(
                f,
                "delta stream of {required} bytes exceeds the {limit} byte scratch budget"
            ),
            Self::OddLength { length } => {
                write!(f, "RLE stream has odd length {length}")
            },
            Self::ZeroRunCount { offset } => {
                write!(f, "RLE stream contains a zero-length run at offset {offset}")
            },
            Self::WidthMismatch { length, width } => write!(
                f,
                "delta stream of {length} bytes is not a multiple of the input width {width}"
            ),
            Self::EmptyReference => write!(f, "the reference input is empty"),
        }
    }
}

impl std::error::Error for CompressionError {}

/// Compresses a burst of same-width inputs against a reference input.
pub(crate) fn encode<'a>(
    reference: &[u8],
    pending: impl Iterator<Item = &'a Vec<u8>>,
) -> Result<Vec<u8>, CompressionError> {
    if reference.is_empty() {
        return Err(CompressionError::EmptyReference);
    }

    SCRATCH.with(|scratch| {
        let mut delta = scratch.borrow_mut();
        delta.clear();

        for input in pending {
            debug_assert_eq!(input.len(), reference.len());
            if input.len() != reference.len() {
                return Err(CompressionError::WidthMismatch {
                    length: input.len(),
                    width: reference.len(),
                });
            }
            let required = delta.len() + reference.len();
            if required > MAX_SCRATCH_BYTES {
                return Err(CompressionError::Overflow {
                    required,
                    limit: MAX_SCRATCH_BYTES,
                });
            }
            for (reference_byte, input_byte) in reference.iter().zip(input.iter()) {
                delta.push(reference_byte ^ input_byte);
            }
        }

        Ok(rle_encode(&delta))
    })
}

/// Decompresses a burst of inputs previously produced by [`encode`] with the
/// same reference input.
pub(crate) fn decode(
    reference: &[u8],
    data: &[u8],
) -> Result<Vec<Vec<u8>>, CompressionError> {
    if reference.is_empty() {
        return Err(CompressionError::EmptyReference);
    }

    SCRATCH.with(|scratch| {
        let mut delta = scratch.borrow_mut();
        delta.clear();
        rle_decode_into(data, &mut delta)?;

        if delta.len() % reference.len() != 0 {
            return Err(CompressionError::WidthMismatch {
                length: delta.len(),
                width: reference.len(),
            });
        }

        let mut inputs = Vec::with_capacity(delta.len() / reference.len());
        for chunk in delta.chunks_exact(reference.len()) {
            inputs.push(
                reference
                    .iter()
                    .zip(chunk.iter())
                    .map(|(reference_byte, delta_byte)| reference_byte ^ delta_byte)
                    .collect(),
            );
        }
        Ok(inputs)
    })
}

/// Collapses the byte stream into `(count, value)` pairs. Counts are between
/// 1 and 255; longer runs are split into several pairs.
fn rle_encode(stream: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut iter = stream.iter();
    let Some(mut current) = iter.next().copied() else {
        return out;
    };
    let mut count: u8 = 1;
    for &byte in iter {
        if byte == current && count < u8::MAX {
            count += 1;
        } else {
            out.push(count);
            out.push(current);
            current = byte;
            count = 1;
        }
    }
    out.push(count);
    out.push(current);
    out
}

/// Expands an RLE stream into the scratch buffer, enforcing the pair
/// structure, nonzero counts, and the scratch budget.
fn rle_decode_into(data: &[u8], out: &mut Vec<u8>) -> Result<(), CompressionError> {
    if data.len() % 2 != 0 {
        return Err(CompressionError::OddLength { length: data.len() });
    }
    for (pair_index, pair) in data.chunks_exact(2).enumerate() {
        let (count, value) = (pair[0], pair[1]);
        if count == 0 {
            return Err(CompressionError::ZeroRunCount {
                offset: pair_index * 2,
            });
        }
        let required = out.len() + count as usize;
        if required > MAX_SCRATCH_BYTES {
            return Err(CompressionError::Overflow {
                required,
                limit: MAX_SCRATCH_BYTES,
            });
        }
        out.resize(required, value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let reference = vec![0, 0, 0, 1];
        let pending = vec![
            vec![0, 0, 1, 0],
            vec![0, 0, 1, 1],
            vec![0, 1, 0, 0],
            vec![0, 1, 0, 1],
            vec![0, 1, 1, 0],
        ];
        let encoded = encode(&reference, pending.iter()).unwrap();
        let decoded = decode(&reference, &encoded).unwrap();
        assert_eq!(decoded, pending);
    }

    #[test]
    fn roundtrip_empty_burst() {
        let reference = vec![0u8; 4];
        let pending: Vec<Vec<u8>> = Vec::new();
        let encoded = encode(&reference, pending.iter()).unwrap();
        assert!(encoded.is_empty());
        let decoded = decode(&reference, &encoded).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn identical_inputs_collapse_to_zero_runs() {
        let reference = vec![0xff, 0xaa, 0x55, 0x01];
        let pending = vec![reference.clone(); 60];
        let encoded = encode(&reference, pending.iter()).unwrap();
        // 240 zero bytes collapse to a single (240, 0) pair
        assert_eq!(encoded, vec![240, 0]);
    }

    #[test]
    fn runs_longer_than_255_are_split() {
        let reference = vec![0u8; 100];
        let pending = vec![reference.clone(); 3];
        let encoded = encode(&reference, pending.iter()).unwrap();
        assert_eq!(encoded, vec![255, 0, 45, 0]);
        let decoded = decode(&reference, &encoded).unwrap();
        assert_eq!(decoded, pending);
    }

    #[test]
    fn rle_stream_shape() {
        let reference = vec![3u8, 1, 4, 1];
        let pending = vec![vec![5u8, 9, 2, 6], vec![5u8, 3, 5, 8]];
        let encoded = encode(&reference, pending.iter()).unwrap();
        assert_eq!(encoded.len() % 2, 0);
        assert!(encoded.chunks_exact(2).all(|pair| pair[0] > 0));
    }

    #[test]
    fn roundtrip_of_a_long_random_burst() {
        // 100 pseudo-random 16-byte inputs against a random reference
        let mut state = 0x2545_f491_4f6c_dd1du64;
        let mut next_byte = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        };
        let reference: Vec<u8> = (0..16).map(|_| next_byte()).collect();
        let pending: Vec<Vec<u8>> = (0..100)
            .map(|_| (0..16).map(|_| next_byte()).collect())
            .collect();

        let encoded = encode(&reference, pending.iter()).unwrap();
        assert_eq!(encoded.len() % 2, 0);
        assert!(encoded.chunks_exact(2).all(|pair| pair[0] > 0));
        let decoded = decode(&reference, &encoded).unwrap();
        assert_eq!(decoded, pending);
    }

    #[test]
    fn empty_reference_is_rejected() {
        let pending = vec![vec![1u8]];
        assert_eq!(
            encode(&[], pending.iter()),
            Err(CompressionError::EmptyReference)
        );
        assert_eq!(decode(&[], &[1, 0]), Err(CompressionError::EmptyReference));
    }

    #[test]
    fn odd_length_stream_is_rejected() {
        let reference = vec![0u8; 2];
        assert_eq!(
            decode(&reference, &[2, 0, 1]),
            Err(CompressionError::OddLength { length: 3 })
        );
    }

    #[test]
    fn zero_count_is_rejected() {
        let reference = vec![0u8; 2];
        assert_eq!(
            decode(&reference, &[2, 0, 0, 7]),
            Err(CompressionError::ZeroRunCount { offset: 2 })
        );
    }

    #[test]
    fn width_mismatch_is_rejected() {
        let reference = vec![0u8; 4];
        // expands to 3 bytes, which is not a multiple of 4
        assert_eq!(
            decode(&reference, &[3, 1]),
            Err(CompressionError::WidthMismatch {
                length: 3,
                width: 4
            })
        );
    }

    #[test]
    fn oversized_burst_overflows_encode() {
        let reference = vec![0u8; 64 * 1024];
        let pending = vec![reference.clone(); 5];
        assert!(matches!(
            encode(&reference, pending.iter()),
            Err(CompressionError::Overflow { .. })
        ));
    }

    #[test]
    fn hostile_stream_overflows_decode() {
        let reference = vec![0u8; 4];
        // claims 255 * N expanded bytes with a tiny packet
        let mut data = Vec::new();
        for _ in 0..2048 {
            data.push(255);
            data.push(0);
        }
        assert!(matches!(
            decode(&reference, &data),
            Err(CompressionError::Overflow { .. })
        ));
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// `decode(reference, encode(reference, inputs)) == inputs` for any
        /// non-empty reference and same-width inputs.
        #[test]
        fn roundtrip_is_identity(
            width in 1usize..=32,
            count in 0usize..=16,
            seed in any::<u64>(),
        ) {
            let mut state = seed;
            let mut next_byte = move || {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                (state >> 32) as u8
            };
            let reference: Vec<u8> = (0..width).map(|_| next_byte()).collect();
            let pending: Vec<Vec<u8>> = (0..count)
                .map(|_| (0..width).map(|_| next_byte()).collect())
                .collect();

            let encoded = encode(&reference, pending.iter()).unwrap();
            prop_assert_eq!(encoded.len() % 2, 0);
            prop_assert!(encoded.chunks_exact(2).all(|pair| pair[0] > 0));
            let decoded = decode(&reference, &encoded).unwrap();
            prop_assert_eq!(decoded, pending);
        }

        /// Encoding is deterministic.
        #[test]
        fn encoding_is_deterministic(
            reference in proptest::collection::vec(any::<u8>(), 1..16),
            count in 0usize..8,
        ) {
            let pending = vec![reference.clone(); count];
            let first = encode(&reference, pending.iter()).unwrap();
            let second = encode(&reference, pending.iter()).unwrap();
            prop_assert_eq!(first, second);
        }
    }
}
