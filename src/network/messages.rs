use serde::{Deserialize, Serialize};

use crate::Frame;

/// What one peer knows about another player's connection: whether the player
/// has been disconnected, and the last frame an input was received for.
///
/// Every outbound [`Input`] message carries the sender's full view; receivers
/// merge it so all peers converge on who disconnected at which frame.
/// `last_frame` only ever increases and `disconnected` is sticky.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    /// Whether this player has been disconnected.
    pub disconnected: bool,
    /// The last frame an input was received for from this player.
    pub last_frame: Frame,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            disconnected: false,
            last_frame: Frame::NULL,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct SyncRequest {
    /// A nonce the receiver echoes back, proving the reply is fresh.
    pub random: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct SyncReply {
    /// The nonce from the matching [`SyncRequest`].
    pub random: u32,
}

/// A burst of compressed inputs plus everything piggybacked on it: the
/// sender's connection-status table, the acknowledgement cursor, a disconnect
/// notice, and (optionally) a state checksum for desync detection.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Input {
    pub peer_connect_status: Vec<ConnectionStatus>,
    /// First frame contained in `bytes`.
    pub start_frame: Frame,
    pub disconnect_requested: bool,
    /// The frame the sender disconnected at; meaningful only when
    /// `disconnect_requested` is set.
    pub disconnect_frame: Frame,
    /// Highest frame received from the destination peer; acknowledges
    /// everything up to it.
    pub ack_frame: Frame,
    /// Length of the compressed payload in bits.
    pub num_bits: u16,
    /// Serialized width of a single tick of input, in bytes.
    pub input_size: u8,
    /// Frame the piggybacked checksum belongs to, or [`Frame::NULL`].
    pub checksum_frame: Frame,
    pub checksum: u64,
    /// The XOR-delta + RLE compressed inputs.
    pub bytes: Vec<u8>,
}

impl Default for Input {
    fn default() -> Self {
        Self {
            peer_connect_status: Vec::new(),
            start_frame: Frame::NULL,
            disconnect_requested: false,
            disconnect_frame: Frame::NULL,
            ack_frame: Frame::NULL,
            num_bits: 0,
            input_size: 0,
            checksum_frame: Frame::NULL,
            checksum: 0,
            bytes: Vec::new(),
        }
    }
}

impl std::fmt::Debug for Input {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // destructured so a new field can't be forgotten here
        let Self {
            peer_connect_status,
            start_frame,
            disconnect_requested,
            disconnect_frame,
            ack_frame,
            num_bits,
            input_size,
            checksum_frame,
            checksum,
            bytes,
        } = self;

        f.debug_struct("Input")
            .field("peer_connect_status", peer_connect_status)
            .field("start_frame", start_frame)
            .field("disconnect_requested", disconnect_requested)
            .field("disconnect_frame", disconnect_frame)
            .field("ack_frame", ack_frame)
            .field("num_bits", num_bits)
            .field("input_size", input_size)
            .field("checksum_frame", checksum_frame)
            .field("checksum", checksum)
            .field("bytes", &BytesDebug(bytes))
            .finish()
    }
}

struct BytesDebug<'a>(&'a [u8]);

impl std::fmt::Debug for BytesDebug<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("0x")?;
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct InputAck {
    pub ack_frame: Frame,
}

impl Default for InputAck {
    fn default() -> Self {
        Self {
            ack_frame: Frame::NULL,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct QualityReport {
    /// The sender's frame advantage over the receiver, clamped to an `i8`.
    /// The time-sync window smooths over the clamp's rare saturation.
    pub frame_advantage: i8,
    /// The sender's wall clock in milliseconds, echoed back in the reply.
    pub ping: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct QualityReply {
    pub pong: u32,
}

/// Every message starts with the connection's magic number and a monotone
/// (wrapping) sequence number used to drop replayed and stale packets.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct MessageHeader {
    pub magic: u16,
    pub sequence: u16,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum MessageBody {
    SyncRequest(SyncRequest),
    SyncReply(SyncReply),
    Input(Input),
    InputAck(InputAck),
    QualityReport(QualityReport),
    QualityReply(QualityReply),
    KeepAlive,
}

/// A datagram exchanged between two Palisade endpoints.
///
/// [`NonBlockingSocket`] implementations serialize and deserialize this type
/// (the library's own socket uses the internal fixed-int little-endian codec)
/// but never need to look inside.
///
/// [`NonBlockingSocket`]: crate::NonBlockingSocket
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub(crate) header: MessageHeader,
    pub(crate) body: MessageBody,
}
