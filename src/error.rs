use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::network::compression::CompressionError;
use crate::{Frame, PlayerHandle};

/// The error type for all fallible Palisade operations.
///
/// Note what is *not* an error: hitting the prediction barrier simply yields
/// an empty request list from `advance_frame`, and malformed or stale network
/// packets are dropped silently (with a counter). Handshake exhaustion and
/// peer timeouts surface as session events, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PalisadeError {
    /// A request with invalid parameters, e.g. an input for a handle that is
    /// not a local player, or a session built from an inconsistent player set.
    InvalidRequest {
        /// Why the request was invalid.
        info: String,
    },
    /// A player handle outside the range of registered players.
    InvalidPlayerHandle {
        /// The offending handle.
        handle: PlayerHandle,
        /// The highest valid player handle (`num_players - 1`).
        max_handle: PlayerHandle,
    },
    /// `advance_frame` was called without input queued for every local player.
    MissingInput {
        /// The player whose input is missing.
        player_handle: PlayerHandle,
        /// The frame the input was needed for.
        frame: Frame,
    },
    /// The session has not finished synchronizing with its remote clients.
    NotSynchronized,
    /// A frame number outside the valid range for the attempted operation.
    InvalidFrame {
        /// The offending frame.
        frame: Frame,
        /// Why the frame was invalid.
        reason: String,
    },
    /// In a [`SyncTestSession`], re-simulated frames produced checksums that
    /// differ from the ones recorded the first time around — the simulation
    /// is not deterministic or not rollback-safe.
    ///
    /// [`SyncTestSession`]: crate::SyncTestSession
    MismatchedChecksum {
        /// The frame at which the mismatch was found.
        current_frame: Frame,
        /// Every re-simulated frame whose checksum differed.
        mismatched_frames: Vec<Frame>,
    },
    /// The spectator fell so far behind the host that the needed inputs have
    /// been overwritten; catching up is impossible.
    SpectatorTooFarBehind,
    /// The host of a spectated session has disconnected; replication ended.
    HostDisconnected,
    /// The input compressor exceeded its scratch budget. This indicates a bug
    /// (an input type far larger than intended) rather than a network
    /// condition.
    Compression(CompressionError),
}

impl Display for PalisadeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRequest { info } => write!(f, "Invalid request: {info}"),
            Self::InvalidPlayerHandle { handle, max_handle } => write!(
                f,
                "Invalid player handle {handle}: highest valid handle is {max_handle}"
            ),
            Self::MissingInput {
                player_handle,
                frame,
            } => write!(
                f,
                "Missing local input for {player_handle} at frame {frame}"
            ),
            Self::NotSynchronized => write!(
                f,
                "The session is not yet synchronized with all remote clients"
            ),
            Self::InvalidFrame { frame, reason } => {
                write!(f, "Invalid frame {frame}: {reason}")
            },
            Self::MismatchedChecksum {
                current_frame,
                mismatched_frames,
            } => {
                write!(
                    f,
                    "Detected checksum mismatch during rollback at frame {current_frame}, mismatched frames: ["
                )?;
                for (i, frame) in mismatched_frames.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{frame}")?;
                }
                write!(f, "]")
            },
            Self::SpectatorTooFarBehind => write!(
                f,
                "The spectator got so far behind the host that catching up is impossible"
            ),
            Self::HostDisconnected => write!(f, "The spectated host has disconnected"),
            Self::Compression(err) => write!(f, "Input compression failed: {err}"),
        }
    }
}

impl Error for PalisadeError {}

impl From<CompressionError> for PalisadeError {
    fn from(err: CompressionError) -> Self {
        Self::Compression(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_invalid_request() {
        let err = PalisadeError::InvalidRequest {
            info: "no local player".to_owned(),
        };
        assert_eq!(err.to_string(), "Invalid request: no local player");
    }

    #[test]
    fn display_invalid_player_handle() {
        let err = PalisadeError::InvalidPlayerHandle {
            handle: PlayerHandle::new(4),
            max_handle: PlayerHandle::new(1),
        };
        assert!(err.to_string().contains("PlayerHandle(4)"));
        assert!(err.to_string().contains("PlayerHandle(1)"));
    }

    #[test]
    fn display_mismatched_checksum() {
        let err = PalisadeError::MismatchedChecksum {
            current_frame: Frame::new(20),
            mismatched_frames: vec![Frame::new(17), Frame::new(18)],
        };
        let text = err.to_string();
        assert!(text.contains("frame 20"));
        assert!(text.contains("[17, 18]"));
    }

    #[test]
    fn error_is_std_error() {
        fn assert_error<E: Error>(_: &E) {}
        assert_error(&PalisadeError::NotSynchronized);
    }

    #[test]
    fn compression_error_converts() {
        let err: PalisadeError = CompressionError::Overflow {
            required: 300_000,
            limit: 262_144,
        }
        .into();
        assert!(matches!(err, PalisadeError::Compression(_)));
    }
}
