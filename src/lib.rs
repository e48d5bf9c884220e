//! # Palisade
//!
//! Palisade is a peer-to-peer rollback netcode engine for deterministic,
//! frame-stepped simulations, written in 100% safe Rust.
//!
//! Instead of registering callback functions, Palisade returns a list of
//! [`PalisadeRequest`]s from [`P2PSession::advance_frame`] for the game to
//! fulfill in order: save the game state, load an earlier state, or advance
//! the simulation with a full set of player inputs. Every tick the engine
//! accepts local input, speculatively advances the simulation using predicted
//! remote inputs, and rewinds and re-simulates when authoritative remote
//! inputs turn out to diverge from the prediction.
//!
//! The engine stays entirely behind the game loop. It consumes two external
//! capabilities: a non-blocking datagram socket ([`NonBlockingSocket`]) and
//! the request interface above. Matchmaking, NAT traversal and the outer
//! fixed-step driver are the host's business.
//!
//! ## Session modes
//!
//! - [`P2PSession`] — peer-to-peer play between 2 to 4 players plus spectators,
//! - [`SpectatorSession`] — replicates a match by consuming the confirmed
//!   inputs a host broadcasts,
//! - [`SyncTestSession`] — a single-process tool that rewinds and re-simulates
//!   every frame to prove the simulation is deterministic and rollback-safe.
//!
//! All three are created through the [`SessionBuilder`].

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::{fmt::Debug, hash::Hash};

use serde::{de::DeserializeOwned, Serialize};

pub use error::PalisadeError;
pub use network::compression::CompressionError;
pub use network::messages::{ConnectionStatus, Message};
pub use network::network_stats::NetworkStats;
pub use network::udp_socket::UdpNonBlockingSocket;
pub use sessions::builder::SessionBuilder;
pub use sessions::p2p_session::P2PSession;
pub use sessions::p2p_spectator_session::SpectatorSession;
pub use sessions::sync_test_session::SyncTestSession;
pub use smallvec::SmallVec;
pub use sync_layer::GameStateCell;

pub(crate) mod error;
pub(crate) mod frame_info;
pub(crate) mod input_queue;
pub(crate) mod sync_layer;
pub(crate) mod time_sync;
pub(crate) mod sessions {
    pub(crate) mod builder;
    pub(crate) mod p2p_session;
    pub(crate) mod p2p_spectator_session;
    pub(crate) mod player_registry;
    pub(crate) mod sync_test_session;
}
pub(crate) mod network {
    pub(crate) mod codec;
    pub(crate) mod compression;
    pub(crate) mod messages;
    pub(crate) mod network_stats;
    pub(crate) mod protocol;
    pub(crate) mod udp_socket;
}

/// A specialized `Result` type for Palisade operations.
///
/// The alias carries an optional second type parameter so signatures with a
/// different error type can still use it.
pub type PalisadeResult<T, E = PalisadeError> = std::result::Result<T, E>;

// #############
// # CONSTANTS #
// #############

/// Internally, -1 represents "no frame" / an invalid frame.
pub const NULL_FRAME: i32 = -1;

/// The maximum number of frames Palisade will predict ahead of the last
/// confirmed frame before stalling, unless overridden through
/// [`SessionBuilder::with_max_prediction_window`].
pub const MAX_PREDICTION_FRAMES: usize = 8;

/// A frame is a single step of deterministic game execution.
///
/// Frames start at 0 and increment sequentially. The sentinel [`Frame::NULL`]
/// (equal to [`NULL_FRAME`]) denotes "no frame". The newtype supports signed
/// arithmetic with integers and signed distance between two frames.
///
/// ```
/// use palisade::Frame;
///
/// let frame = Frame::new(10);
/// assert!(frame.is_valid());
/// assert_eq!(frame + 1, Frame::new(11));
/// assert_eq!(frame - Frame::new(4), 6);
/// assert!(Frame::NULL.is_null());
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Frame(i32);

impl Frame {
    /// The null frame, representing "no frame".
    pub const NULL: Self = Self(NULL_FRAME);

    /// Creates a new `Frame`. The value is not validated; use
    /// [`is_valid`](Self::is_valid) to check for non-negative frames.
    #[inline]
    #[must_use]
    pub const fn new(frame: i32) -> Self {
        Self(frame)
    }

    /// Returns the underlying `i32`.
    #[inline]
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }

    /// Returns `true` if this frame equals [`Frame::NULL`].
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == NULL_FRAME
    }

    /// Returns `true` if this frame is non-negative.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }

    /// Adds a value to this frame, saturating at the numeric bounds.
    #[inline]
    #[must_use]
    pub const fn saturating_add(self, rhs: i32) -> Self {
        Self(self.0.saturating_add(rhs))
    }

    /// Subtracts a value from this frame, saturating at the numeric bounds.
    #[inline]
    #[must_use]
    pub const fn saturating_sub(self, rhs: i32) -> Self {
        Self(self.0.saturating_sub(rhs))
    }

    /// Maps this frame to an index into a ring buffer of the given size.
    ///
    /// Returns `None` for null/negative frames or a zero-sized buffer.
    #[inline]
    #[must_use]
    pub const fn ring_index(self, size: usize) -> Option<usize> {
        if self.0 >= 0 && size > 0 {
            Some(self.0 as usize % size)
        } else {
            None
        }
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "NULL_FRAME")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl std::ops::Add<i32> for Frame {
    type Output = Self;

    #[inline]
    fn add(self, rhs: i32) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl std::ops::AddAssign<i32> for Frame {
    #[inline]
    fn add_assign(&mut self, rhs: i32) {
        self.0 += rhs;
    }
}

impl std::ops::Sub<i32> for Frame {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: i32) -> Self::Output {
        Self(self.0 - rhs)
    }
}

impl std::ops::SubAssign<i32> for Frame {
    #[inline]
    fn sub_assign(&mut self, rhs: i32) {
        self.0 -= rhs;
    }
}

/// Signed distance between two frames.
impl std::ops::Sub<Self> for Frame {
    type Output = i32;

    #[inline]
    fn sub(self, rhs: Self) -> Self::Output {
        self.0 - rhs.0
    }
}

impl From<i32> for Frame {
    #[inline]
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl From<Frame> for i32 {
    #[inline]
    fn from(frame: Frame) -> Self {
        frame.0
    }
}

impl PartialEq<i32> for Frame {
    #[inline]
    fn eq(&self, other: &i32) -> bool {
        self.0 == *other
    }
}

impl PartialOrd<i32> for Frame {
    #[inline]
    fn partial_cmp(&self, other: &i32) -> Option<std::cmp::Ordering> {
        self.0.partial_cmp(other)
    }
}

/// Identifies a player slot within a session.
///
/// Handles `0..num_players` refer to active players; handles at or above
/// `num_players` refer to spectators. Handles are contiguous and stable for
/// the life of the session.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct PlayerHandle(usize);

impl PlayerHandle {
    /// Creates a new `PlayerHandle`. Validity against a specific session is
    /// checked by the session itself.
    #[inline]
    #[must_use]
    pub const fn new(handle: usize) -> Self {
        Self(handle)
    }

    /// Returns the underlying `usize`.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns `true` if this handle refers to an active player of a session
    /// with `num_players` players.
    #[inline]
    #[must_use]
    pub const fn is_player_for(self, num_players: usize) -> bool {
        self.0 < num_players
    }
}

impl std::fmt::Display for PlayerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PlayerHandle({})", self.0)
    }
}

impl From<usize> for PlayerHandle {
    #[inline]
    fn from(value: usize) -> Self {
        Self(value)
    }
}

impl From<PlayerHandle> for usize {
    #[inline]
    fn from(handle: PlayerHandle) -> Self {
        handle.0
    }
}

// #############
// #   ENUMS   #
// #############

/// Desync detection compares game state checksums between peers.
///
/// Defaults to [`DesyncDetection::Off`]. When on, the checksum of every
/// `interval`-th confirmed frame is piggybacked onto outbound input messages
/// and compared by the receiver; a mismatch surfaces as
/// [`PalisadeEvent::DesyncDetected`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DesyncDetection {
    /// Compare checksums every `interval` confirmed frames.
    On {
        /// Number of frames between two checksum exchanges. An interval of 1
        /// compares every confirmed frame.
        interval: u32,
    },
    /// No checksum exchange. State divergence between peers goes undetected.
    #[default]
    Off,
}

/// The three kinds of session participants: local players, remote players
/// and spectators. Remote players and spectators carry the address their
/// datagrams come from.
#[derive(Debug, Default, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum PlayerType<A>
where
    A: Clone + PartialEq + Eq + Hash,
{
    /// The player plays on the local device.
    #[default]
    Local,
    /// The player plays on a remote device reachable under the given address.
    Remote(A),
    /// A remote participant that consumes confirmed inputs without
    /// contributing any.
    Spectator(A),
}

/// A session is always in one of two states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// The session is establishing connections to the remote clients.
    Synchronizing,
    /// All remote clients are synchronized; the session accepts and
    /// transmits player input.
    Running,
}

/// Tells the game how trustworthy each input handed out with
/// [`PalisadeRequest::AdvanceFrame`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputStatus {
    /// An authoritative input received from the owning player.
    Confirmed,
    /// A predicted input; the authoritative value has not arrived yet.
    Predicted,
    /// The owning player disconnected at or before this frame; the input is
    /// a blank.
    Disconnected,
}

/// Per-frame player inputs handed to the game, ordered by player handle.
///
/// Backed by a [`SmallVec`] so sessions with up to 4 players never touch the
/// heap on the hot path.
pub type InputVec<I> = SmallVec<[(I, InputStatus); 4]>;

/// The requests returned from a single `advance_frame` call.
///
/// The common case (one advance plus one save) stays stack-allocated; a
/// rollback spills to the heap, which is negligible next to re-simulation.
pub type RequestVec<T> = SmallVec<[PalisadeRequest<T>; 4]>;

/// Notifications from the session. Consuming them is up to the host.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PalisadeEvent<T>
where
    T: Config,
{
    /// Handshake progress with a remote endpoint: `count` of `total`
    /// roundtrips have completed.
    Synchronizing {
        /// The address of the endpoint.
        addr: T::Address,
        /// Roundtrips required in total.
        total: u32,
        /// Roundtrips completed so far.
        count: u32,
    },
    /// The handshake with this endpoint completed.
    Synchronized {
        /// The address of the endpoint.
        addr: T::Address,
    },
    /// The handshake with this endpoint exhausted its retry budget. The
    /// endpoint is treated as disconnected.
    SynchronizationFailed {
        /// The address of the endpoint.
        addr: T::Address,
    },
    /// The remote client disconnected (or timed out).
    Disconnected {
        /// The address of the endpoint.
        addr: T::Address,
    },
    /// No packets have arrived from this endpoint for a while; it will be
    /// disconnected in `disconnect_timeout` ms unless traffic resumes.
    NetworkInterrupted {
        /// The address of the endpoint.
        addr: T::Address,
        /// Milliseconds until the hard disconnect.
        disconnect_timeout: u128,
    },
    /// Packets resumed after a [`PalisadeEvent::NetworkInterrupted`].
    NetworkResumed {
        /// The address of the endpoint.
        addr: T::Address,
    },
    /// The local client is running ahead of its peers; consider skipping
    /// `skip_frames` frames to let them catch up.
    WaitRecommendation {
        /// Recommended number of frames to skip.
        skip_frames: u32,
    },
    /// Local and remote checksums differ for the same confirmed frame. The
    /// session keeps running; whether to abort is the host's policy.
    DesyncDetected {
        /// The confirmed frame the checksums belong to.
        frame: Frame,
        /// The locally computed checksum.
        local_checksum: u64,
        /// The checksum reported by the remote endpoint.
        remote_checksum: u64,
        /// The address of the endpoint.
        addr: T::Address,
    },
}

/// Requests the session hands back to the game. Fulfilling them is mandatory,
/// **in the exact order they are returned** — the save/load/advance sequence
/// encodes the rollback itself, and reordering it desyncs the simulation.
#[derive(Debug, Clone)]
pub enum PalisadeRequest<T>
where
    T: Config,
{
    /// Serialize the current game state into `cell` (and ideally a checksum
    /// of it). `frame` is a sanity check: the state being saved belongs to
    /// that frame.
    SaveGameState {
        /// Store your state with `cell.save(...)`.
        cell: GameStateCell<T::State>,
        /// The frame the saved state belongs to.
        frame: Frame,
    },
    /// Restore the game state previously saved in `cell`. Only issued during
    /// a rollback, and only for cells that were saved before.
    LoadGameState {
        /// Retrieve your state with `cell.load()`.
        cell: GameStateCell<T::State>,
        /// The frame the loaded state belongs to.
        frame: Frame,
    },
    /// Step the simulation deterministically with the given inputs, one entry
    /// per player, ordered by handle.
    AdvanceFrame {
        /// The input and its status for every player.
        inputs: InputVec<T::Input>,
    },
}

impl<T: Config> std::fmt::Display for PalisadeRequest<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SaveGameState { frame, .. } => write!(f, "SaveGameState(frame={frame})"),
            Self::LoadGameState { frame, .. } => write!(f, "LoadGameState(frame={frame})"),
            Self::AdvanceFrame { inputs } => write!(f, "AdvanceFrame(inputs={})", inputs.len()),
        }
    }
}

// #############
// #  TRAITS   #
// #############

/// Compile-time parameterization for sessions.
///
/// Implement this on a marker struct to bundle the generic types a session
/// needs. Sessions are monomorphized over the config, so rollback never pays
/// for dynamic dispatch.
///
/// ```
/// use palisade::Config;
/// use serde::{Deserialize, Serialize};
/// use std::net::SocketAddr;
///
/// #[derive(Copy, Clone, PartialEq, Default, Serialize, Deserialize)]
/// struct GameInput {
///     buttons: u16,
/// }
///
/// #[derive(Clone)]
/// struct GameState {
///     frame: i32,
/// }
///
/// struct GameConfig;
///
/// impl Config for GameConfig {
///     type Input = GameInput;
///     type State = GameState;
///     type Address = SocketAddr;
/// }
/// ```
pub trait Config: 'static {
    /// The input type of the session; the only game data that crosses the
    /// network. Must serialize to the same fixed number of bytes for every
    /// value, and [`Default`] represents "no input" (used for disconnected
    /// players and blank predictions).
    type Input: Copy + Clone + PartialEq + Default + Serialize + DeserializeOwned;

    /// The save-state type of the session.
    type State: Clone;

    /// The address type identifying remote clients.
    type Address: Clone + PartialEq + Eq + PartialOrd + Ord + Hash + Debug;
}

/// The transport Palisade runs on.
///
/// Messages must be sent in a UDP-like fashion: unordered, unreliable,
/// non-blocking. Palisade's internal protocol takes care of retransmission
/// and replay suppression on top. [`UdpNonBlockingSocket`] is a ready-made
/// implementation over `std::net::UdpSocket`.
pub trait NonBlockingSocket<A>
where
    A: Clone + PartialEq + Eq + Hash,
{
    /// Sends a [`Message`] to the given address. Best-effort; failures are
    /// the implementation's business (Palisade retries at the protocol
    /// level).
    fn send_to(&mut self, msg: &Message, addr: &A);

    /// Returns every message that arrived since the last call, together with
    /// the address it came from. Must not block.
    fn receive_all_messages(&mut self) -> Vec<(A, Message)>;
}

// #########
// # TESTS #
// #########
