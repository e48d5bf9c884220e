use web_time::Duration;

use crate::network::protocol::{ProtocolOptions, UdpProtocol};
use crate::sessions::p2p_session::P2PSession;
use crate::sessions::p2p_spectator_session::{SpectatorSession, SPECTATOR_BUFFER_SIZE};
use crate::sessions::player_registry::PlayerRegistry;
use crate::sessions::sync_test_session::SyncTestSession;
use crate::{
    Config, DesyncDetection, NonBlockingSocket, PalisadeError, PlayerHandle, PlayerType,
    MAX_PREDICTION_FRAMES,
};

const MIN_PLAYERS: usize = 2;
const MAX_PLAYERS: usize = 4;

const DEFAULT_INPUT_DELAY: usize = 2;
const DEFAULT_FPS: usize = 60;
const DEFAULT_CHECK_DISTANCE: usize = 2;
/// Must stay below [`SPECTATOR_BUFFER_SIZE`]: once a spectator lags further
/// than the buffer holds, the inputs it needs are gone and no catch-up speed
/// can save it.
const DEFAULT_MAX_FRAMES_BEHIND: usize = 30;
const DEFAULT_CATCHUP_SPEED: usize = 2;

/// Validated construction of the three session modes.
///
/// ```
/// # use palisade::{Config, SessionBuilder, PlayerType, PlayerHandle, UdpNonBlockingSocket};
/// # use serde::{Deserialize, Serialize};
/// # use std::net::SocketAddr;
/// # #[derive(Copy, Clone, PartialEq, Default, Serialize, Deserialize)]
/// # struct GameInput(u8);
/// # struct GameConfig;
/// # impl Config for GameConfig {
/// #     type Input = GameInput;
/// #     type State = u8;
/// #     type Address = SocketAddr;
/// # }
/// # fn build(remote_addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
/// let socket = UdpNonBlockingSocket::bind_to_port(7000)?;
/// let session = SessionBuilder::<GameConfig>::new()
///     .with_num_players(2)
///     .add_player(PlayerType::Local, PlayerHandle::new(0))?
///     .add_player(PlayerType::Remote(remote_addr), PlayerHandle::new(1))?
///     .start_p2p_session(socket)?;
/// # Ok(())
/// # }
/// ```
pub struct SessionBuilder<T>
where
    T: Config,
{
    num_players: usize,
    max_prediction: usize,
    input_delay: usize,
    fps: usize,
    disconnect_timeout: Duration,
    disconnect_notify_start: Duration,
    desync_detection: DesyncDetection,
    check_distance: usize,
    max_frames_behind: usize,
    catchup_speed: usize,
    players: Vec<(PlayerType<T::Address>, PlayerHandle)>,
}

impl<T: Config> Default for SessionBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Config> SessionBuilder<T> {
    /// Creates a builder with the default configuration: 2 players, an input
    /// delay of 2 frames, a prediction window of [`MAX_PREDICTION_FRAMES`],
    /// 60 fps, desync detection off.
    #[must_use]
    pub fn new() -> Self {
        Self {
            num_players: MIN_PLAYERS,
            max_prediction: MAX_PREDICTION_FRAMES,
            input_delay: DEFAULT_INPUT_DELAY,
            fps: DEFAULT_FPS,
            disconnect_timeout: ProtocolOptions::default().disconnect_timeout,
            disconnect_notify_start: ProtocolOptions::default().disconnect_notify_start,
            desync_detection: DesyncDetection::default(),
            check_distance: DEFAULT_CHECK_DISTANCE,
            max_frames_behind: DEFAULT_MAX_FRAMES_BEHIND,
            catchup_speed: DEFAULT_CATCHUP_SPEED,
            players: Vec::new(),
        }
    }

    /// Registers a participant under the given handle. Players (local and
    /// remote) take the handles `0..num_players`; spectators take handles at
    /// or above `num_players`.
    ///
    /// # Errors
    /// [`PalisadeError::InvalidRequest`] for handles outside the valid range
    /// for the player type, or handles registered twice.
    pub fn add_player(
        mut self,
        player_type: PlayerType<T::Address>,
        player_handle: PlayerHandle,
    ) -> Result<Self, PalisadeError> {
        match player_type {
            PlayerType::Local | PlayerType::Remote(_) => {
                if !player_handle.is_player_for(self.num_players) {
                    return Err(PalisadeError::InvalidRequest {
                        info: format!(
                            "player handles must be below the player count ({})",
                            self.num_players
                        ),
                    });
                }
            },
            PlayerType::Spectator(_) => {
                if player_handle.is_player_for(self.num_players) {
                    return Err(PalisadeError::InvalidRequest {
                        info: format!(
                            "spectator handles must be at or above the player count ({})",
                            self.num_players
                        ),
                    });
                }
            },
        }
        if self
            .players
            .iter()
            .any(|(_, existing)| *existing == player_handle)
        {
            return Err(PalisadeError::InvalidRequest {
                info: format!("handle {player_handle} was added twice"),
            });
        }
        self.players.push((player_type, player_handle));
        Ok(self)
    }

    /// Sets the number of players. Must be called before
    /// [`add_player`](Self::add_player); valid range is 2 to 4.
    #[must_use]
    pub fn with_num_players(mut self, num_players: usize) -> Self {
        self.num_players = num_players;
        self
    }

    /// Sets the maximum number of frames the session predicts ahead of the
    /// last confirmed frame (and therefore the maximum rollback depth).
    #[must_use]
    pub fn with_max_prediction_window(mut self, window: usize) -> Self {
        self.max_prediction = window;
        self
    }

    /// Sets the local input delay in frames. A small delay hides network
    /// latency by shortening predictions at the cost of delayed reactions.
    #[must_use]
    pub fn with_input_delay(mut self, delay: usize) -> Self {
        self.input_delay = delay;
        self
    }

    /// Sets the simulation tick rate, used to convert latency into frames.
    #[must_use]
    pub fn with_fps(mut self, fps: usize) -> Self {
        self.fps = fps;
        self
    }

    /// Sets how long a peer may stay silent before it is disconnected.
    #[must_use]
    pub fn with_disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    /// Sets how long a peer may stay silent before
    /// [`PalisadeEvent::NetworkInterrupted`] warns about it.
    ///
    /// [`PalisadeEvent::NetworkInterrupted`]: crate::PalisadeEvent::NetworkInterrupted
    #[must_use]
    pub fn with_disconnect_notify_delay(mut self, notify_delay: Duration) -> Self {
        self.disconnect_notify_start = notify_delay;
        self
    }

    /// Enables or disables checksum-based desync detection.
    #[must_use]
    pub fn with_desync_detection_mode(mut self, desync_detection: DesyncDetection) -> Self {
        self.desync_detection = desync_detection;
        self
    }

    /// Sets the verification rollback depth of a
    /// [`SyncTestSession`](crate::SyncTestSession).
    #[must_use]
    pub fn with_check_distance(mut self, check_distance: usize) -> Self {
        self.check_distance = check_distance;
        self
    }

    /// Sets how far a spectator may fall behind the host before it speeds
    /// up. Must stay below the spectator's input buffer size (60 frames), or
    /// the inputs needed for catching up would already be overwritten.
    #[must_use]
    pub fn with_max_frames_behind(mut self, max_frames_behind: usize) -> Self {
        self.max_frames_behind = max_frames_behind;
        self
    }

    /// Sets how many frames per tick a spectator advances while catching up.
    #[must_use]
    pub fn with_catchup_speed(mut self, catchup_speed: usize) -> Self {
        self.catchup_speed = catchup_speed;
        self
    }

    /// Builds a peer-to-peer session from the registered players.
    ///
    /// # Errors
    /// [`PalisadeError::InvalidRequest`] if the configuration is
    /// inconsistent: player count outside 2–4, missing or duplicate handles,
    /// no local player, remote players sharing an address, or a zero fps.
    pub fn start_p2p_session(
        self,
        socket: impl NonBlockingSocket<T::Address> + 'static,
    ) -> Result<P2PSession<T>, PalisadeError> {
        self.validate_common()?;

        let mut registry = PlayerRegistry::new();
        for (player_type, handle) in &self.players {
            registry.handles.insert(*handle, player_type.clone());
        }

        // every handle in 0..num_players must be taken by a player
        for handle_index in 0..self.num_players {
            match registry.handles.get(&PlayerHandle::new(handle_index)) {
                Some(PlayerType::Local | PlayerType::Remote(_)) => (),
                _ => {
                    return Err(PalisadeError::InvalidRequest {
                        info: format!(
                            "handles must be contiguous: no player was added for handle {handle_index}"
                        ),
                    });
                },
            }
        }
        if registry.local_player_handles().is_empty() {
            return Err(PalisadeError::InvalidRequest {
                info: "a p2p session needs at least one local player".to_owned(),
            });
        }
        debug_assert_eq!(registry.num_players(), self.num_players);
        let remote_addrs: Vec<_> = self
            .players
            .iter()
            .filter_map(|(player_type, _)| match player_type {
                PlayerType::Remote(addr) => Some(addr),
                _ => None,
            })
            .collect();
        for (i, addr) in remote_addrs.iter().enumerate() {
            if remote_addrs[i + 1..].contains(addr) {
                return Err(PalisadeError::InvalidRequest {
                    info: "every remote player needs a distinct address".to_owned(),
                });
            }
        }

        let options = self.protocol_options();
        let local_players = registry.local_player_handles().len();

        for (player_type, handle) in &self.players {
            match player_type {
                PlayerType::Remote(addr) => {
                    let mut endpoint = UdpProtocol::new(
                        vec![*handle],
                        addr.clone(),
                        self.num_players,
                        local_players,
                        self.max_prediction,
                        self.fps,
                        options,
                    )?;
                    endpoint.synchronize();
                    registry.remotes.insert(addr.clone(), endpoint);
                },
                PlayerType::Spectator(addr) => {
                    let mut endpoint = UdpProtocol::new(
                        (0..self.num_players).map(PlayerHandle::new).collect(),
                        addr.clone(),
                        self.num_players,
                        self.num_players,
                        self.max_prediction,
                        self.fps,
                        options,
                    )?;
                    endpoint.synchronize();
                    registry.spectators.insert(addr.clone(), endpoint);
                },
                PlayerType::Local => (),
            }
        }

        Ok(P2PSession::new(
            self.num_players,
            self.max_prediction,
            Box::new(socket),
            registry,
            self.input_delay,
            self.desync_detection,
        ))
    }

    /// Builds a spectator session that replicates the match hosted at
    /// `host_addr`.
    ///
    /// # Errors
    /// [`PalisadeError::InvalidRequest`] for a player count outside 2–4, a
    /// zero fps, a zero catchup speed, or a `max_frames_behind` at or above
    /// the input buffer size (a spectator that far behind has already lost
    /// the inputs it would need to catch up).
    pub fn start_spectator_session(
        self,
        host_addr: T::Address,
        socket: impl NonBlockingSocket<T::Address> + 'static,
    ) -> Result<SpectatorSession<T>, PalisadeError> {
        self.validate_common()?;
        if self.catchup_speed == 0 {
            return Err(PalisadeError::InvalidRequest {
                info: "the catchup speed must be at least 1".to_owned(),
            });
        }
        if self.max_frames_behind >= SPECTATOR_BUFFER_SIZE {
            return Err(PalisadeError::InvalidRequest {
                info: format!(
                    "max_frames_behind ({}) must stay below the input buffer size ({})",
                    self.max_frames_behind, SPECTATOR_BUFFER_SIZE
                ),
            });
        }

        let mut host = UdpProtocol::new(
            (0..self.num_players).map(PlayerHandle::new).collect(),
            host_addr,
            self.num_players,
            self.num_players,
            self.max_prediction,
            self.fps,
            self.protocol_options(),
        )?;
        host.synchronize();

        Ok(SpectatorSession::new(
            self.num_players,
            Box::new(socket),
            host,
            self.max_frames_behind,
            self.catchup_speed,
        ))
    }

    /// Builds a single-process sync test session; every player is local.
    ///
    /// # Errors
    /// [`PalisadeError::InvalidRequest`] if the check distance exceeds the
    /// prediction window or the player count is outside 2–4.
    pub fn start_synctest_session(self) -> Result<SyncTestSession<T>, PalisadeError> {
        self.validate_common()?;
        if self.check_distance > self.max_prediction {
            return Err(PalisadeError::InvalidRequest {
                info: format!(
                    "the check distance ({}) cannot exceed the prediction window ({})",
                    self.check_distance, self.max_prediction
                ),
            });
        }
        Ok(SyncTestSession::new(
            self.num_players,
            self.max_prediction,
            self.check_distance,
            self.input_delay,
        ))
    }

    fn validate_common(&self) -> Result<(), PalisadeError> {
        if !(MIN_PLAYERS..=MAX_PLAYERS).contains(&self.num_players) {
            return Err(PalisadeError::InvalidRequest {
                info: format!(
                    "the player count must be between {MIN_PLAYERS} and {MAX_PLAYERS}, got {}",
                    self.num_players
                ),
            });
        }
        if self.fps == 0 {
            return Err(PalisadeError::InvalidRequest {
                info: "the fps must be at least 1".to_owned(),
            });
        }
        if self.max_prediction == 0 {
            return Err(PalisadeError::InvalidRequest {
                info: "the prediction window must be at least 1".to_owned(),
            });
        }
        Ok(())
    }

    fn protocol_options(&self) -> ProtocolOptions {
        ProtocolOptions {
            disconnect_timeout: self.disconnect_timeout,
            disconnect_notify_start: self.disconnect_notify_start,
            ..ProtocolOptions::default()
        }
    }
}
