use std::collections::BTreeMap;

use crate::network::protocol::UdpProtocol;
use crate::{Config, PlayerHandle, PlayerType};

/// Tracks every participant of a session: the handle → type mapping plus the
/// protocol endpoints for remote players and spectators, keyed by address.
pub(crate) struct PlayerRegistry<T>
where
    T: Config,
{
    pub handles: BTreeMap<PlayerHandle, PlayerType<T::Address>>,
    pub remotes: BTreeMap<T::Address, UdpProtocol<T>>,
    pub spectators: BTreeMap<T::Address, UdpProtocol<T>>,
}

impl<T: Config> PlayerRegistry<T> {
    pub(crate) fn new() -> Self {
        Self {
            handles: BTreeMap::new(),
            remotes: BTreeMap::new(),
            spectators: BTreeMap::new(),
        }
    }

    pub(crate) fn local_player_handles(&self) -> Vec<PlayerHandle> {
        self.handles
            .iter()
            .filter_map(|(handle, player_type)| match player_type {
                PlayerType::Local => Some(*handle),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn remote_player_handles(&self) -> Vec<PlayerHandle> {
        self.handles
            .iter()
            .filter_map(|(handle, player_type)| match player_type {
                PlayerType::Remote(_) => Some(*handle),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn spectator_handles(&self) -> Vec<PlayerHandle> {
        self.handles
            .iter()
            .filter_map(|(handle, player_type)| match player_type {
                PlayerType::Spectator(_) => Some(*handle),
                _ => None,
            })
            .collect()
    }

    /// Number of active players (local + remote, spectators excluded).
    pub(crate) fn num_players(&self) -> usize {
        self.handles
            .values()
            .filter(|player_type| matches!(player_type, PlayerType::Local | PlayerType::Remote(_)))
            .count()
    }

    pub(crate) fn num_spectators(&self) -> usize {
        self.handles
            .values()
            .filter(|player_type| matches!(player_type, PlayerType::Spectator(_)))
            .count()
    }

    /// All handles hosted at the given address (remote players and
    /// spectators; local players have no address).
    pub(crate) fn handles_for_address(&self, addr: &T::Address) -> Vec<PlayerHandle> {
        self.handles
            .iter()
            .filter_map(|(handle, player_type)| match player_type {
                PlayerType::Remote(a) | PlayerType::Spectator(a) if a == addr => Some(*handle),
                _ => None,
            })
            .collect()
    }
}

impl<T: Config> Default for PlayerRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}
