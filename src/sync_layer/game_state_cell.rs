use std::sync::Arc;

use parking_lot::Mutex;

use crate::frame_info::GameState;
use crate::Frame;

/// A cell the game saves its state into and loads it back from.
///
/// Cells are handed out with [`PalisadeRequest::SaveGameState`] and
/// [`PalisadeRequest::LoadGameState`]. They are cheap to clone (the state is
/// shared behind an `Arc`) but must not be retained beyond the request that
/// delivered them — the engine reuses cells for later frames.
///
/// [`PalisadeRequest::SaveGameState`]: crate::PalisadeRequest::SaveGameState
/// [`PalisadeRequest::LoadGameState`]: crate::PalisadeRequest::LoadGameState
pub struct GameStateCell<S>(pub(crate) Arc<Mutex<GameState<S>>>);

impl<S> GameStateCell<S> {
    /// Saves the state (and optionally its checksum) for the given frame,
    /// replacing whatever the cell held before.
    pub fn save(&self, frame: Frame, data: Option<S>, checksum: Option<u64>) {
        let mut inner = self.0.lock();
        inner.frame = frame;
        inner.data = data;
        inner.checksum = checksum;
    }

    /// The frame the cell currently holds a state for, or [`Frame::NULL`].
    #[must_use]
    pub fn frame(&self) -> Frame {
        self.0.lock().frame
    }

    /// The checksum stored with the current state, if any.
    #[must_use]
    pub fn checksum(&self) -> Option<u64> {
        self.0.lock().checksum
    }
}

impl<S: Clone> GameStateCell<S> {
    /// Returns a clone of the stored state, or `None` if the cell is empty.
    #[must_use]
    pub fn load(&self) -> Option<S> {
        self.0.lock().data.clone()
    }
}

impl<S> Default for GameStateCell<S> {
    fn default() -> Self {
        Self(Arc::new(Mutex::new(GameState::default())))
    }
}

impl<S> Clone for GameStateCell<S> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<S> std::fmt::Debug for GameStateCell<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.0.lock();
        f.debug_struct("GameStateCell")
            .field("frame", &inner.frame)
            .field("has_data", &inner.data.is_some())
            .field("checksum", &inner.checksum)
            .finish()
    }
}
