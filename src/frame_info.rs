use crate::Frame;

/// A saved copy of the game state for a single frame, together with an
/// optional checksum used for desync detection and synctest verification.
#[derive(Debug, Clone)]
pub(crate) struct GameState<S> {
    /// The frame this state belongs to.
    pub frame: Frame,
    /// The state itself, if the host has saved one.
    pub data: Option<S>,
    /// A checksum of the state, if the host computed one.
    pub checksum: Option<u64>,
}

impl<S> Default for GameState<S> {
    fn default() -> Self {
        Self {
            frame: Frame::NULL,
            data: None,
            checksum: None,
        }
    }
}

/// The input of a single player for a single frame.
#[derive(Debug, Copy, Clone, PartialEq)]
pub(crate) struct PlayerInput<I>
where
    I: Copy + Clone + PartialEq,
{
    /// The frame this input belongs to. [`Frame::NULL`] marks an invalid or
    /// dropped input.
    pub frame: Frame,
    /// The input value supplied by the user.
    pub input: I,
}

impl<I: Copy + Clone + PartialEq + Default> PlayerInput<I> {
    pub(crate) fn new(frame: Frame, input: I) -> Self {
        Self { frame, input }
    }

    /// The all-default ("blank") input at the given frame.
    pub(crate) fn blank(frame: Frame) -> Self {
        Self {
            frame,
            input: I::default(),
        }
    }

    /// Compares two inputs, optionally ignoring the frame number.
    pub(crate) fn equal(&self, other: &Self, input_only: bool) -> bool {
        (input_only || self.frame == other.frame) && self.input == other.input
    }
}
