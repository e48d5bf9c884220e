//! The synchronization layer behind every session: per-player input queues,
//! the saved-state ring, and the frame cursors that drive rollback.
//!
//! Frame labelling convention: `SaveGameState(F)` holds the simulation state
//! *at* frame F, i.e. after the inputs of all frames `< F` have been applied.
//! Advancing applies the inputs of the current frame and moves to the next,
//! which is then saved. Rolling back a misprediction at frame F therefore
//! loads the state labelled F and re-applies inputs from F onwards.

mod game_state_cell;
mod saved_states;

pub use game_state_cell::GameStateCell;
pub(crate) use saved_states::SavedStates;

use tracing::warn;

use crate::frame_info::PlayerInput;
use crate::input_queue::InputQueue;
use crate::network::messages::ConnectionStatus;
use crate::{
    Config, Frame, InputStatus, InputVec, PalisadeError, PalisadeRequest, PlayerHandle,
};

/// Owns the input queues and the snapshot ring for one session and keeps the
/// three frame cursors (`current`, `last confirmed`, `last saved`) coherent.
pub(crate) struct SyncLayer<T>
where
    T: Config,
{
    num_players: usize,
    max_prediction: usize,
    saved_states: SavedStates<T::State>,
    last_confirmed_frame: Frame,
    last_saved_frame: Frame,
    current_frame: Frame,
    input_queues: Vec<InputQueue<T>>,
}

impl<T: Config> SyncLayer<T> {
    pub(crate) fn new(num_players: usize, max_prediction: usize) -> Self {
        let input_queues = (0..num_players).map(|_| InputQueue::new()).collect();
        Self {
            num_players,
            max_prediction,
            last_confirmed_frame: Frame::NULL,
            last_saved_frame: Frame::NULL,
            current_frame: Frame::new(0),
            saved_states: SavedStates::new(max_prediction),
            input_queues,
        }
    }

    pub(crate) fn current_frame(&self) -> Frame {
        self.current_frame
    }

    pub(crate) fn last_confirmed_frame(&self) -> Frame {
        self.last_confirmed_frame
    }

    pub(crate) fn last_saved_frame(&self) -> Frame {
        self.last_saved_frame
    }

    pub(crate) fn advance_frame(&mut self) {
        self.current_frame += 1;
    }

    /// Produces the save request for the current frame.
    pub(crate) fn save_current_state(&mut self) -> PalisadeRequest<T> {
        self.last_saved_frame = self.current_frame;
        let cell = match self.saved_states.get_cell(self.current_frame) {
            Ok(cell) => cell,
            Err(_) => {
                // current_frame starts at 0 and only increments, so this is
                // unreachable; hand out a detached cell rather than panic
                warn!(
                    frame = self.current_frame.as_i32(),
                    "no saved-state cell for current frame"
                );
                GameStateCell::default()
            },
        };
        PalisadeRequest::SaveGameState {
            cell,
            frame: self.current_frame,
        }
    }

    /// Produces the load request that rewinds the simulation to
    /// `frame_to_load` and moves the current frame back accordingly.
    pub(crate) fn load_frame(
        &mut self,
        frame_to_load: Frame,
    ) -> Result<PalisadeRequest<T>, PalisadeError> {
        if frame_to_load.is_null() || frame_to_load >= self.current_frame {
            return Err(PalisadeError::InvalidFrame {
                frame: frame_to_load,
                reason: format!(
                    "a rollback must target a frame before the current one ({})",
                    self.current_frame
                ),
            });
        }
        // the ring holds max_prediction + 2 states, so the oldest loadable
        // frame is one beyond the prediction window
        if frame_to_load < self.current_frame - (self.max_prediction as i32 + 1) {
            return Err(PalisadeError::InvalidFrame {
                frame: frame_to_load,
                reason: format!(
                    "outside the prediction window (current: {}, max prediction: {})",
                    self.current_frame, self.max_prediction
                ),
            });
        }

        let cell = self.saved_states.get_cell(frame_to_load)?;
        if cell.frame() != frame_to_load {
            return Err(PalisadeError::InvalidFrame {
                frame: frame_to_load,
                reason: format!("saved state holds frame {} instead", cell.frame()),
            });
        }

        self.current_frame = frame_to_load;
        self.last_saved_frame = frame_to_load;

        Ok(PalisadeRequest::LoadGameState {
            cell,
            frame: frame_to_load,
        })
    }

    pub(crate) fn set_frame_delay(
        &mut self,
        player_handle: PlayerHandle,
        delay: usize,
    ) -> Result<(), PalisadeError> {
        let queue = self
            .input_queues
            .get_mut(player_handle.as_usize())
            .ok_or(PalisadeError::InvalidPlayerHandle {
                handle: player_handle,
                max_handle: PlayerHandle::new(self.num_players.saturating_sub(1)),
            })?;
        queue.set_frame_delay(delay);
        Ok(())
    }

    pub(crate) fn reset_prediction(&mut self, frame: Frame) {
        for queue in &mut self.input_queues {
            queue.reset_prediction(frame);
        }
    }

    /// Adds local input, accounting for frame delay. Returns the frame the
    /// input landed on, or [`Frame::NULL`] if it was dropped (stalled tick or
    /// wrong frame).
    pub(crate) fn add_local_input(
        &mut self,
        player_handle: PlayerHandle,
        input: PlayerInput<T::Input>,
    ) -> Frame {
        if input.frame != self.current_frame {
            warn!(
                input_frame = input.frame.as_i32(),
                current_frame = self.current_frame.as_i32(),
                "local input does not belong to the current frame"
            );
            return Frame::NULL;
        }
        self.input_queues
            .get_mut(player_handle.as_usize())
            .map_or(Frame::NULL, |queue| queue.add_input(input))
    }

    /// Adds an authoritative remote input. Remote inputs were validated on
    /// the sending device, so no frame check is needed here.
    pub(crate) fn add_remote_input(
        &mut self,
        player_handle: PlayerHandle,
        input: PlayerInput<T::Input>,
    ) {
        if let Some(queue) = self.input_queues.get_mut(player_handle.as_usize()) {
            queue.add_input(input);
        }
    }

    /// Collects the inputs of every player for the current frame, predicting
    /// where authoritative inputs are missing and substituting blanks for
    /// players disconnected before this frame.
    pub(crate) fn synchronized_inputs(
        &mut self,
        connect_status: &[ConnectionStatus],
    ) -> InputVec<T::Input> {
        let mut inputs = InputVec::with_capacity(connect_status.len());
        for (i, status) in connect_status.iter().enumerate() {
            if status.disconnected && status.last_frame < self.current_frame {
                inputs.push((T::Input::default(), InputStatus::Disconnected));
            } else if let Some(queue) = self.input_queues.get_mut(i) {
                inputs.push(queue.input(self.current_frame));
            }
        }
        inputs
    }

    /// Collects the authoritative inputs of every player for the given frame.
    /// Fails if any connected player's input for the frame is not confirmed.
    pub(crate) fn confirmed_inputs(
        &self,
        frame: Frame,
        connect_status: &[ConnectionStatus],
    ) -> Result<Vec<PlayerInput<T::Input>>, PalisadeError> {
        let mut inputs = Vec::with_capacity(connect_status.len());
        for (i, status) in connect_status.iter().enumerate() {
            if status.disconnected && status.last_frame < frame {
                inputs.push(PlayerInput::blank(Frame::NULL));
            } else if let Some(queue) = self.input_queues.get(i) {
                inputs.push(queue.confirmed_input(frame)?);
            }
        }
        Ok(inputs)
    }

    /// Raises the last confirmed frame and discards the input history below
    /// it. The frame is clamped so that nothing still needed for a pending
    /// rollback is thrown away.
    pub(crate) fn set_last_confirmed_frame(&mut self, mut frame: Frame) {
        let mut first_incorrect = Frame::NULL;
        for queue in &self.input_queues {
            let incorrect = queue.first_incorrect_frame();
            if !incorrect.is_null() && (first_incorrect.is_null() || incorrect < first_incorrect)
            {
                first_incorrect = incorrect;
            }
        }
        if !first_incorrect.is_null() {
            frame = std::cmp::min(frame, first_incorrect);
        }
        frame = std::cmp::min(frame, self.current_frame);

        self.last_confirmed_frame = frame;
        if self.last_confirmed_frame > 0 {
            for queue in &mut self.input_queues {
                queue.discard_confirmed_frames(frame - 1);
            }
        }
    }

    /// The earliest frame any input queue has flagged as mispredicted, seeded
    /// with an externally known incorrect frame (e.g. a disconnect).
    pub(crate) fn check_simulation_consistency(&self, mut first_incorrect: Frame) -> Frame {
        for queue in &self.input_queues {
            let incorrect = queue.first_incorrect_frame();
            if !incorrect.is_null() && (first_incorrect.is_null() || incorrect < first_incorrect)
            {
                first_incorrect = incorrect;
            }
        }
        first_incorrect
    }

    /// The saved-state cell for the given frame, if the ring still holds it.
    pub(crate) fn saved_state_by_frame(&self, frame: Frame) -> Option<GameStateCell<T::State>> {
        let cell = self.saved_states.get_cell(frame).ok()?;
        (cell.frame() == frame).then_some(cell)
    }
}
