use std::collections::BTreeMap;

use crate::frame_info::PlayerInput;
use crate::network::messages::ConnectionStatus;
use crate::sync_layer::SyncLayer;
use crate::{Config, Frame, PalisadeError, PalisadeRequest, PlayerHandle, RequestVec};

/// A single-process development tool that proves a simulation is
/// deterministic and rollback-safe.
///
/// Every player is local. Each tick the session advances one frame, then
/// rewinds `check_distance` frames and replays them with the recorded
/// inputs. The checksums the game stores while fulfilling the replayed
/// `SaveGameState` requests are compared against the ones recorded the first
/// time those frames ran; any difference means the simulation diverged under
/// identical inputs and [`PalisadeError::MismatchedChecksum`] is returned.
///
/// Frames saved without a checksum are skipped in the comparison.
pub struct SyncTestSession<T>
where
    T: Config,
{
    num_players: usize,
    check_distance: usize,
    sync_layer: SyncLayer<T>,
    dummy_connect_status: Vec<ConnectionStatus>,
    checksum_history: BTreeMap<Frame, u64>,
    local_inputs: BTreeMap<PlayerHandle, PlayerInput<T::Input>>,
}

impl<T: Config> SyncTestSession<T> {
    pub(crate) fn new(
        num_players: usize,
        max_prediction: usize,
        check_distance: usize,
        input_delay: usize,
    ) -> Self {
        let mut sync_layer = SyncLayer::new(num_players, max_prediction);
        for handle_index in 0..num_players {
            // handles are sequential, this cannot fail
            let _ = sync_layer.set_frame_delay(PlayerHandle::new(handle_index), input_delay);
        }
        Self {
            num_players,
            check_distance,
            sync_layer,
            dummy_connect_status: vec![ConnectionStatus::default(); num_players],
            checksum_history: BTreeMap::new(),
            local_inputs: BTreeMap::new(),
        }
    }

    /// Registers the input of a player for the current frame. In a sync
    /// test every player is local, so inputs for all of them are required
    /// before each [`advance_frame`](Self::advance_frame).
    ///
    /// # Errors
    /// [`PalisadeError::InvalidPlayerHandle`] for handles outside
    /// `0..num_players`.
    pub fn add_local_input(
        &mut self,
        player_handle: PlayerHandle,
        input: T::Input,
    ) -> Result<(), PalisadeError> {
        if !player_handle.is_player_for(self.num_players) {
            return Err(PalisadeError::InvalidPlayerHandle {
                handle: player_handle,
                max_handle: PlayerHandle::new(self.num_players - 1),
            });
        }
        self.local_inputs.insert(
            player_handle,
            PlayerInput::new(self.sync_layer.current_frame(), input),
        );
        Ok(())
    }

    /// Advances one frame and schedules the verification rollback: once more
    /// than `check_distance` frames have run, the returned requests rewind
    /// `check_distance` frames and replay them before the new frame is
    /// advanced. Checksums recorded from the previous tick's replay are
    /// verified first.
    ///
    /// # Errors
    /// - [`PalisadeError::MissingInput`] if any player's input was not
    ///   registered this tick.
    /// - [`PalisadeError::MismatchedChecksum`] if a replayed frame's
    ///   checksum differs from the original — the simulation is not
    ///   deterministic or not rollback-safe.
    pub fn advance_frame(&mut self) -> Result<RequestVec<T>, PalisadeError> {
        for handle_index in 0..self.num_players {
            let handle = PlayerHandle::new(handle_index);
            if !self.local_inputs.contains_key(&handle) {
                return Err(PalisadeError::MissingInput {
                    player_handle: handle,
                    frame: self.sync_layer.current_frame(),
                });
            }
        }

        let mut requests = RequestVec::new();
        let current_frame = self.sync_layer.current_frame();

        if current_frame == 0 && self.sync_layer.last_saved_frame().is_null() {
            requests.push(self.sync_layer.save_current_state());
        }

        // frames the previous tick replayed have been re-saved by now;
        // compare them against the first-run checksums before moving on
        self.verify_replayed_checksums(current_frame)?;
        self.record_checksum(current_frame);

        // rewind and replay the last check_distance frames
        if self.check_distance > 0 && current_frame > self.check_distance as i32 {
            let frame_to_load = current_frame - self.check_distance as i32;
            requests.push(self.sync_layer.load_frame(frame_to_load)?);
            for _ in 0..self.check_distance {
                let inputs = self
                    .sync_layer
                    .synchronized_inputs(&self.dummy_connect_status);
                self.sync_layer.advance_frame();
                requests.push(PalisadeRequest::AdvanceFrame { inputs });
                requests.push(self.sync_layer.save_current_state());
            }
            debug_assert_eq!(self.sync_layer.current_frame(), current_frame);
        }

        // feed this tick's inputs in and advance the new frame
        for (&handle, player_input) in &self.local_inputs {
            let actual_frame = self.sync_layer.add_local_input(handle, *player_input);
            if !actual_frame.is_null() {
                if let Some(status) = self.dummy_connect_status.get_mut(handle.as_usize()) {
                    status.last_frame = actual_frame;
                }
            }
        }
        self.local_inputs.clear();

        let inputs = self
            .sync_layer
            .synchronized_inputs(&self.dummy_connect_status);
        self.sync_layer.advance_frame();
        requests.push(PalisadeRequest::AdvanceFrame { inputs });
        requests.push(self.sync_layer.save_current_state());

        // keep the input history bounded; everything before the replay
        // window is done for good
        let keep_from = self.sync_layer.current_frame() - self.check_distance as i32;
        if keep_from > 0 {
            self.sync_layer.set_last_confirmed_frame(keep_from);
        }

        Ok(requests)
    }

    /// The frame the session will advance next.
    #[must_use]
    pub fn current_frame(&self) -> Frame {
        self.sync_layer.current_frame()
    }

    /// The number of players of this session.
    #[must_use]
    pub fn num_players(&self) -> usize {
        self.num_players
    }

    /// The verification rollback depth.
    #[must_use]
    pub fn check_distance(&self) -> usize {
        self.check_distance
    }

    /// Compares the cells of the frames replayed last tick against the
    /// recorded first-run checksums.
    fn verify_replayed_checksums(&mut self, current_frame: Frame) -> Result<(), PalisadeError> {
        if self.check_distance == 0 {
            return Ok(());
        }
        let mut mismatched_frames = Vec::new();
        let replay_start = current_frame - self.check_distance as i32;
        for offset in 0..self.check_distance as i32 {
            let frame = replay_start + offset;
            if !frame.is_valid() {
                continue;
            }
            let Some(&original) = self.checksum_history.get(&frame) else {
                continue;
            };
            let replayed = self
                .sync_layer
                .saved_state_by_frame(frame)
                .and_then(|cell| cell.checksum());
            if let Some(replayed) = replayed {
                if replayed != original {
                    mismatched_frames.push(frame);
                }
            }
        }
        if mismatched_frames.is_empty() {
            Ok(())
        } else {
            Err(PalisadeError::MismatchedChecksum {
                current_frame,
                mismatched_frames,
            })
        }
    }

    /// Records the first-run checksum of the given frame, once.
    fn record_checksum(&mut self, frame: Frame) {
        if !frame.is_valid() || self.checksum_history.contains_key(&frame) {
            return;
        }
        if let Some(checksum) = self
            .sync_layer
            .saved_state_by_frame(frame)
            .and_then(|cell| cell.checksum())
        {
            self.checksum_history.insert(frame, checksum);
        }
        // drop history that can never be compared again
        let horizon = frame - (self.check_distance as i32 + 1);
        if horizon > 0 {
            self.checksum_history.retain(|&frame, _| frame >= horizon);
        }
    }
}
