use std::cmp;

use tracing::{trace, warn};

use crate::frame_info::PlayerInput;
use crate::{Config, Frame, InputStatus, PalisadeError};

/// The number of input slots the queue holds per player. Frames older than
/// this window have long been confirmed and discarded.
pub(crate) const INPUT_QUEUE_LENGTH: usize = 128;

/// A frame-indexed ring of inputs for a single player.
///
/// The queue stores the contiguous window of inputs between `tail` (oldest
/// retained) and `head` (most recently added). Reading a frame that has not
/// arrived yet yields a prediction (the last known input); once the
/// authoritative input arrives, a mismatch is recorded in
/// `first_incorrect_frame` so the session can roll back.
#[derive(Debug, Clone)]
pub(crate) struct InputQueue<T>
where
    T: Config,
{
    /// Index of the slot the next input will be written to.
    head: usize,
    /// Index of the oldest retained input.
    tail: usize,
    /// Number of retained inputs.
    length: usize,
    /// True until the first input has been added.
    first_frame: bool,

    /// The last frame stored in the queue (after frame delay).
    last_added_frame: Frame,
    /// The last frame the owning client submitted (before frame delay).
    last_user_added_frame: Frame,
    /// The earliest frame where a handed-out prediction turned out wrong.
    first_incorrect_frame: Frame,
    /// The highest frame ever returned from `input()`. Nothing at or after
    /// this frame may be discarded.
    last_requested_frame: Frame,

    /// Frames of delay applied to submitted inputs.
    frame_delay: usize,

    /// The ring of inputs.
    inputs: Vec<PlayerInput<T::Input>>,
    /// The running prediction, valid while its frame is non-null.
    prediction: PlayerInput<T::Input>,
}

impl<T: Config> InputQueue<T> {
    pub(crate) fn new() -> Self {
        Self {
            head: 0,
            tail: 0,
            length: 0,
            first_frame: true,
            last_added_frame: Frame::NULL,
            last_user_added_frame: Frame::NULL,
            first_incorrect_frame: Frame::NULL,
            last_requested_frame: Frame::NULL,
            frame_delay: 0,
            prediction: PlayerInput::blank(Frame::NULL),
            inputs: vec![PlayerInput::blank(Frame::NULL); INPUT_QUEUE_LENGTH],
        }
    }

    pub(crate) fn first_incorrect_frame(&self) -> Frame {
        self.first_incorrect_frame
    }

    pub(crate) fn set_frame_delay(&mut self, delay: usize) {
        self.frame_delay = delay;
    }

    /// Leaves prediction mode after a rollback has replayed everything up to
    /// (and including) the first incorrect frame.
    pub(crate) fn reset_prediction(&mut self, frame: Frame) {
        debug_assert!(
            self.first_incorrect_frame.is_null() || frame <= self.first_incorrect_frame
        );
        self.prediction.frame = Frame::NULL;
        self.first_incorrect_frame = Frame::NULL;
        self.last_requested_frame = Frame::NULL;
    }

    /// Returns the authoritative input for the requested frame, or an error
    /// if the frame is not (or no longer) in the queue. Never predicts.
    pub(crate) fn confirmed_input(
        &self,
        requested_frame: Frame,
    ) -> Result<PlayerInput<T::Input>, PalisadeError> {
        let offset = requested_frame
            .ring_index(INPUT_QUEUE_LENGTH)
            .ok_or_else(|| PalisadeError::InvalidFrame {
                frame: requested_frame,
                reason: "confirmed inputs exist only for non-negative frames".to_owned(),
            })?;

        if self.inputs[offset].frame == requested_frame {
            return Ok(self.inputs[offset]);
        }

        Err(PalisadeError::InvalidFrame {
            frame: requested_frame,
            reason: format!(
                "no confirmed input for this frame (tail={}, head={}, length={})",
                self.tail, self.head, self.length
            ),
        })
    }

    /// Discards confirmed frames up to the given frame. Confirmed frames are
    /// synchronized between all players, so the inputs are no longer needed
    /// for rollback.
    pub(crate) fn discard_confirmed_frames(&mut self, mut frame: Frame) {
        // never discard anything we have handed out and might need to re-check
        if !self.last_requested_frame.is_null() {
            frame = cmp::min(frame, self.last_requested_frame);
        }

        if frame >= self.last_added_frame {
            // keep only the most recent input; it is the prediction base
            self.tail = self.head;
            self.length = 1;
        } else if frame <= self.inputs[self.tail].frame {
            // nothing old enough to discard
        } else {
            let offset = (frame - self.inputs[self.tail].frame) as usize;
            self.tail = (self.tail + offset) % INPUT_QUEUE_LENGTH;
            self.length -= offset;
        }
    }

    /// Returns the input for the given frame, predicting with the last known
    /// input when the authoritative one has not arrived yet.
    pub(crate) fn input(&mut self, requested_frame: Frame) -> (T::Input, InputStatus) {
        // Reading past a known misprediction only walks further down the
        // wrong timeline; the session must roll back first.
        debug_assert!(self.first_incorrect_frame.is_null());

        // Remembered so a later confirmation can detect the misprediction.
        self.last_requested_frame = requested_frame;

        debug_assert!(requested_frame >= self.inputs[self.tail].frame);

        if self.prediction.frame.is_null() {
            // if the frame is still in the queue, return it verbatim
            let mut offset = (requested_frame - self.inputs[self.tail].frame) as usize;
            if offset < self.length {
                offset = (offset + self.tail) % INPUT_QUEUE_LENGTH;
                debug_assert!(self.inputs[offset].frame == requested_frame);
                return (self.inputs[offset].input, InputStatus::Confirmed);
            }

            // otherwise enter prediction mode: repeat the last known input,
            // or a blank if there is none yet
            if requested_frame == 0 || self.last_added_frame.is_null() {
                self.prediction = PlayerInput::blank(self.prediction.frame);
            } else {
                let previous = match self.head {
                    0 => INPUT_QUEUE_LENGTH - 1,
                    _ => self.head - 1,
                };
                self.prediction = self.inputs[previous];
            }
            self.prediction.frame += 1;
        }

        trace!(
            frame = requested_frame.as_i32(),
            "returning predicted input"
        );
        (self.prediction.input, InputStatus::Predicted)
    }

    /// Adds an input to the queue, applying the configured frame delay.
    ///
    /// Inputs must be submitted sequentially; a gap or repeat is dropped and
    /// reported as [`Frame::NULL`]. Returns the frame the input was actually
    /// stored at (the submitted frame clamped forward by the frame delay).
    pub(crate) fn add_input(&mut self, input: PlayerInput<T::Input>) -> Frame {
        if !self.last_user_added_frame.is_null()
            && input.frame != self.last_user_added_frame + 1
        {
            trace!(
                frame = input.frame.as_i32(),
                expected = (self.last_user_added_frame + 1).as_i32(),
                "dropping non-sequential input"
            );
            return Frame::NULL;
        }
        self.last_user_added_frame = input.frame;

        let new_frame = self.advance_queue_head(input.frame);
        if !new_frame.is_null() {
            self.add_input_by_frame(input, new_frame);
        }
        new_frame
    }

    /// Stores an input at the given (delay-adjusted) frame and checks it
    /// against any outstanding prediction.
    fn add_input_by_frame(&mut self, input: PlayerInput<T::Input>, frame_number: Frame) {
        let previous = match self.head {
            0 => INPUT_QUEUE_LENGTH - 1,
            _ => self.head - 1,
        };

        debug_assert!(self.last_added_frame.is_null() || frame_number == self.last_added_frame + 1);
        debug_assert!(frame_number == 0 || self.inputs[previous].frame == frame_number - 1);

        self.inputs[self.head] = input;
        self.inputs[self.head].frame = frame_number;
        self.head = (self.head + 1) % INPUT_QUEUE_LENGTH;
        if self.length < INPUT_QUEUE_LENGTH {
            self.length += 1;
        } else {
            // the ring wrapped onto its own tail; the oldest frame is gone
            self.tail = (self.tail + 1) % INPUT_QUEUE_LENGTH;
        }
        self.first_frame = false;
        self.last_added_frame = frame_number;

        if !self.prediction.frame.is_null() {
            debug_assert!(frame_number == self.prediction.frame);

            // confirmation against the handed-out prediction: a mismatch is
            // recorded once, at the earliest frame it happened
            if self.first_incorrect_frame.is_null() && !self.prediction.equal(&input, true) {
                warn!(
                    frame = frame_number.as_i32(),
                    "confirmed input differs from prediction"
                );
                self.first_incorrect_frame = frame_number;
            }

            // once confirmations have caught up with everything handed out
            // (and nothing was wrong), prediction mode ends
            if self.prediction.frame == self.last_requested_frame
                && self.first_incorrect_frame.is_null()
            {
                self.prediction.frame = Frame::NULL;
            } else {
                self.prediction.frame += 1;
            }
        }
    }

    /// Moves the head to the delay-adjusted frame, replicating the previous
    /// input into any gap left by an increased frame delay.
    fn advance_queue_head(&mut self, frame: Frame) -> Frame {
        let previous = match self.head {
            0 => INPUT_QUEUE_LENGTH - 1,
            _ => self.head - 1,
        };

        let mut expected_frame = if self.first_frame {
            Frame::new(0)
        } else {
            self.inputs[previous].frame + 1
        };

        let input_frame = frame + self.frame_delay as i32;

        // the frame delay shrank since the last input; there is no room for
        // this frame anymore
        if expected_frame > input_frame {
            trace!(
                frame = frame.as_i32(),
                "dropping input after frame delay decrease"
            );
            return Frame::NULL;
        }

        // the frame delay grew; fill the gap by repeating the last input
        while expected_frame < input_frame {
            let replicated = self.inputs[previous];
            self.add_input_by_frame(replicated, expected_frame);
            expected_frame += 1;
        }

        input_frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::net::SocketAddr;

    #[derive(Copy, Clone, PartialEq, Default, Serialize, Deserialize)]
    struct TestInput {
        buttons: u8,
    }

    fn inp(value: u8) -> TestInput {
        TestInput { buttons: value }
    }

    struct TestConfig;

    impl Config for TestConfig {
        type Input = TestInput;
        type State = Vec<u8>;
        type Address = SocketAddr;
    }

    #[test]
    fn add_input_rejects_gaps() {
        let mut queue = InputQueue::<TestConfig>::new();
        assert_eq!(
            queue.add_input(PlayerInput::new(Frame::new(0), inp(0))),
            Frame::new(0)
        );
        assert_eq!(
            queue.add_input(PlayerInput::new(Frame::new(3), inp(0))),
            Frame::NULL
        );
    }

    #[test]
    fn add_input_rejects_repeats() {
        let mut queue = InputQueue::<TestConfig>::new();
        let input = PlayerInput::new(Frame::new(0), inp(0));
        assert_eq!(queue.add_input(input), Frame::new(0));
        assert_eq!(queue.add_input(input), Frame::NULL);
    }

    #[test]
    fn sequential_inputs_are_stored_contiguously() {
        let mut queue = InputQueue::<TestConfig>::new();
        for i in 0..10i32 {
            queue.add_input(PlayerInput::new(Frame::new(i), inp(i as u8)));
            assert_eq!(queue.last_added_frame, Frame::new(i));
            assert_eq!(queue.length, (i + 1) as usize);
            let (stored, status) = queue.input(Frame::new(i));
            assert_eq!(status, InputStatus::Confirmed);
            assert_eq!(stored.buttons, i as u8);
        }
    }

    #[test]
    fn frame_delay_shifts_inputs_forward() {
        let mut queue = InputQueue::<TestConfig>::new();
        let delay = 2;
        queue.set_frame_delay(delay);
        for i in 0..10i32 {
            let actual = queue.add_input(PlayerInput::new(Frame::new(i), inp(i as u8)));
            assert_eq!(actual, Frame::new(i + delay as i32));
            let (stored, _) = queue.input(Frame::new(i));
            // frames below the delay replicate the blank initial input
            let expected = std::cmp::max(0, i - delay as i32) as u8;
            assert_eq!(stored.buttons, expected);
        }
    }

    #[test]
    fn frame_delay_increase_fills_gap_with_repetition() {
        let mut queue = InputQueue::<TestConfig>::new();
        assert_eq!(
            queue.add_input(PlayerInput::new(Frame::new(0), inp(7))),
            Frame::new(0)
        );
        queue.set_frame_delay(2);
        // frame 1 lands at frame 3; frames 1 and 2 repeat the frame-0 input
        assert_eq!(
            queue.add_input(PlayerInput::new(Frame::new(1), inp(9))),
            Frame::new(3)
        );
        assert_eq!(queue.confirmed_input(Frame::new(1)).unwrap().input.buttons, 7);
        assert_eq!(queue.confirmed_input(Frame::new(2)).unwrap().input.buttons, 7);
        assert_eq!(queue.confirmed_input(Frame::new(3)).unwrap().input.buttons, 9);
    }

    #[test]
    fn frame_delay_decrease_drops_inputs_until_caught_up() {
        let mut queue = InputQueue::<TestConfig>::new();
        queue.set_frame_delay(2);
        queue.add_input(PlayerInput::new(Frame::new(0), inp(1)));
        assert_eq!(queue.last_added_frame, Frame::new(2));
        queue.set_frame_delay(0);
        // frame 1 would land at frame 1, which is already occupied
        assert_eq!(
            queue.add_input(PlayerInput::new(Frame::new(1), inp(2))),
            Frame::NULL
        );
        // frame 3 is next in sequence again once the user frames catch up
        assert_eq!(
            queue.add_input(PlayerInput::new(Frame::new(2), inp(3))),
            Frame::NULL
        );
        assert_eq!(
            queue.add_input(PlayerInput::new(Frame::new(3), inp(4))),
            Frame::new(3)
        );
    }

    #[test]
    fn confirmed_input_requires_presence() {
        let mut queue = InputQueue::<TestConfig>::new();
        for i in 0..5i32 {
            queue.add_input(PlayerInput::new(Frame::new(i), inp((i * 10) as u8)));
        }
        let confirmed = queue.confirmed_input(Frame::new(2)).unwrap();
        assert_eq!(confirmed.frame, Frame::new(2));
        assert_eq!(confirmed.input.buttons, 20);
        assert!(queue.confirmed_input(Frame::new(10)).is_err());
        assert!(queue.confirmed_input(Frame::NULL).is_err());
    }

    #[test]
    fn discard_keeps_most_recent_input() {
        let mut queue = InputQueue::<TestConfig>::new();
        for i in 0..10i32 {
            queue.add_input(PlayerInput::new(Frame::new(i), inp(i as u8)));
        }
        queue.discard_confirmed_frames(Frame::new(100));
        assert_eq!(queue.length, 1);
        assert!(queue.confirmed_input(Frame::new(9)).is_ok());
    }

    #[test]
    fn discard_partial() {
        let mut queue = InputQueue::<TestConfig>::new();
        for i in 0..10i32 {
            queue.add_input(PlayerInput::new(Frame::new(i), inp(i as u8)));
        }
        queue.discard_confirmed_frames(Frame::new(5));
        assert_eq!(queue.length, 5);
        assert!(queue.confirmed_input(Frame::new(5)).is_ok());
    }

    #[test]
    fn discard_respects_last_requested_frame() {
        let mut queue = InputQueue::<TestConfig>::new();
        for i in 0..10i32 {
            queue.add_input(PlayerInput::new(Frame::new(i), inp(i as u8)));
        }
        let _ = queue.input(Frame::new(3));
        queue.discard_confirmed_frames(Frame::new(8));
        assert!(queue.confirmed_input(Frame::new(3)).is_ok());
    }

    #[test]
    fn discard_ignores_frames_before_tail() {
        let mut queue = InputQueue::<TestConfig>::new();
        for i in 0..10i32 {
            queue.add_input(PlayerInput::new(Frame::new(i), inp(i as u8)));
        }
        queue.discard_confirmed_frames(Frame::new(-1));
        assert_eq!(queue.length, 10);
    }

    #[test]
    fn prediction_repeats_last_input() {
        let mut queue = InputQueue::<TestConfig>::new();
        for i in 0..3i32 {
            queue.add_input(PlayerInput::new(Frame::new(i), inp(42)));
        }
        let (predicted, status) = queue.input(Frame::new(5));
        assert_eq!(status, InputStatus::Predicted);
        assert_eq!(predicted.buttons, 42);
    }

    #[test]
    fn prediction_from_nothing_is_blank() {
        let mut queue = InputQueue::<TestConfig>::new();
        let (predicted, status) = queue.input(Frame::new(0));
        assert_eq!(status, InputStatus::Predicted);
        assert_eq!(predicted.buttons, 0);
    }

    #[test]
    fn matching_confirmation_keeps_first_incorrect_null() {
        let mut queue = InputQueue::<TestConfig>::new();
        queue.add_input(PlayerInput::new(Frame::new(0), inp(10)));
        let _ = queue.input(Frame::new(1));
        queue.add_input(PlayerInput::new(Frame::new(1), inp(10)));
        assert_eq!(queue.first_incorrect_frame(), Frame::NULL);
        // prediction mode has ended; the queue serves confirmed inputs again
        let (_, status) = queue.input(Frame::new(1));
        assert_eq!(status, InputStatus::Confirmed);
    }

    #[test]
    fn differing_confirmation_records_first_incorrect() {
        let mut queue = InputQueue::<TestConfig>::new();
        queue.add_input(PlayerInput::new(Frame::new(0), inp(10)));
        let (predicted, status) = queue.input(Frame::new(1));
        assert_eq!(status, InputStatus::Predicted);
        assert_eq!(predicted.buttons, 10);
        queue.add_input(PlayerInput::new(Frame::new(1), inp(99)));
        assert_eq!(queue.first_incorrect_frame(), Frame::new(1));
    }

    #[test]
    fn first_incorrect_is_earliest_mismatch() {
        let mut queue = InputQueue::<TestConfig>::new();
        queue.add_input(PlayerInput::new(Frame::new(0), inp(10)));
        let _ = queue.input(Frame::new(1));
        let _ = queue.input(Frame::new(2));
        let _ = queue.input(Frame::new(3));
        queue.add_input(PlayerInput::new(Frame::new(1), inp(99)));
        queue.add_input(PlayerInput::new(Frame::new(2), inp(98)));
        assert_eq!(queue.first_incorrect_frame(), Frame::new(1));
    }

    #[test]
    fn reset_prediction_clears_cursors() {
        let mut queue = InputQueue::<TestConfig>::new();
        for i in 0..3i32 {
            queue.add_input(PlayerInput::new(Frame::new(i), inp(i as u8)));
        }
        let (_, status) = queue.input(Frame::new(5));
        assert_eq!(status, InputStatus::Predicted);
        queue.reset_prediction(Frame::new(3));
        assert_eq!(queue.prediction.frame, Frame::NULL);
        assert_eq!(queue.first_incorrect_frame, Frame::NULL);
        assert_eq!(queue.last_requested_frame, Frame::NULL);
    }

    #[test]
    fn ring_wraparound_preserves_recent_inputs() {
        let mut queue = InputQueue::<TestConfig>::new();
        for i in 0..64i32 {
            queue.add_input(PlayerInput::new(Frame::new(i), inp((i % 256) as u8)));
        }
        queue.discard_confirmed_frames(Frame::new(60));
        for i in 64..150i32 {
            queue.add_input(PlayerInput::new(Frame::new(i), inp((i % 256) as u8)));
        }
        let confirmed = queue.confirmed_input(Frame::new(149)).unwrap();
        assert_eq!(confirmed.input.buttons, (149 % 256) as u8);
    }
}
