use crate::sync_layer::GameStateCell;
use crate::{Frame, PalisadeError};

/// The ring of saved game states used for rollback.
///
/// Writing frame F reuses cell `F mod capacity`. The capacity is
/// `max_prediction + 2`: the state at the current frame, plus enough history
/// to rewind the full prediction window even right after an advance.
pub(crate) struct SavedStates<S> {
    cells: Vec<GameStateCell<S>>,
}

impl<S> SavedStates<S> {
    pub(crate) fn new(max_prediction: usize) -> Self {
        let capacity = max_prediction + 2;
        let mut cells = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            cells.push(GameStateCell::default());
        }
        Self { cells }
    }

    /// The cell assigned to the given frame. The cell holds that frame's
    /// state only until the ring wraps around to it again.
    pub(crate) fn get_cell(&self, frame: Frame) -> Result<GameStateCell<S>, PalisadeError> {
        let index = frame
            .ring_index(self.cells.len())
            .ok_or_else(|| PalisadeError::InvalidFrame {
                frame,
                reason: "game states exist only for non-negative frames".to_owned(),
            })?;
        Ok(self.cells[index].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_is_max_prediction_plus_two() {
        let states = SavedStates::<u8>::new(8);
        assert_eq!(states.cells.len(), 10);
    }

    #[test]
    fn cells_are_reused_per_ring_index() {
        let states = SavedStates::<u8>::new(2);
        // capacity 4: frames 1 and 5 share a cell
        let early = states.get_cell(Frame::new(1)).unwrap();
        early.save(Frame::new(1), Some(11), None);
        let late = states.get_cell(Frame::new(5)).unwrap();
        assert_eq!(late.frame(), Frame::new(1));
        late.save(Frame::new(5), Some(55), None);
        assert_eq!(states.get_cell(Frame::new(1)).unwrap().frame(), Frame::new(5));
    }

    #[test]
    fn negative_frames_are_rejected() {
        let states = SavedStates::<u8>::new(2);
        assert!(states.get_cell(Frame::NULL).is_err());
        assert!(states.get_cell(Frame::new(-3)).is_err());
    }

    #[test]
    fn recent_frames_stay_loadable() {
        let states = SavedStates::<u8>::new(3);
        // capacity 5; save frames 0..=4, all must be retrievable
        for i in 0..5i32 {
            states
                .get_cell(Frame::new(i))
                .unwrap()
                .save(Frame::new(i), Some(i as u8), None);
        }
        for i in 0..5i32 {
            let cell = states.get_cell(Frame::new(i)).unwrap();
            assert_eq!(cell.frame(), Frame::new(i));
            assert_eq!(cell.load(), Some(i as u8));
        }
    }
}
