use crate::Frame;

/// Number of frame-advantage samples kept in the sliding window.
pub(crate) const FRAME_WINDOW_SIZE: usize = 40;
/// The local side must be ahead by more than this many frames before a wait
/// is recommended.
pub(crate) const MIN_FRAME_ADVANTAGE: i32 = 3;
/// Minimum number of frames between two nonzero recommendations.
pub(crate) const MIN_UNIQUE_FRAMES: i32 = 10;

/// Estimates how far ahead of a peer the local client runs, and recommends
/// frame pauses that keep both sides within a frame of each other.
///
/// Every sent frame records a `(local, remote)` frame-advantage pair into a
/// sliding window; the recommendation is computed from the window medians so
/// a few outlier samples (a ping spike, one late packet) do not trigger a
/// stall.
#[derive(Debug)]
pub(crate) struct TimeSync {
    local: Vec<i32>,
    remote: Vec<i32>,
    last_recommendation: Frame,
}

impl Default for TimeSync {
    fn default() -> Self {
        Self {
            local: vec![0; FRAME_WINDOW_SIZE],
            remote: vec![0; FRAME_WINDOW_SIZE],
            last_recommendation: Frame::NULL,
        }
    }
}

impl TimeSync {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Records the advantage pair observed while sending the given frame.
    pub(crate) fn advance_frame(&mut self, frame: Frame, local_adv: i32, remote_adv: i32) {
        let Some(index) = frame.ring_index(FRAME_WINDOW_SIZE) else {
            // inputs dropped at the queue produce a NULL frame; nothing to record
            return;
        };
        self.local[index] = local_adv;
        self.remote[index] = remote_adv;
    }

    /// Recommends how many frames the local client should sit out, or 0.
    ///
    /// Nonzero only if the median local advantage exceeds
    /// [`MIN_FRAME_ADVANTAGE`] and at least [`MIN_UNIQUE_FRAMES`] frames have
    /// passed since the previous nonzero recommendation. The recommendation
    /// meets the peer in the middle: half the median advantage gap.
    pub(crate) fn recommend_frame_wait(&mut self, current_frame: Frame) -> u32 {
        let local_median = median(&self.local);
        let remote_median = median(&self.remote);

        if local_median <= MIN_FRAME_ADVANTAGE {
            return 0;
        }

        if !self.last_recommendation.is_null()
            && current_frame - self.last_recommendation < MIN_UNIQUE_FRAMES
        {
            return 0;
        }

        let skip = (local_median - remote_median) / 2;
        if skip <= 0 {
            return 0;
        }

        self.last_recommendation = current_frame;
        skip as u32
    }
}

fn median(samples: &[i32]) -> i32 {
    let mut sorted = samples.to_vec();
    sorted.sort_unstable();
    sorted[sorted.len() / 2]
}
