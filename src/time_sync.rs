use crate::frame_info::GameInput;

const FRAME_WINDOW_SIZE: usize = 40;
const MIN_FRAME_ADVANTAGE: i32 = 3;
const MAX_FRAME_ADVANTAGE: i32 = 9;
/// How many of the most recent local inputs must be bit-identical before a stall is recommended
/// with `require_idle_input`. Stalling mid-action would be very noticeable.
const IDLE_INPUT_REQUIREMENT: usize = 10;

/// Estimates the frame advantage drift between the local and the remote client over a sliding
/// window and recommends how many frames the local side should stall to reduce the drift.
/// Positive advantage means being ahead of the other side.
#[derive(Debug)]
pub(crate) struct TimeSync {
    local: [f32; FRAME_WINDOW_SIZE],
    remote: [f32; FRAME_WINDOW_SIZE],
    last_inputs: [GameInput; IDLE_INPUT_REQUIREMENT],
}

impl Default for TimeSync {
    fn default() -> Self {
        Self {
            local: [0.; FRAME_WINDOW_SIZE],
            remote: [0.; FRAME_WINDOW_SIZE],
            last_inputs: [GameInput::default(); IDLE_INPUT_REQUIREMENT],
        }
    }
}

impl TimeSync {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Records the advantage pair observed while submitting the local input for a frame.
    pub(crate) fn advance_frame(&mut self, input: &GameInput, local_adv: f32, remote_adv: f32) {
        assert!(input.frame >= 0);
        self.last_inputs[input.frame as usize % self.last_inputs.len()] = *input;
        self.local[input.frame as usize % self.local.len()] = local_adv;
        self.remote[input.frame as usize % self.remote.len()] = remote_adv;
    }

    /// Returns the number of frames the local client should sleep to drift back towards the
    /// remote client. Returns 0 if the local side is not meaningfully ahead, or if
    /// `require_idle_input` is set and the player is in the middle of doing something.
    pub(crate) fn recommend_frame_wait_duration(&self, require_idle_input: bool) -> u32 {
        let local_sum: f32 = self.local.iter().sum();
        let local_avg = local_sum / self.local.len() as f32;
        let remote_sum: f32 = self.remote.iter().sum();
        let remote_avg = remote_sum / self.remote.len() as f32;

        // the other side is ahead of us, they have to do the stalling
        if local_avg < remote_avg {
            return 0;
        }

        // meet in the middle
        let sleep_frames = ((local_avg - remote_avg) / 2. + 0.5) as i32;

        // tiny drift is not worth a stall
        if sleep_frames < MIN_FRAME_ADVANTAGE {
            return 0;
        }
        let sleep_frames = sleep_frames.min(MAX_FRAME_ADVANTAGE);

        if require_idle_input {
            let reference = &self.last_inputs[0];
            if !self
                .last_inputs
                .iter()
                .all(|input| input.equal(reference, true))
            {
                return 0;
            }
        }

        sleep_frames as u32
    }
}

// #########
// # TESTS #
// #########
