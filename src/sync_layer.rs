use crate::error::RollnetError;
use crate::frame_info::{GameInput, GameState};
use crate::input_queue::InputQueue;
use crate::network::udp_msg::ConnectionStatus;
use crate::{Frame, PlayerHandle, RollnetInterface, MAX_INPUT_DELAY, NULL_FRAME};
use tracing::debug;

/// A ring of saved game states, indexed by frame number. The ring is two slots bigger than the
/// maximum prediction window so the frame about to be saved never evicts a frame that might still
/// be rolled back to.
#[derive(Clone)]
pub(crate) struct SavedStates {
    states: Vec<GameState>,
}

impl SavedStates {
    fn new(max_prediction: usize) -> Self {
        Self {
            states: vec![GameState::default(); max_prediction + 2],
        }
    }

    fn slot(&self, frame: Frame) -> usize {
        assert!(frame >= 0);
        frame as usize % self.states.len()
    }
}

/// The `SyncLayer` is the rollback engine: it owns the frame counter, the per-player input queues
/// and the saved-state ring, assembles inputs for each frame and re-simulates frames through the
/// application callbacks when a prediction turned out wrong.
///
/// The slot for frame `F` always holds the state *entering* `F`, i.e. the state before the tick
/// of frame `F` has run.
pub(crate) struct SyncLayer {
    num_players: usize,
    input_size: usize,
    max_prediction: usize,
    saved_states: SavedStates,
    rolling_back: bool,
    last_confirmed_frame: Frame,
    current_frame: Frame,
    input_queues: Vec<InputQueue>,
}

impl SyncLayer {
    /// Creates a new `SyncLayer` instance with given values.
    pub(crate) fn new(num_players: usize, input_size: usize, max_prediction: usize) -> Self {
        // initialize input_queues
        let mut input_queues = Vec::new();
        for i in 0..num_players {
            input_queues.push(InputQueue::new(i as PlayerHandle, input_size));
        }
        Self {
            num_players,
            input_size,
            max_prediction,
            rolling_back: false,
            last_confirmed_frame: NULL_FRAME,
            current_frame: 0,
            saved_states: SavedStates::new(max_prediction),
            input_queues,
        }
    }

    pub(crate) const fn current_frame(&self) -> Frame {
        self.current_frame
    }

    pub(crate) const fn in_rollback(&self) -> bool {
        self.rolling_back
    }

    pub(crate) fn advance_frame(&mut self) {
        self.current_frame += 1;
    }

    /// Asks the application to serialize the state entering the current frame and stores it in the ring.
    pub(crate) fn save_current_frame(&mut self, interface: &mut impl RollnetInterface) {
        let state = interface.save_game_state(self.current_frame);
        assert_eq!(state.frame, self.current_frame);
        let slot = self.saved_states.slot(self.current_frame);
        self.saved_states.states[slot] = state;
    }

    /// The checksum the application reported for the state entering `frame`, if that state is still held.
    pub(crate) fn saved_frame_checksum(&self, frame: Frame) -> Option<u128> {
        let state = &self.saved_states.states[self.saved_states.slot(frame)];
        (state.frame == frame).then(|| state.checksum)
    }

    /// Restores the state entering `frame_to_load` through the application callback.
    pub(crate) fn load_frame(&mut self, frame_to_load: Frame, interface: &mut impl RollnetInterface) {
        // the state to load must not be the current one, in the future or outside the prediction window
        assert!(
            frame_to_load != NULL_FRAME
                && frame_to_load < self.current_frame
                && frame_to_load >= self.current_frame - self.max_prediction as i32
        );

        let state = &self.saved_states.states[self.saved_states.slot(frame_to_load)];
        assert_eq!(state.frame, frame_to_load);
        interface.load_game_state(state);
        self.current_frame = frame_to_load;
    }

    pub(crate) fn set_frame_delay(&mut self, player_handle: PlayerHandle, delay: u32) {
        assert!(player_handle < self.num_players);
        assert!(delay <= MAX_INPUT_DELAY);
        self.input_queues[player_handle].set_frame_delay(delay);
    }

    pub(crate) fn reset_prediction(&mut self, frame: Frame) {
        for i in 0..self.num_players {
            self.input_queues[i].reset_prediction(frame);
        }
    }

    /// Adds local input to the corresponding input queue, unless that would put us further ahead of
    /// the slowest peer than the prediction window allows. Returns the frame the input was actually
    /// stored at, which differs from the current frame when an input delay is set.
    pub(crate) fn add_local_input(
        &mut self,
        player_handle: PlayerHandle,
        input: GameInput,
    ) -> Result<Frame, RollnetError> {
        let frames_ahead = self.current_frame - self.last_confirmed_frame;
        if self.current_frame >= self.max_prediction as i32
            && frames_ahead >= self.max_prediction as i32
        {
            return Err(RollnetError::PredictionThreshold);
        }

        // the input provided should match the current frame, input delay is handled by the queue
        assert_eq!(input.frame, self.current_frame);
        Ok(self.input_queues[player_handle].add_input(input))
    }

    /// Adds remote input to the corresponding input queue. Unlike `add_local_input`, there is no
    /// threshold check, remote inputs have already been checked on the other device.
    pub(crate) fn add_remote_input(&mut self, player_handle: PlayerHandle, input: GameInput) {
        self.input_queues[player_handle].add_input(input);
    }

    /// Assembles the inputs for all players for the current frame: confirmed inputs where
    /// available, predictions otherwise. Disconnected players get a zeroed input with a null
    /// frame and their bit set in the returned disconnect mask.
    pub(crate) fn synchronized_inputs(
        &mut self,
        connect_status: &[ConnectionStatus],
    ) -> (Vec<GameInput>, u8) {
        let mut inputs = Vec::with_capacity(self.num_players);
        let mut disconnect_flags = 0u8;
        for (i, con_stat) in connect_status.iter().enumerate() {
            if con_stat.disconnected && con_stat.last_frame < self.current_frame {
                disconnect_flags |= 1 << i;
                inputs.push(GameInput::blank_input(self.input_size));
            } else {
                inputs.push(self.input_queues[i].input(self.current_frame));
            }
        }
        (inputs, disconnect_flags)
    }

    /// Returns confirmed inputs for all players for the given frame. Panics if any input for that
    /// frame is not confirmed yet; only call for frames at or below the minimum confirmed frame.
    pub(crate) fn confirmed_inputs(
        &self,
        frame: Frame,
        connect_status: &[ConnectionStatus],
    ) -> Vec<GameInput> {
        let mut inputs = Vec::with_capacity(self.num_players);
        for (i, con_stat) in connect_status.iter().enumerate() {
            if con_stat.disconnected && con_stat.last_frame < frame {
                inputs.push(GameInput::blank_input(self.input_size));
            } else {
                inputs.push(self.input_queues[i].confirmed_input(frame));
            }
        }
        inputs
    }

    /// Sets the last confirmed frame. All inputs before it are synchronized between all players
    /// and no rollback can ever reach back past it, so they are discarded.
    pub(crate) fn set_last_confirmed_frame(&mut self, frame: Frame) {
        // discarding inputs the engine still needs for a pending rollback would corrupt the replay
        let mut first_incorrect: Frame = NULL_FRAME;
        for handle in 0..self.num_players {
            first_incorrect = std::cmp::max(
                first_incorrect,
                self.input_queues[handle].first_incorrect_frame(),
            );
        }
        assert!(first_incorrect == NULL_FRAME || first_incorrect >= frame);

        self.last_confirmed_frame = frame;
        if self.last_confirmed_frame > 0 {
            for i in 0..self.num_players {
                self.input_queues[i].discard_confirmed_frames(frame - 1);
            }
        }
    }

    /// Finds the earliest incorrect frame detected by the individual input queues,
    /// starting from `first_incorrect` if that is already a valid frame.
    pub(crate) fn check_simulation_consistency(&self, mut first_incorrect: Frame) -> Frame {
        for handle in 0..self.num_players {
            let incorrect = self.input_queues[handle].first_incorrect_frame();
            if incorrect != NULL_FRAME
                && (first_incorrect == NULL_FRAME || incorrect < first_incorrect)
            {
                first_incorrect = incorrect;
            }
        }
        first_incorrect
    }

    /// The highest frame stored for the given player.
    pub(crate) fn last_confirmed_frame_for(&self, player_handle: PlayerHandle) -> Frame {
        self.input_queues[player_handle].last_confirmed_frame()
    }

    /// Rolls the simulation back to the first incorrect frame and re-simulates up to the frame we
    /// started from, now with the corrected inputs. The application state is restored through
    /// `load_game_state` once and advanced through `advance_frame` for every replayed frame.
    pub(crate) fn adjust_simulation(
        &mut self,
        interface: &mut impl RollnetInterface,
        connect_status: &[ConnectionStatus],
        first_incorrect: Frame,
    ) {
        let current = self.current_frame;
        let count = current - first_incorrect;
        assert!(count >= 0);

        debug!(first_incorrect, count, "rollback");

        self.rolling_back = true;

        // a misprediction at the current frame needs no load, resetting the predictions is
        // enough: the corrected input will be served when the current frame is assembled next
        if count > 0 {
            self.load_frame(first_incorrect, interface);
        }
        self.reset_prediction(first_incorrect);

        // step forward to the frame we started from, now with corrected inputs
        for _ in 0..count {
            let (inputs, disconnect_flags) = self.synchronized_inputs(connect_status);
            interface.advance_frame(inputs, disconnect_flags);
            self.current_frame += 1;
            // the state entering the frame we started from is re-saved by the regular flow
            if self.current_frame < current {
                self.save_current_frame(interface);
            }
        }

        assert_eq!(self.current_frame, current);
        self.rolling_back = false;
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod sync_layer_tests {

    use super::*;
    use crate::RollnetEvent;

    const INPUT_SIZE: usize = 4;

    /// Records every callback invocation so tests can assert the exact rollback behavior.
    struct RecordingInterface {
        saved_frames: Vec<Frame>,
        loaded_frames: Vec<Frame>,
        ticked: Vec<Vec<GameInput>>,
    }

    impl RecordingInterface {
        fn new() -> Self {
            Self {
                saved_frames: Vec::new(),
                loaded_frames: Vec::new(),
                ticked: Vec::new(),
            }
        }
    }

    impl RollnetInterface for RecordingInterface {
        fn save_game_state(&mut self, frame: Frame) -> GameState {
            self.saved_frames.push(frame);
            GameState::new(frame, Some(frame.to_le_bytes().to_vec()), None)
        }

        fn load_game_state(&mut self, state: &GameState) {
            self.loaded_frames.push(state.frame);
        }

        fn advance_frame(&mut self, inputs: Vec<GameInput>, _disconnect_flags: u8) {
            self.ticked.push(inputs);
        }

        fn on_event(&mut self, _event: RollnetEvent) {}
    }

    fn local_input(frame: Frame, bits: [u8; INPUT_SIZE]) -> GameInput {
        let mut input = GameInput::new(frame, INPUT_SIZE);
        input.copy_input(&bits);
        input
    }

    #[test]
    fn test_reach_prediction_threshold() {
        let mut sync_layer = SyncLayer::new(2, INPUT_SIZE, 8);
        for i in 0..8 {
            let input = local_input(i, [i as u8; INPUT_SIZE]);
            sync_layer.add_local_input(0, input).unwrap();
            sync_layer.advance_frame();
        }
        // the 9th input would put us more than 8 frames ahead of the last confirmed frame
        let input = local_input(8, [42; INPUT_SIZE]);
        assert_eq!(
            sync_layer.add_local_input(0, input),
            Err(RollnetError::PredictionThreshold)
        );
    }

    #[test]
    fn test_different_delays() {
        let mut sync_layer = SyncLayer::new(2, INPUT_SIZE, 8);
        let p1_delay = 2;
        let p2_delay = 0;
        sync_layer.set_frame_delay(0, p1_delay);
        sync_layer.set_frame_delay(1, p2_delay);

        let mut dummy_connect_status = vec![ConnectionStatus::default(); 2];

        for i in 0..20 {
            let input = local_input(i, [i as u8; INPUT_SIZE]);
            // adding input as remote to avoid the prediction threshold
            sync_layer.add_remote_input(0, input);
            sync_layer.add_remote_input(1, input);
            dummy_connect_status[0].last_frame = i;
            dummy_connect_status[1].last_frame = i;

            if i >= 3 {
                let (sync_inputs, flags) = sync_layer.synchronized_inputs(&dummy_connect_status);
                assert_eq!(flags, 0);
                assert_eq!(sync_inputs[0].input()[0], i as u8 - p1_delay as u8);
                assert_eq!(sync_inputs[1].input()[0], i as u8 - p2_delay as u8);
            }

            sync_layer.advance_frame();
        }
    }

    #[test]
    fn test_disconnected_players_are_masked() {
        let mut sync_layer = SyncLayer::new(2, INPUT_SIZE, 8);
        let mut connect_status = vec![ConnectionStatus::default(); 2];
        connect_status[1].disconnected = true;
        connect_status[1].last_frame = NULL_FRAME;

        sync_layer
            .add_local_input(0, local_input(0, [1; INPUT_SIZE]))
            .unwrap();

        let (inputs, flags) = sync_layer.synchronized_inputs(&connect_status);
        assert_eq!(flags, 0b10);
        assert_eq!(inputs[1].frame, NULL_FRAME);
        assert_eq!(inputs[1].input(), &[0; INPUT_SIZE]);
    }

    #[test]
    fn test_rollback_on_incorrect_prediction() {
        let mut sync_layer = SyncLayer::new(2, INPUT_SIZE, 8);
        let mut interface = RecordingInterface::new();
        let mut connect_status = vec![ConnectionStatus::default(); 2];

        // run frames 0..=4 with player 1's input predicted from nothing (all zero)
        for i in 0..5 {
            sync_layer
                .add_local_input(0, local_input(i, [1, 0, 0, 0]))
                .unwrap();
            connect_status[0].last_frame = i;
            sync_layer.save_current_frame(&mut interface);
            let (inputs, flags) = sync_layer.synchronized_inputs(&connect_status);
            interface.advance_frame(inputs, flags);
            sync_layer.advance_frame();
        }
        assert_eq!(sync_layer.current_frame(), 5);
        assert_eq!(interface.saved_frames, vec![0, 1, 2, 3, 4]);

        // the remote inputs arrive: frames 0..=2 match the prediction, frame 3 does not
        for i in 0..3 {
            sync_layer.add_remote_input(1, local_input(i, [0, 0, 0, 0]));
            connect_status[1].last_frame = i;
        }
        sync_layer.add_remote_input(1, local_input(3, [9, 0, 0, 0]));
        connect_status[1].last_frame = 3;

        let first_incorrect = sync_layer.check_simulation_consistency(NULL_FRAME);
        assert_eq!(first_incorrect, 3);

        interface.ticked.clear();
        sync_layer.adjust_simulation(&mut interface, &connect_status, first_incorrect);

        // the engine loaded the state entering frame 3 exactly once and replayed frames 3 and 4
        assert_eq!(interface.loaded_frames, vec![3]);
        assert_eq!(interface.ticked.len(), 2);
        assert_eq!(interface.ticked[0][0].frame, 3);
        assert_eq!(interface.ticked[0][1].input(), &[9, 0, 0, 0]);
        assert_eq!(interface.ticked[1][0].frame, 4);
        assert_eq!(sync_layer.current_frame(), 5);
        assert!(!sync_layer.in_rollback());

        // no queue may still report a misprediction at or before the current frame
        assert_eq!(sync_layer.check_simulation_consistency(NULL_FRAME), NULL_FRAME);
    }

    #[test]
    fn test_saved_frame_checksum_lookup() {
        let mut sync_layer = SyncLayer::new(1, INPUT_SIZE, 8);
        let mut interface = RecordingInterface::new();
        sync_layer.save_current_frame(&mut interface);
        assert!(sync_layer.saved_frame_checksum(0).is_some());
        assert!(sync_layer.saved_frame_checksum(1).is_none());
    }
}
