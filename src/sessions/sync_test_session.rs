use std::collections::HashMap;
use std::time::Duration;

use crate::error::RollnetError;
use crate::frame_info::GameInput;
use crate::network::network_stats::NetworkStats;
use crate::network::udp_msg::ConnectionStatus;
use crate::sync_layer::SyncLayer;
use crate::{
    PlayerHandle, PlayerType, RollnetInterface, RollnetSession, SessionState, NULL_FRAME,
};

/// During a `SyncTestSession`, rollnet rolls the gamestate back every frame and resimulates the
/// last `check_distance` frames through the regular callbacks. If the checksums of the resimulated
/// states do not match the checksums of the original saves, the game state does not update
/// deterministically and a rollback in a real session would desync.
pub struct SyncTestSession {
    num_players: usize,
    input_size: usize,
    check_distance: u32,
    running: bool,
    sync_layer: SyncLayer,
    dummy_connect_status: Vec<ConnectionStatus>,
    registered_players: HashMap<PlayerHandle, PlayerType>,
    input_delay: u32,
}

impl SyncTestSession {
    pub(crate) fn new(
        num_players: usize,
        input_size: usize,
        max_prediction: usize,
        check_distance: u32,
        input_delay: u32,
    ) -> Self {
        let mut dummy_connect_status = Vec::new();
        for _ in 0..num_players {
            dummy_connect_status.push(ConnectionStatus::default());
        }
        Self {
            num_players,
            input_size,
            check_distance,
            running: false,
            sync_layer: SyncLayer::new(num_players, input_size, max_prediction),
            dummy_connect_status,
            registered_players: HashMap::new(),
            input_delay,
        }
    }

    /// Replays the last `check_distance` frames through the callbacks and compares the checksums
    /// of the resimulated states with the original saves.
    fn check_determinism(
        &mut self,
        interface: &mut impl RollnetInterface,
    ) -> Result<(), RollnetError> {
        let current = self.sync_layer.current_frame();
        let frame_to_load = current - self.check_distance as i32;

        // remember the checksums of the states we are about to resimulate
        let mut original_checksums = Vec::new();
        for frame in (frame_to_load + 1)..current {
            original_checksums.push((
                frame,
                self.sync_layer
                    .saved_frame_checksum(frame)
                    .expect("resimulated frame was not saved"),
            ));
        }

        self.sync_layer.load_frame(frame_to_load, interface);
        for (frame, original_checksum) in original_checksums {
            let (inputs, disconnect_flags) = self
                .sync_layer
                .synchronized_inputs(&self.dummy_connect_status);
            interface.advance_frame(inputs, disconnect_flags);
            self.sync_layer.advance_frame();
            self.sync_layer.save_current_frame(interface);

            assert_eq!(self.sync_layer.current_frame(), frame);
            let resimulated_checksum = self
                .sync_layer
                .saved_frame_checksum(frame)
                .expect("resimulated frame was not saved");
            if resimulated_checksum != original_checksum {
                return Err(RollnetError::MismatchedChecksum { frame });
            }
        }

        // replay the final step to arrive back where we started
        let (inputs, disconnect_flags) = self
            .sync_layer
            .synchronized_inputs(&self.dummy_connect_status);
        interface.advance_frame(inputs, disconnect_flags);
        self.sync_layer.advance_frame();
        assert_eq!(self.sync_layer.current_frame(), current);

        // all inputs of a sync test are local, so they are all confirmed
        self.sync_layer.set_last_confirmed_frame(frame_to_load);
        for handle in 0..self.num_players {
            self.dummy_connect_status[handle].last_frame =
                self.sync_layer.last_confirmed_frame_for(handle);
        }
        Ok(())
    }
}

impl RollnetSession for SyncTestSession {
    /// Must be called once for each player. A sync test only supports local players.
    fn add_player(
        &mut self,
        player_type: PlayerType,
        player_handle: PlayerHandle,
    ) -> Result<PlayerHandle, RollnetError> {
        if self.running {
            return Err(RollnetError::InvalidRequest {
                info: "Session already started.".to_owned(),
            });
        }
        if player_handle >= self.num_players {
            return Err(RollnetError::InvalidHandle);
        }
        if player_type != PlayerType::Local {
            return Err(RollnetError::InvalidRequest {
                info: "Sync test sessions only support local players.".to_owned(),
            });
        }
        self.sync_layer
            .set_frame_delay(player_handle, self.input_delay);
        self.registered_players.insert(player_handle, player_type);
        Ok(player_handle)
    }

    fn start_session(&mut self) -> Result<(), RollnetError> {
        if self.running {
            return Err(RollnetError::InvalidRequest {
                info: "Session already started.".to_owned(),
            });
        }
        for player_handle in 0..self.num_players {
            if !self.registered_players.contains_key(&player_handle) {
                return Err(RollnetError::InvalidRequest {
                    info: "Not enough players have been added. Keep registering players up to the defined player number.".to_owned(),
                });
            }
        }
        self.running = true;
        Ok(())
    }

    fn add_local_input(
        &mut self,
        player_handle: PlayerHandle,
        input: &[u8],
    ) -> Result<(), RollnetError> {
        if !self.running {
            return Err(RollnetError::NotSynchronized);
        }
        if player_handle >= self.num_players {
            return Err(RollnetError::InvalidHandle);
        }
        if input.len() != self.input_size {
            return Err(RollnetError::InvalidRequest {
                info: "The provided input does not match the registered input size.".to_owned(),
            });
        }

        let mut game_input = GameInput::new(self.sync_layer.current_frame(), self.input_size);
        game_input.copy_input(input);
        let actual_frame = self.sync_layer.add_local_input(player_handle, game_input)?;
        if actual_frame != NULL_FRAME {
            self.dummy_connect_status[player_handle].last_frame = actual_frame;
        }
        Ok(())
    }

    fn sync_input(&mut self) -> Result<(Vec<GameInput>, u8), RollnetError> {
        if !self.running {
            return Err(RollnetError::NotSynchronized);
        }
        Ok(self
            .sync_layer
            .synchronized_inputs(&self.dummy_connect_status))
    }

    /// Advances the gamestate by one frame, then simulates a rollback over the last
    /// `check_distance` frames and compares the resimulated checksums against the originals.
    fn advance_frame(
        &mut self,
        interface: &mut impl RollnetInterface,
    ) -> Result<(), RollnetError> {
        if !self.running {
            return Err(RollnetError::NotSynchronized);
        }

        // save the state entering the current frame, then tick
        self.sync_layer.save_current_frame(interface);
        let (inputs, disconnect_flags) = self
            .sync_layer
            .synchronized_inputs(&self.dummy_connect_status);
        for input in &inputs {
            assert_eq!(input.frame, self.sync_layer.current_frame());
        }
        interface.advance_frame(inputs, disconnect_flags);
        self.sync_layer.advance_frame();

        // once enough frames have passed, verify determinism by rolling back and resimulating
        if self.sync_layer.current_frame() > self.check_distance as i32 {
            self.check_determinism(interface)?;
        }

        Ok(())
    }

    fn idle(&mut self, _interface: &mut impl RollnetInterface) -> Result<(), RollnetError> {
        // a sync test has no network to service
        Ok(())
    }

    fn disconnect_player(&mut self, _player_handle: PlayerHandle) -> Result<(), RollnetError> {
        Err(RollnetError::InvalidRequest {
            info: "Sync test sessions have no remote players to disconnect.".to_owned(),
        })
    }

    fn network_stats(&self, _player_handle: PlayerHandle) -> Result<NetworkStats, RollnetError> {
        Err(RollnetError::InvalidRequest {
            info: "Sync test sessions have no network connection.".to_owned(),
        })
    }

    fn set_frame_delay(
        &mut self,
        frame_delay: u32,
        player_handle: PlayerHandle,
    ) -> Result<(), RollnetError> {
        if player_handle >= self.num_players {
            return Err(RollnetError::InvalidHandle);
        }
        if frame_delay > crate::MAX_INPUT_DELAY {
            return Err(RollnetError::InvalidRequest {
                info: format!(
                    "The input delay may be at most {} frames.",
                    crate::MAX_INPUT_DELAY
                ),
            });
        }
        self.input_delay = frame_delay;
        self.sync_layer.set_frame_delay(player_handle, frame_delay);
        Ok(())
    }

    fn set_disconnect_timeout(&mut self, _timeout: Duration) -> Result<(), RollnetError> {
        Err(RollnetError::InvalidRequest {
            info: "Sync test sessions have no network connection.".to_owned(),
        })
    }

    fn set_disconnect_notify_delay(&mut self, _notify_delay: Duration) -> Result<(), RollnetError> {
        Err(RollnetError::InvalidRequest {
            info: "Sync test sessions have no network connection.".to_owned(),
        })
    }

    fn current_state(&self) -> SessionState {
        if self.running {
            SessionState::Running
        } else {
            SessionState::Initializing
        }
    }

    fn close(&mut self) -> Result<(), RollnetError> {
        self.running = false;
        Ok(())
    }
}
