#![allow(dead_code)]

use std::cell::Cell;
use std::rc::Rc;

use rand::{thread_rng, Rng};
use rollnet::{Clock, Frame, GameInput, GameState, RollnetEvent, RollnetInterface};
use serde::{Deserialize, Serialize};

pub const INPUT_SIZE: usize = 4;

/// A clock tests can advance by hand to drive retry intervals and disconnect timers.
pub struct MockClock {
    now: Cell<u128>,
}

impl MockClock {
    pub fn new(start_millis: u128) -> Rc<Self> {
        Rc::new(Self {
            now: Cell::new(start_millis),
        })
    }

    pub fn advance(&self, millis: u128) {
        self.now.set(self.now.get() + millis);
    }

    pub fn set(&self, millis: u128) {
        self.now.set(millis);
    }
}

impl Clock for MockClock {
    fn now_millis(&self) -> u128 {
        self.now.get()
    }
}

/// A game implementation that records every callback invocation, so tests can assert
/// how often the session saved, loaded and ticked and which events it delivered.
pub struct GameStub {
    pub gs: GameStateStub,
    pub saved_frames: Vec<Frame>,
    pub loaded_frames: Vec<Frame>,
    pub ticked_inputs: Vec<Vec<GameInput>>,
    pub events: Vec<RollnetEvent>,
}

impl GameStub {
    pub fn new() -> GameStub {
        GameStub {
            gs: GameStateStub { frame: 0, state: 0 },
            saved_frames: Vec::new(),
            loaded_frames: Vec::new(),
            ticked_inputs: Vec::new(),
            events: Vec::new(),
        }
    }
}

impl RollnetInterface for GameStub {
    fn save_game_state(&mut self, frame: Frame) -> GameState {
        assert_eq!(self.gs.frame, frame);
        self.saved_frames.push(frame);
        let buffer = bincode::serialize(&self.gs).unwrap();
        GameState::new(frame, Some(buffer), None)
    }

    fn load_game_state(&mut self, state: &GameState) {
        self.loaded_frames.push(state.frame);
        self.gs = bincode::deserialize(state.buffer.as_ref().unwrap()).unwrap();
    }

    fn advance_frame(&mut self, inputs: Vec<GameInput>, _disconnect_flags: u8) {
        self.gs.advance_frame(&inputs);
        self.ticked_inputs.push(inputs);
    }

    fn on_event(&mut self, event: RollnetEvent) {
        self.events.push(event);
    }
}

/// Like [`GameStub`], but reports a random checksum on every save. Used to verify that the
/// sync-test session detects non-deterministic simulations.
pub struct RandomChecksumGameStub {
    pub gs: GameStateStub,
}

impl RandomChecksumGameStub {
    pub fn new() -> RandomChecksumGameStub {
        RandomChecksumGameStub {
            gs: GameStateStub { frame: 0, state: 0 },
        }
    }
}

impl RollnetInterface for RandomChecksumGameStub {
    fn save_game_state(&mut self, frame: Frame) -> GameState {
        assert_eq!(self.gs.frame, frame);
        let buffer = bincode::serialize(&self.gs).unwrap();
        let random_checksum: u128 = thread_rng().gen();
        GameState::new(frame, Some(buffer), Some(random_checksum))
    }

    fn load_game_state(&mut self, state: &GameState) {
        self.gs = bincode::deserialize(state.buffer.as_ref().unwrap()).unwrap();
    }

    fn advance_frame(&mut self, inputs: Vec<GameInput>, _disconnect_flags: u8) {
        self.gs.advance_frame(&inputs);
    }

    fn on_event(&mut self, _event: RollnetEvent) {}
}

#[derive(Default, Serialize, Deserialize)]
pub struct GameStateStub {
    pub frame: i32,
    pub state: i32,
}

impl GameStateStub {
    fn advance_frame(&mut self, inputs: &[GameInput]) {
        let p0_inputs = u32::from_le_bytes(inputs[0].input().try_into().unwrap());
        let p1_inputs = match inputs.get(1) {
            Some(input) => u32::from_le_bytes(input.input().try_into().unwrap()),
            None => 0,
        };

        if (p0_inputs + p1_inputs) % 2 == 0 {
            self.state += 2;
        } else {
            self.state -= 1;
        }
        self.frame += 1;
    }
}
