use crate::{Frame, MAX_INPUT_BYTES, MAX_PLAYERS, NULL_FRAME};

/// The input buffer used to save the bytes of a player input. It is bigger than necessary by a factor `MAX_PLAYERS`
/// so the same type of buffer can carry the concatenated inputs of all players that the host transmits to spectators.
pub type InputBuffer = [u8; MAX_INPUT_BYTES * MAX_PLAYERS];

/// Computes the fletcher16 checksum, copied from wikipedia: <https://en.wikipedia.org/wiki/Fletcher%27s_checksum>
pub(crate) fn fletcher16(data: &[u8]) -> u16 {
    let mut sum1: u16 = 0;
    let mut sum2: u16 = 0;

    for byte in data {
        sum1 = (sum1 + *byte as u16) % 255;
        sum2 = (sum2 + sum1) % 255;
    }

    (sum2 << 8) | sum1
}

/// Represents a serialized game state of your game for a single frame. The buffer `buffer` holds your state, `frame` indicates the associated frame number
/// and `checksum` can additionally be provided for use during a [`SyncTestSession`]. You are expected to return this during `save_game_state()` and use it
/// during `load_game_state()`.
///
/// [`SyncTestSession`]: crate::SyncTestSession
#[derive(Debug, Clone)]
pub struct GameState {
    /// The frame to which this info belongs to.
    pub frame: Frame,
    /// The serialized gamestate in bytes.
    pub buffer: Option<Vec<u8>>,
    /// The checksum of the gamestate.
    pub checksum: u128,
}

impl Default for GameState {
    fn default() -> Self {
        Self {
            frame: NULL_FRAME,
            buffer: None,
            checksum: 0,
        }
    }
}

impl GameState {
    pub fn new(frame: Frame, buffer: Option<Vec<u8>>, check: Option<u128>) -> Self {
        let checksum = match check {
            Some(cs) => cs,
            None => match &buffer {
                Some(data) => fletcher16(data) as u128,
                None => 0,
            },
        };

        GameState {
            frame,
            buffer,
            checksum,
        }
    }
}

/// Represents a serialized input for a single player in a single frame. This struct holds a `buffer` where the first `size` bytes represent the encoded
/// input of a single player. The associated frame is denoted with `frame`. You do not need to create this struct yourself, the sessions hand filled-in
/// instances to [`RollnetInterface::advance_frame`].
///
/// [`RollnetInterface::advance_frame`]: crate::RollnetInterface::advance_frame
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct GameInput {
    /// The frame to which this info belongs to. -1/[`NULL_FRAME`] represents an invalid frame.
    pub frame: Frame,
    // The input size
    pub size: usize,
    /// An input buffer that holds the input data.
    pub buffer: InputBuffer,
    /// Checksum over the first `size` bytes of the buffer, carried on the wire alongside the bits.
    pub checksum: u32,
}

impl Default for GameInput {
    fn default() -> Self {
        Self {
            frame: NULL_FRAME,
            size: 0,
            buffer: Default::default(),
            checksum: 0,
        }
    }
}

impl GameInput {
    pub(crate) fn new(frame: Frame, size: usize) -> Self {
        assert!(size > 0);
        Self {
            frame,
            size,
            buffer: Default::default(),
            checksum: 0,
        }
    }

    /// A zeroed input of the given size with an invalid frame, handed out for disconnected players.
    pub(crate) fn blank_input(size: usize) -> Self {
        Self::new(NULL_FRAME, size)
    }

    pub(crate) fn copy_input(&mut self, bytes: &[u8]) {
        assert!(bytes.len() == self.size);
        self.buffer[0..self.size].copy_from_slice(bytes);
        self.checksum = fletcher16(bytes) as u32;
    }

    pub(crate) fn erase_bits(&mut self) {
        self.buffer.iter_mut().for_each(|m| *m = 0);
        self.checksum = 0;
    }

    /// Compares two inputs. During prediction checks, a confirmation for a frame is compared
    /// against the prediction served for that frame, so `bitsonly` ignores the frame numbers.
    pub(crate) fn equal(&self, other: &Self, bitsonly: bool) -> bool {
        (bitsonly || self.frame == other.frame)
            && self.size == other.size
            && self.buffer == other.buffer
    }

    /// Retrieve your serialized input with this method. Returns a slice which you can use to deserialize.
    pub fn input(&self) -> &[u8] {
        &self.buffer[0..self.size]
    }
}

// #########
// # TESTS #
// #########
