use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::network::udp_protocol::UdpProtocol;
use crate::network::udp_socket::NonBlockingSocket;
use crate::sessions::p2p_spectator_session::SPECTATOR_BUFFER_SIZE;
use crate::{
    Clock, P2PSession, RollnetError, SpectatorSession, SyncTestSession, SystemClock,
    MAX_INPUT_BYTES, MAX_INPUT_DELAY, MAX_PLAYERS, MAX_PREDICTION_FRAMES,
};

const DEFAULT_PLAYERS: usize = 2;
const DEFAULT_INPUT_DELAY: u32 = 0;
const DEFAULT_CHECK_DISTANCE: u32 = 2;
pub(crate) const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_millis(2000);
pub(crate) const DEFAULT_DISCONNECT_NOTIFY_START: Duration = Duration::from_millis(500);
pub(crate) const DEFAULT_FPS: u32 = 60;
// If the spectator is more than this amount of frames behind, it will advance the game in bigger steps to catch up
const DEFAULT_MAX_FRAMES_BEHIND: usize = 10;
// The amount of frames the spectator advances in a single step if too far behind
const DEFAULT_CATCHUP_SPEED: usize = 1;

/// Builds the session variants. The builder collects everything that must be known before the
/// first endpoint exists: player count, input size, prediction window, timing configuration, the
/// clock and the RNG seed. Players are added to the constructed session afterwards.
pub struct SessionBuilder {
    num_players: usize,
    input_size: usize,
    max_prediction: usize,
    fps: u32,
    input_delay: u32,
    disconnect_timeout: Duration,
    disconnect_notify_start: Duration,
    check_distance: u32,
    max_frames_behind: usize,
    catchup_speed: usize,
    clock: Rc<dyn Clock>,
    rng_seed: Option<u64>,
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self {
            num_players: DEFAULT_PLAYERS,
            input_size: 4,
            max_prediction: MAX_PREDICTION_FRAMES,
            fps: DEFAULT_FPS,
            input_delay: DEFAULT_INPUT_DELAY,
            disconnect_timeout: DEFAULT_DISCONNECT_TIMEOUT,
            disconnect_notify_start: DEFAULT_DISCONNECT_NOTIFY_START,
            check_distance: DEFAULT_CHECK_DISTANCE,
            max_frames_behind: DEFAULT_MAX_FRAMES_BEHIND,
            catchup_speed: DEFAULT_CATCHUP_SPEED,
            clock: Rc::new(SystemClock),
            rng_seed: None,
        }
    }

    /// Changes the number of total players. Default is 2.
    pub fn with_num_players(mut self, num_players: usize) -> Self {
        self.num_players = num_players;
        self
    }

    /// Changes the size in bytes of the input of a single player. Default is 4.
    pub fn with_input_size(mut self, input_size: usize) -> Self {
        self.input_size = input_size;
        self
    }

    /// Changes the maximum prediction window. Default is 8.
    pub fn with_max_prediction_window(mut self, window: usize) -> Self {
        self.max_prediction = window;
        self
    }

    /// Changes the amount of frames rollnet will delay the inputs of local players.
    pub fn with_input_delay(mut self, delay: u32) -> Self {
        self.input_delay = delay;
        self
    }

    /// Sets the disconnect timeout. The session will automatically disconnect a remote peer if it
    /// has not received a packet within the timeout window.
    pub fn with_disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    /// Sets the time without received packets before the first
    /// [`RollnetEvent::ConnectionInterrupted`] is sent.
    ///
    /// [`RollnetEvent::ConnectionInterrupted`]: crate::RollnetEvent::ConnectionInterrupted
    pub fn with_disconnect_notify_delay(mut self, notify_delay: Duration) -> Self {
        self.disconnect_notify_start = notify_delay;
        self
    }

    /// Sets the FPS this session is used with. This influences the estimate of how many frames
    /// the peers are apart.
    /// # Errors
    /// - Returns `InvalidRequest` if the FPS is 0.
    pub fn with_fps(mut self, fps: u32) -> Result<Self, RollnetError> {
        if fps == 0 {
            return Err(RollnetError::InvalidRequest {
                info: "FPS should be higher than 0.".to_owned(),
            });
        }
        self.fps = fps;
        Ok(self)
    }

    /// Changes the check distance of sync-test sessions. Default is 2.
    pub fn with_check_distance(mut self, check_distance: u32) -> Self {
        self.check_distance = check_distance;
        self
    }

    /// Sets the maximum frames behind. If the spectator is more than this amount of frames behind
    /// the received inputs, it will catch up with `catchup_speed` frames per step.
    /// # Errors
    /// - Returns `InvalidRequest` for values that the spectator input buffer cannot support.
    pub fn with_max_frames_behind(mut self, max_frames_behind: usize) -> Result<Self, RollnetError> {
        if max_frames_behind < 1 {
            return Err(RollnetError::InvalidRequest {
                info: "Max frames behind cannot be smaller than 1.".to_owned(),
            });
        }
        if max_frames_behind >= SPECTATOR_BUFFER_SIZE {
            return Err(RollnetError::InvalidRequest {
                info: "Max frames behind cannot be larger or equal than the spectator buffer size."
                    .to_owned(),
            });
        }
        self.max_frames_behind = max_frames_behind;
        Ok(self)
    }

    /// Sets the catchup speed. Per default, this is 1, so the spectator never catches up.
    /// # Errors
    /// - Returns `InvalidRequest` for speeds incompatible with `max_frames_behind`.
    pub fn with_catchup_speed(mut self, catchup_speed: usize) -> Result<Self, RollnetError> {
        if catchup_speed < 1 {
            return Err(RollnetError::InvalidRequest {
                info: "Catchup speed cannot be smaller than 1.".to_owned(),
            });
        }
        if catchup_speed >= self.max_frames_behind {
            return Err(RollnetError::InvalidRequest {
                info: "Catchup speed cannot be larger or equal than the maximum frames behind."
                    .to_owned(),
            });
        }
        self.catchup_speed = catchup_speed;
        Ok(self)
    }

    /// Replaces the wall clock that drives all protocol timers. Tests inject a manually advanced
    /// clock here to make retries, quality probes and disconnect detection deterministic.
    pub fn with_clock(mut self, clock: Rc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Seeds the session RNG. Magic numbers, handshake nonces and send-pump jitter become
    /// deterministic; without a seed they are drawn from entropy.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Consumes the builder to construct a [`P2PSession`] that communicates over the given socket.
    /// Register players with [`RollnetSession::add_player`] and then start the session.
    ///
    /// [`RollnetSession::add_player`]: crate::RollnetSession::add_player
    /// # Errors
    /// - Returns `InvalidRequest` for unsupported player counts or input sizes.
    pub fn start_p2p_session(
        self,
        socket: impl NonBlockingSocket + 'static,
    ) -> Result<P2PSession, RollnetError> {
        self.validate()?;
        let rng = self.build_rng();
        Ok(P2PSession::new(
            self.num_players,
            self.input_size,
            self.max_prediction,
            self.fps,
            self.input_delay,
            self.disconnect_timeout,
            self.disconnect_notify_start,
            Box::new(socket),
            self.clock,
            rng,
        ))
    }

    /// Consumes the builder to construct a [`SpectatorSession`] that receives the confirmed
    /// inputs of all players from the given host. The spectator starts synchronizing immediately.
    /// # Errors
    /// - Returns `InvalidRequest` for unsupported player counts or input sizes.
    pub fn start_spectator_session(
        self,
        host_addr: SocketAddr,
        socket: impl NonBlockingSocket + 'static,
    ) -> Result<SpectatorSession, RollnetError> {
        self.validate()?;
        let mut rng = self.build_rng();
        // the host sends the inputs of all players in one merged record
        let mut host = UdpProtocol::new(
            0,
            host_addr,
            self.num_players,
            self.input_size * self.num_players,
            rng.gen(),
        );
        host.set_disconnect_timeout(self.disconnect_timeout);
        host.set_disconnect_notify_start(self.disconnect_notify_start);
        host.set_fps(self.fps);
        host.synchronize(self.clock.now_millis());
        Ok(SpectatorSession::new(
            self.num_players,
            self.input_size,
            Box::new(socket),
            host,
            self.clock,
            self.max_frames_behind,
            self.catchup_speed,
        ))
    }

    /// Consumes the builder to construct a [`SyncTestSession`]. During a sync test, rollnet
    /// rolls back every frame and resimulates the last `check_distance` states, comparing the
    /// resimulated checksums with the original ones. This is a great way to test whether your
    /// game state updates deterministically.
    /// # Errors
    /// - Returns `InvalidRequest` if the check distance does not fit the prediction window.
    pub fn start_synctest_session(self) -> Result<SyncTestSession, RollnetError> {
        self.validate()?;
        if self.check_distance >= self.max_prediction as u32 {
            return Err(RollnetError::InvalidRequest {
                info: "Check distance too big.".to_owned(),
            });
        }
        Ok(SyncTestSession::new(
            self.num_players,
            self.input_size,
            self.max_prediction,
            self.check_distance,
            self.input_delay,
        ))
    }

    fn validate(&self) -> Result<(), RollnetError> {
        if self.num_players < 1 || self.num_players > MAX_PLAYERS {
            return Err(RollnetError::InvalidRequest {
                info: format!("Sessions support 1 to {} players.", MAX_PLAYERS),
            });
        }
        if self.input_size < 1 || self.input_size > MAX_INPUT_BYTES {
            return Err(RollnetError::InvalidRequest {
                info: format!("Inputs may be 1 to {} bytes big.", MAX_INPUT_BYTES),
            });
        }
        if self.max_prediction < 1 {
            return Err(RollnetError::InvalidRequest {
                info: "The prediction window must be at least 1.".to_owned(),
            });
        }
        if self.input_delay > MAX_INPUT_DELAY {
            return Err(RollnetError::InvalidRequest {
                info: format!("The input delay may be at most {} frames.", MAX_INPUT_DELAY),
            });
        }
        Ok(())
    }

    fn build_rng(&self) -> StdRng {
        match self.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }
}
