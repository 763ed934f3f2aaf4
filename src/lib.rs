//! # Rollnet
//! Rollnet is a peer-to-peer rollback networking library for deterministic, lock-step simulations 🦀.
//! Each peer runs the simulation locally with its own inputs and predicted inputs for everyone else,
//! then rolls back and re-simulates whenever the authoritative remote inputs contradict a prediction.

#![forbid(unsafe_code)] // let us try

pub use error::RollnetError;
pub use frame_info::{GameInput, GameState};
pub use network::network_stats::NetworkStats;
pub use network::udp_msg::UdpMessage;
pub use network::udp_socket::{NonBlockingSocket, UdpNonBlockingSocket};
pub use sessions::builder::SessionBuilder;
pub use sessions::p2p_session::P2PSession;
pub use sessions::p2p_spectator_session::SpectatorSession;
pub use sessions::sync_test_session::SyncTestSession;

pub(crate) mod error;
pub(crate) mod frame_info;
pub(crate) mod input_queue;
pub(crate) mod sync_layer;
pub(crate) mod time_sync;
pub(crate) mod sessions {
    pub(crate) mod builder;
    pub(crate) mod p2p_session;
    pub(crate) mod p2p_spectator_session;
    pub(crate) mod sync_test_session;
}
pub(crate) mod network {
    pub(crate) mod network_stats;
    pub(crate) mod udp_msg;
    pub(crate) mod udp_protocol;
    pub(crate) mod udp_socket;
}

// #############
// # CONSTANTS #
// #############

/// The maximum number of players allowed.
pub const MAX_PLAYERS: usize = 4;
/// The maximum number of spectators allowed.
pub const MAX_SPECTATORS: usize = 8;
/// The default maximum number of frames rollnet will roll back. Every gamestate older than this is guaranteed to be correct if the players did not disconnect.
pub const MAX_PREDICTION_FRAMES: usize = 8;
/// The maximum input delay that can be set.
pub const MAX_INPUT_DELAY: u32 = 10;
/// The maximum number of bytes the input of a single player can consist of.
pub const MAX_INPUT_BYTES: usize = 8;
/// Internally, -1 represents no frame / invalid frame.
pub const NULL_FRAME: i32 = -1;

/// Spectators are identified by player handles above this offset.
pub(crate) const SPECTATOR_PLAYER_HANDLE_OFFSET: usize = 1000;

pub type Frame = i32;
pub type PlayerHandle = usize;

// #############
// #   ENUMS   #
// #############

/// Defines the three types of players that rollnet considers:
/// - local players, who play on the local device,
/// - remote players, who play on other devices and
/// - spectators, who receive the confirmed inputs of all players, but do not contribute any input themselves.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub enum PlayerType {
    /// This player plays on the local device.
    Local,
    /// This player plays on a remote device identified by the socket address.
    Remote(std::net::SocketAddr),
    /// This player spectates on a remote device identified by the socket address. They do not contribute to the game input.
    Spectator(std::net::SocketAddr),
}

impl Default for PlayerType {
    fn default() -> Self {
        Self::Local
    }
}

/// A session is always in one of these states. You can query the current state of a session via `current_state()`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// When initializing, you must add all necessary players and start the session to continue.
    Initializing,
    /// When synchronizing, the session attempts to establish a connection to the remote clients.
    Synchronizing,
    /// When running, the session has synchronized and is ready to take and transmit player input.
    Running,
}

/// Notifications delivered through [`RollnetInterface::on_event`]. Handling them is up to the user,
/// except that disconnected players should no longer be advanced by the application.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RollnetEvent {
    /// A remote peer answered a handshake probe for the first time.
    ConnectedToPeer { player_handle: PlayerHandle },
    /// The session made progress in synchronizing with a peer. After `total` roundtrips, the peers are synchronized.
    SynchronizingWithPeer {
        player_handle: PlayerHandle,
        count: u32,
        total: u32,
    },
    /// The handshake with this peer is complete.
    SynchronizedWithPeer { player_handle: PlayerHandle },
    /// All peers are synchronized, the session is ready to accept and transmit input.
    Running,
    /// The remote client has disconnected. Its inputs will be zeroed from its disconnect frame onwards.
    DisconnectedFromPeer { player_handle: PlayerHandle },
    /// Sent if rollnet recommends skipping a few frames to let slower clients catch up.
    /// If you receive this, consider sleeping `frames_ahead` frames.
    TimeSync { frames_ahead: u32 },
    /// The session has not received packets from this peer for a while and will disconnect it in `disconnect_timeout` ms.
    ConnectionInterrupted {
        player_handle: PlayerHandle,
        disconnect_timeout: u128,
    },
    /// Sent only after a `ConnectionInterrupted` event, if communication with that player has resumed.
    ConnectionResumed { player_handle: PlayerHandle },
}

// ##############
// #   TRAITS   #
// ##############

/// The `RollnetInterface` trait describes the functions your application must provide. Rollnet calls
/// them from [`RollnetSession::advance_frame`] and [`RollnetSession::idle`], once per regular tick
/// and additionally while re-simulating after a rollback. Callbacks must not panic across the
/// library boundary; report unrecoverable application errors out-of-band.
pub trait RollnetInterface {
    /// Serialize the entire content of your current game state into a [`GameState`] and return it.
    /// The returned buffer is owned by the session afterwards; do not retain references to it.
    /// The `frame` parameter is a sanity check: the state you save belongs to that frame.
    fn save_game_state(&mut self, frame: Frame) -> GameState;

    /// Called at the beginning of a rollback. The provided state is one you previously returned
    /// from [`RollnetInterface::save_game_state`]; restore your game state from it.
    fn load_game_state(&mut self, state: &GameState);

    /// Advance your game state by exactly one frame using the provided inputs, one per player in
    /// ascending handle order. Disconnected players are marked both in `disconnect_flags` (bit per
    /// handle) and by `NULL_FRAME` on their zeroed input. Never advance your game state through
    /// other means than this function.
    fn advance_frame(&mut self, inputs: Vec<GameInput>, disconnect_flags: u8);

    /// Notifications about the session, see [`RollnetEvent`].
    fn on_event(&mut self, event: RollnetEvent);
}

/// All rollnet session backends implement this trait. Operations a backend variant does not
/// support return [`RollnetError::InvalidRequest`].
pub trait RollnetSession: Sized {
    /// Must be called once for each player in the session (e.g. in a 3 player session, must be called 3 times) before starting the session.
    /// Returns the player handle rollnet uses to represent that player internally. The handle will be the same you provided,
    /// but `player_handle + 1000` for spectators. You will need the player handle to add input, change parameters or disconnect a player.
    fn add_player(
        &mut self,
        player_type: PlayerType,
        player_handle: PlayerHandle,
    ) -> Result<PlayerHandle, RollnetError>;

    /// After you are done defining and adding all players, you should start the session. Then, the synchronization process will begin.
    fn start_session(&mut self) -> Result<(), RollnetError>;

    /// Notifies rollnet of the local input for the current frame. Must be called once per frame for
    /// every local player before [`RollnetSession::advance_frame`].
    fn add_local_input(
        &mut self,
        player_handle: PlayerHandle,
        input: &[u8],
    ) -> Result<(), RollnetError>;

    /// Assembles the inputs for the current frame, one per player: confirmed inputs where available,
    /// predictions otherwise. The second return value is the disconnect bitmask (bit per handle).
    fn sync_input(&mut self) -> Result<(Vec<GameInput>, u8), RollnetError>;

    /// Call this when you are ready to advance the gamestate by a single frame. Rollnet will invoke
    /// [`RollnetInterface::advance_frame`] at least once, and additionally resolve pending
    /// mispredictions by loading and re-simulating earlier frames first.
    fn advance_frame(&mut self, interface: &mut impl RollnetInterface)
        -> Result<(), RollnetError>;

    /// Should be called periodically to give rollnet a chance to do internal work: packets are
    /// received and sent, timers fire and rollbacks can occur here.
    fn idle(&mut self, interface: &mut impl RollnetInterface) -> Result<(), RollnetError>;

    /// Disconnects a remote player from the game.
    fn disconnect_player(&mut self, player_handle: PlayerHandle) -> Result<(), RollnetError>;

    /// Fetches statistics about the quality of the network connection to the given remote player.
    fn network_stats(&self, player_handle: PlayerHandle) -> Result<NetworkStats, RollnetError>;

    /// Changes the amount of frames rollnet will delay the inputs for a local player.
    fn set_frame_delay(
        &mut self,
        frame_delay: u32,
        player_handle: PlayerHandle,
    ) -> Result<(), RollnetError>;

    /// Sets the disconnect timeout. The session will automatically disconnect a remote peer if it
    /// has not received a packet within the timeout window.
    fn set_disconnect_timeout(&mut self, timeout: std::time::Duration)
        -> Result<(), RollnetError>;

    /// Sets the time without received packets after which a [`RollnetEvent::ConnectionInterrupted`] is sent.
    fn set_disconnect_notify_delay(
        &mut self,
        notify_delay: std::time::Duration,
    ) -> Result<(), RollnetError>;

    /// Returns the current [`SessionState`] of the session.
    fn current_state(&self) -> SessionState;

    /// Shuts the session down, flushing pending outbound traffic and releasing all endpoints.
    fn close(&mut self) -> Result<(), RollnetError>;
}

// #############
// #   CLOCK   #
// #############

/// Time source for all protocol timers. Injected so tests can drive retry intervals, quality
/// probes and disconnect detection deterministically; production sessions use [`SystemClock`].
pub trait Clock {
    /// The current time in milliseconds. The epoch is irrelevant, only differences are used.
    fn now_millis(&self) -> u128;
}

/// The default [`Clock`], backed by the system wall clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u128 {
        #[cfg(not(target_arch = "wasm32"))]
        {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("Time went backwards")
                .as_millis()
        }
        #[cfg(target_arch = "wasm32")]
        {
            js_sys::Date::new_0().get_time() as u128
        }
    }
}
