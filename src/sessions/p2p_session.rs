use crate::error::RollnetError;
use crate::frame_info::GameInput;
use crate::network::network_stats::NetworkStats;
use crate::network::udp_msg::ConnectionStatus;
use crate::network::udp_protocol::{Event, UdpProtocol};
use crate::network::udp_socket::NonBlockingSocket;
use crate::sync_layer::SyncLayer;
use crate::{
    Clock, Frame, PlayerHandle, PlayerType, RollnetEvent, RollnetInterface, RollnetSession,
    SessionState, MAX_INPUT_DELAY, MAX_SPECTATORS, NULL_FRAME, SPECTATOR_PLAYER_HANDLE_OFFSET,
};

use rand::rngs::StdRng;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;
use tracing::debug;

/// The minimum amount of frames between two `TimeSync` recommendations.
const RECOMMENDATION_INTERVAL: Frame = 40;
const MAX_EVENT_QUEUE_SIZE: usize = 100;

#[derive(Debug, PartialEq, Eq)]
enum Player {
    Local,
    Remote(Box<UdpProtocol>),
    Spectator(Box<UdpProtocol>),
}

impl Player {
    fn as_endpoint_mut(&mut self) -> Option<&mut UdpProtocol> {
        match self {
            Player::Remote(endpoint) => Some(endpoint),
            Player::Spectator(endpoint) => Some(endpoint),
            Player::Local => None,
        }
    }

    const fn remote_as_endpoint(&self) -> Option<&UdpProtocol> {
        match self {
            Player::Remote(endpoint) => Some(endpoint),
            Player::Spectator(_) | Player::Local => None,
        }
    }

    fn remote_as_endpoint_mut(&mut self) -> Option<&mut UdpProtocol> {
        match self {
            Player::Remote(endpoint) => Some(endpoint),
            Player::Spectator(_) | Player::Local => None,
        }
    }

    fn spectator_as_endpoint_mut(&mut self) -> Option<&mut UdpProtocol> {
        match self {
            Player::Spectator(endpoint) => Some(endpoint),
            Player::Remote(_) | Player::Local => None,
        }
    }
}

/// A `P2PSession` connects to remote clients in a peer-to-peer fashion and exchanges inputs with
/// them over best-effort datagrams. Inbound datagrams are routed to one endpoint per remote peer
/// by source address; the session aggregates the endpoints' views into the consensus state the
/// rollback engine needs.
pub struct P2PSession {
    /// The number of players of the session.
    num_players: usize,
    /// The number of bytes an input uses.
    input_size: usize,
    /// The sync layer owns the input queues, the saved states and the rollback logic.
    sync_layer: SyncLayer,
    /// The expected update frequency of the session, used for frame advantage estimation.
    fps: u32,
    /// The delay in frames applied to local inputs.
    input_delay: u32,

    /// The time until a remote player gets disconnected.
    disconnect_timeout: Duration,
    /// The time until the user is notified that a remote player is about to be disconnected.
    disconnect_notify_start: Duration,
    /// If a disconnect for a player arrives for an earlier frame than we already simulated,
    /// we have to roll back from that frame to replace their inputs with zeroes.
    disconnect_frame: Frame,

    /// Internal state of the session.
    state: SessionState,

    /// The session sends and receives all messages for remote players over this socket.
    socket: Box<dyn NonBlockingSocket>,
    /// Maps player handles to local players and the endpoints of remote players and spectators.
    players: HashMap<PlayerHandle, Player>,
    /// What we know about every player: whether they disconnected and the last frame we got input for.
    local_connect_status: Vec<ConnectionStatus>,

    /// Notes which frames have already been sent to the spectators.
    next_spectator_frame: Frame,
    /// The earliest frame at which the session may emit the next `TimeSync` recommendation.
    next_recommended_sleep: Frame,

    /// Events waiting to be handed to `RollnetInterface::on_event` at the next poll.
    event_queue: VecDeque<RollnetEvent>,

    /// Drives all protocol timers.
    clock: Rc<dyn Clock>,
    /// Master RNG; every endpoint derives its own deterministic stream from it.
    rng: StdRng,
}

impl P2PSession {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        num_players: usize,
        input_size: usize,
        max_prediction: usize,
        fps: u32,
        input_delay: u32,
        disconnect_timeout: Duration,
        disconnect_notify_start: Duration,
        socket: Box<dyn NonBlockingSocket>,
        clock: Rc<dyn Clock>,
        rng: StdRng,
    ) -> Self {
        let mut local_connect_status = Vec::new();
        for _ in 0..num_players {
            local_connect_status.push(ConnectionStatus::default());
        }

        Self {
            num_players,
            input_size,
            sync_layer: SyncLayer::new(num_players, input_size, max_prediction),
            fps,
            input_delay,
            disconnect_timeout,
            disconnect_notify_start,
            disconnect_frame: NULL_FRAME,
            state: SessionState::Initializing,
            socket,
            players: HashMap::new(),
            local_connect_status,
            next_spectator_frame: 0,
            next_recommended_sleep: 0,
            event_queue: VecDeque::new(),
            clock,
            rng,
        }
    }

    fn add_local_player(&mut self, player_handle: PlayerHandle) -> Result<PlayerHandle, RollnetError> {
        if player_handle >= self.num_players {
            return Err(RollnetError::InvalidHandle);
        }

        if self.players.contains_key(&player_handle) {
            return Err(RollnetError::InvalidRequest {
                info: "Player handle already exists.".to_owned(),
            });
        }

        // more than one local player would need its own input queue handling per handle,
        // which the input distribution to remote endpoints does not support
        if self.players.values().any(|p| matches!(p, Player::Local)) {
            return Err(RollnetError::InvalidRequest {
                info: "Local player already registered. It is not possible to add more than one local player.".to_owned(),
            });
        }

        self.sync_layer
            .set_frame_delay(player_handle, self.input_delay);
        self.players.insert(player_handle, Player::Local);
        Ok(player_handle)
    }

    fn add_remote_player(
        &mut self,
        player_handle: PlayerHandle,
        addr: std::net::SocketAddr,
    ) -> Result<PlayerHandle, RollnetError> {
        if player_handle >= self.num_players {
            return Err(RollnetError::InvalidHandle);
        }

        if self.players.contains_key(&player_handle) {
            return Err(RollnetError::InvalidRequest {
                info: "Player handle already exists.".to_owned(),
            });
        }

        // create an endpoint that handles all the messaging to that remote player
        let mut endpoint = UdpProtocol::new(
            player_handle,
            addr,
            self.num_players,
            self.input_size,
            self.rng.gen(),
        );
        endpoint.set_disconnect_timeout(self.disconnect_timeout);
        endpoint.set_disconnect_notify_start(self.disconnect_notify_start);
        endpoint.set_fps(self.fps);
        endpoint.set_local_frame_delay(self.input_delay);

        // remote players apply their input delay on their own end
        self.sync_layer.set_frame_delay(player_handle, 0);

        self.players
            .insert(player_handle, Player::Remote(Box::new(endpoint)));
        Ok(player_handle)
    }

    fn add_spectator(
        &mut self,
        player_handle: PlayerHandle,
        addr: std::net::SocketAddr,
    ) -> Result<PlayerHandle, RollnetError> {
        let spectator_handle = player_handle + SPECTATOR_PLAYER_HANDLE_OFFSET;

        if self.players.contains_key(&spectator_handle) {
            return Err(RollnetError::InvalidRequest {
                info: "Player handle already exists.".to_owned(),
            });
        }

        if self.num_spectators() >= MAX_SPECTATORS {
            return Err(RollnetError::InvalidRequest {
                info: format!("Sessions support at most {} spectators.", MAX_SPECTATORS),
            });
        }

        // spectators receive the merged inputs of all players in one record
        let mut endpoint = UdpProtocol::new(
            spectator_handle,
            addr,
            self.num_players,
            self.input_size * self.num_players,
            self.rng.gen(),
        );
        endpoint.set_disconnect_timeout(self.disconnect_timeout);
        endpoint.set_disconnect_notify_start(self.disconnect_notify_start);
        endpoint.set_fps(self.fps);

        self.players
            .insert(spectator_handle, Player::Spectator(Box::new(endpoint)));
        Ok(spectator_handle)
    }

    /// Receives datagrams, advances all endpoint state machines, resolves pending rollbacks and
    /// pushes due outbound traffic. This is the single place where time-based protocol work runs.
    fn do_poll(&mut self, interface: &mut impl RollnetInterface) {
        let now = self.clock.now_millis();

        // route inbound messages to the endpoint handling the sender address
        let messages = self.socket.receive_all_messages();
        for (from, msg) in &messages {
            for endpoint in self
                .players
                .values_mut()
                .filter_map(Player::as_endpoint_mut)
            {
                if endpoint.is_handling_message(from) {
                    endpoint.handle_message(msg, now);
                    break;
                }
            }
        }

        // update the frame advantage estimates towards all remote players
        let current_frame = self.sync_layer.current_frame();
        for endpoint in self
            .players
            .values_mut()
            .filter_map(Player::remote_as_endpoint_mut)
        {
            if endpoint.is_running() {
                endpoint.update_local_frame_advantage(current_frame);
            }
        }

        // run the endpoint timers, then handle whatever events they produced
        let mut events = VecDeque::new();
        for endpoint in self
            .players
            .values_mut()
            .filter_map(Player::as_endpoint_mut)
        {
            let player_handle = endpoint.player_handle();
            for event in endpoint.poll(&self.local_connect_status, now) {
                events.push_back((event, player_handle));
            }
        }
        for (event, handle) in events.drain(..) {
            self.handle_event(event, handle);
        }

        if self.state == SessionState::Running {
            // find the frame every player has confirmed inputs through, propagating disconnects
            let min_confirmed = self.min_confirmed_frame();

            // if any prediction turned out wrong (or a disconnect invalidated frames), re-simulate.
            // This must happen before inputs for the current frame are served.
            let first_incorrect = self
                .sync_layer
                .check_simulation_consistency(self.disconnect_frame);
            if first_incorrect != NULL_FRAME {
                self.sync_layer.adjust_simulation(
                    interface,
                    &self.local_connect_status,
                    first_incorrect,
                );
                self.disconnect_frame = NULL_FRAME;
            }

            // stream fully confirmed inputs to the spectators, then discard them
            self.send_confirmed_inputs_to_spectators(min_confirmed, now);
            self.sync_layer.set_last_confirmed_frame(min_confirmed);

            // check time sync and recommend a stall if we are running away from the others
            if self.sync_layer.current_frame() > self.next_recommended_sleep {
                let frames_ahead = self.max_delay_recommendation(true);
                if frames_ahead > 0 {
                    self.next_recommended_sleep =
                        self.sync_layer.current_frame() + RECOMMENDATION_INTERVAL;
                    self.push_event(RollnetEvent::TimeSync { frames_ahead });
                }
            }
        }

        // push all due outbound messages onto the transport
        for endpoint in self
            .players
            .values_mut()
            .filter_map(Player::as_endpoint_mut)
        {
            endpoint.send_all_messages(&mut *self.socket, now);
        }

        // hand the collected session events to the application
        while let Some(event) = self.event_queue.pop_front() {
            interface.on_event(event);
        }
    }

    fn push_event(&mut self, event: RollnetEvent) {
        self.event_queue.push_back(event);
        // drop the oldest events if the application has not polled for a long time
        while self.event_queue.len() > MAX_EVENT_QUEUE_SIZE {
            self.event_queue.pop_front();
        }
    }

    /// Handle events received from the endpoints. Most are forwarded to the user, some require action.
    fn handle_event(&mut self, event: Event, player_handle: PlayerHandle) {
        match event {
            Event::Connected => {
                self.push_event(RollnetEvent::ConnectedToPeer { player_handle });
            }
            Event::Synchronizing { total, count } => {
                self.push_event(RollnetEvent::SynchronizingWithPeer {
                    player_handle,
                    count,
                    total,
                });
            }
            Event::NetworkInterrupted { disconnect_timeout } => {
                self.push_event(RollnetEvent::ConnectionInterrupted {
                    player_handle,
                    disconnect_timeout,
                });
            }
            Event::NetworkResumed => {
                self.push_event(RollnetEvent::ConnectionResumed { player_handle });
            }
            // if all remotes are synchronized now, the session can start running
            Event::Synchronized => {
                self.push_event(RollnetEvent::SynchronizedWithPeer { player_handle });
                self.check_initial_sync();
            }
            // disconnect the player, the event towards the user fires in disconnect_player_at_frame
            Event::Disconnected => {
                if player_handle < self.num_players {
                    if !self.local_connect_status[player_handle].disconnected {
                        let last_frame = self.local_connect_status[player_handle].last_frame;
                        self.disconnect_player_at_frame(player_handle, last_frame);
                    }
                } else {
                    self.disconnect_player_at_frame(player_handle, NULL_FRAME);
                }
            }
            // a remote input arrived, feed it into the matching input queue
            Event::Input(input) => {
                assert!(player_handle < self.num_players);
                if !self.local_connect_status[player_handle].disconnected {
                    // check that the input comes in the correct sequence
                    let current_remote_frame = self.local_connect_status[player_handle].last_frame;
                    assert!(
                        current_remote_frame == NULL_FRAME
                            || current_remote_frame + 1 == input.frame
                    );
                    self.local_connect_status[player_handle].last_frame = input.frame;
                    self.sync_layer.add_remote_input(player_handle, input);
                }
            }
        }
    }

    /// Flips the session to `Running` once every endpoint has finished its handshake.
    fn check_initial_sync(&mut self) {
        if self.state != SessionState::Synchronizing {
            return;
        }

        for endpoint in self
            .players
            .values_mut()
            .filter_map(Player::as_endpoint_mut)
        {
            if !endpoint.is_synchronized() {
                return;
            }
        }

        debug!("all endpoints synchronized, session is running");
        self.state = SessionState::Running;
        self.push_event(RollnetEvent::Running);
    }

    fn disconnect_player_at_frame(&mut self, player_handle: PlayerHandle, last_frame: Frame) {
        let now = self.clock.now_millis();
        match self
            .players
            .get_mut(&player_handle)
            .expect("Invalid player handle")
        {
            Player::Remote(endpoint) => {
                endpoint.disconnect(now);
                self.local_connect_status[player_handle].disconnected = true;

                if self.sync_layer.current_frame() > last_frame {
                    // the player disconnected some frames in the past, remember to re-simulate
                    // from there with their inputs replaced by zeroes
                    self.disconnect_frame = last_frame + 1;
                }
            }
            Player::Spectator(endpoint) => {
                endpoint.disconnect(now);
            }
            Player::Local => (),
        }

        self.push_event(RollnetEvent::DisconnectedFromPeer { player_handle });

        // a disconnect may have been the last thing a peer was waiting for
        self.check_initial_sync();
    }

    /// For each player, find out what their minimum confirmed frame across all peers is.
    /// Disconnects players that remote clients have already disconnected.
    fn min_confirmed_frame(&mut self) -> Frame {
        let mut total_min_confirmed = i32::MAX;

        for handle in 0..self.num_players {
            let mut queue_connected = true;
            let mut queue_min_confirmed = i32::MAX;

            // what do all remote peers think about this player?
            for endpoint in self.players.values().filter_map(Player::remote_as_endpoint) {
                if !endpoint.is_running() {
                    continue;
                }
                let con_status = endpoint.peer_connect_status(handle);
                queue_connected = queue_connected && !con_status.disconnected;
                queue_min_confirmed = std::cmp::min(queue_min_confirmed, con_status.last_frame);
            }

            // and what do we think ourselves?
            let local_connected = !self.local_connect_status[handle].disconnected;
            let local_min_confirmed = self.local_connect_status[handle].last_frame;
            if local_connected {
                queue_min_confirmed = std::cmp::min(queue_min_confirmed, local_min_confirmed);
            }

            if queue_connected {
                total_min_confirmed = std::cmp::min(queue_min_confirmed, total_min_confirmed);
            } else {
                // a remote peer disconnected this player, possibly at an earlier frame than we
                // did ourselves. If so, re-disconnect at the earlier frame to stay consistent.
                if local_connected || local_min_confirmed > queue_min_confirmed {
                    self.disconnect_player_at_frame(handle, queue_min_confirmed);
                }
            }
        }

        assert!(total_min_confirmed < i32::MAX);
        total_min_confirmed
    }

    /// For each spectator, send all confirmed inputs up until the minimum confirmed frame.
    fn send_confirmed_inputs_to_spectators(&mut self, min_confirmed_frame: Frame, now: u128) {
        if self.num_spectators() == 0 {
            return;
        }

        while self.next_spectator_frame <= min_confirmed_frame {
            let inputs = self
                .sync_layer
                .confirmed_inputs(self.next_spectator_frame, &self.local_connect_status);
            assert_eq!(inputs.len(), self.num_players);

            // merge the inputs of all players into a single record for the spectators
            let mut spectator_input = GameInput::new(
                self.next_spectator_frame,
                self.input_size * self.num_players,
            );
            let mut merged_bits = vec![0u8; self.input_size * self.num_players];
            for (i, input) in inputs.iter().enumerate() {
                assert!(input.frame == NULL_FRAME || input.frame == self.next_spectator_frame);
                assert!(input.frame == NULL_FRAME || input.size == self.input_size);
                let start = i * self.input_size;
                let end = (i + 1) * self.input_size;
                merged_bits[start..end].copy_from_slice(input.input());
            }
            spectator_input.copy_input(&merged_bits);

            for endpoint in self
                .players
                .values_mut()
                .filter_map(Player::spectator_as_endpoint_mut)
            {
                if endpoint.is_running() {
                    endpoint.send_input(spectator_input, &self.local_connect_status, now);
                }
            }

            self.next_spectator_frame += 1;
        }
    }

    /// Gathers the stall recommendations towards each connected remote client and returns the maximum.
    fn max_delay_recommendation(&self, require_idle_input: bool) -> u32 {
        let mut interval = 0;
        for endpoint in self.players.values().filter_map(Player::remote_as_endpoint) {
            if !self.local_connect_status[endpoint.player_handle()].disconnected {
                interval =
                    std::cmp::max(interval, endpoint.recommend_frame_delay(require_idle_input));
            }
        }
        interval
    }

    fn num_spectators(&self) -> usize {
        self.players
            .keys()
            .filter(|handle| **handle >= SPECTATOR_PLAYER_HANDLE_OFFSET)
            .count()
    }
}

impl RollnetSession for P2PSession {
    fn add_player(
        &mut self,
        player_type: PlayerType,
        player_handle: PlayerHandle,
    ) -> Result<PlayerHandle, RollnetError> {
        // players can only be added in the init phase
        if self.state != SessionState::Initializing {
            return Err(RollnetError::InvalidRequest {
                info: "Session already started. You can only add players before starting the session."
                    .to_owned(),
            });
        }

        match player_type {
            PlayerType::Local => self.add_local_player(player_handle),
            PlayerType::Remote(addr) => self.add_remote_player(player_handle, addr),
            PlayerType::Spectator(addr) => self.add_spectator(player_handle, addr),
        }
    }

    fn start_session(&mut self) -> Result<(), RollnetError> {
        if self.state != SessionState::Initializing {
            return Err(RollnetError::InvalidRequest {
                info: "Session already started.".to_owned(),
            });
        }

        // check if all players are added
        for player_handle in 0..self.num_players {
            if self.players.get(&player_handle).is_none() {
                return Err(RollnetError::InvalidRequest {
                    info: "Not enough players have been added. Keep registering players up to the defined player number.".to_owned(),
                });
            }
        }

        // start the synchronization with all endpoints
        self.state = SessionState::Synchronizing;
        let now = self.clock.now_millis();
        for endpoint in self
            .players
            .values_mut()
            .filter_map(Player::as_endpoint_mut)
        {
            endpoint.synchronize(now);
        }
        // a session without any remote endpoint is running right away
        self.check_initial_sync();
        Ok(())
    }

    fn add_local_input(
        &mut self,
        player_handle: PlayerHandle,
        input: &[u8],
    ) -> Result<(), RollnetError> {
        // the player handle must refer to a registered local player
        match self.players.get(&player_handle) {
            Some(Player::Local) => (),
            _ => return Err(RollnetError::InvalidHandle),
        }

        if self.state != SessionState::Running {
            return Err(RollnetError::NotSynchronized);
        }
        if self.sync_layer.in_rollback() {
            return Err(RollnetError::InRollback);
        }
        if input.len() != self.input_size {
            return Err(RollnetError::InvalidRequest {
                info: "The provided input does not match the registered input size.".to_owned(),
            });
        }

        let mut game_input = GameInput::new(self.sync_layer.current_frame(), self.input_size);
        game_input.copy_input(input);

        // the sync layer stamps the input with the frame it is actually stored at
        let actual_frame = self.sync_layer.add_local_input(player_handle, game_input)?;

        // a null frame means the input was dropped due to a decreased input delay; otherwise
        // distribute the input to all remote players with the delay-adjusted frame
        if actual_frame != NULL_FRAME {
            let now = self.clock.now_millis();
            game_input.frame = actual_frame;
            self.local_connect_status[player_handle].last_frame = actual_frame;

            for endpoint in self
                .players
                .values_mut()
                .filter_map(Player::remote_as_endpoint_mut)
            {
                endpoint.send_input(game_input, &self.local_connect_status, now);
            }
            for endpoint in self
                .players
                .values_mut()
                .filter_map(Player::remote_as_endpoint_mut)
            {
                endpoint.send_all_messages(&mut *self.socket, now);
            }
        }

        Ok(())
    }

    fn sync_input(&mut self) -> Result<(Vec<GameInput>, u8), RollnetError> {
        if self.state != SessionState::Running {
            return Err(RollnetError::NotSynchronized);
        }
        if self.sync_layer.in_rollback() {
            return Err(RollnetError::InRollback);
        }

        Ok(self
            .sync_layer
            .synchronized_inputs(&self.local_connect_status))
    }

    fn advance_frame(
        &mut self,
        interface: &mut impl RollnetInterface,
    ) -> Result<(), RollnetError> {
        if self.state != SessionState::Running {
            return Err(RollnetError::NotSynchronized);
        }
        if self.sync_layer.in_rollback() {
            return Err(RollnetError::InRollback);
        }

        // resolve pending rollbacks and protocol work before serving the current frame
        self.do_poll(interface);

        // save the state entering the current frame, then run the tick through the interface
        self.sync_layer.save_current_frame(interface);
        let (inputs, disconnect_flags) = self
            .sync_layer
            .synchronized_inputs(&self.local_connect_status);
        for input in &inputs {
            assert!(input.frame == NULL_FRAME || input.frame == self.sync_layer.current_frame());
        }
        interface.advance_frame(inputs, disconnect_flags);
        self.sync_layer.advance_frame();

        Ok(())
    }

    fn idle(&mut self, interface: &mut impl RollnetInterface) -> Result<(), RollnetError> {
        self.do_poll(interface);
        Ok(())
    }

    fn disconnect_player(&mut self, player_handle: PlayerHandle) -> Result<(), RollnetError> {
        let is_remote = match self.players.get(&player_handle) {
            // the local player cannot be disconnected
            None | Some(Player::Local) => return Err(RollnetError::InvalidHandle),
            Some(Player::Remote(_)) => true,
            Some(Player::Spectator(_)) => false,
        };

        if is_remote {
            // a remote player can only be disconnected once, since the disconnect frame matters
            if self.local_connect_status[player_handle].disconnected {
                return Err(RollnetError::PlayerDisconnected);
            }
            let last_frame = self.local_connect_status[player_handle].last_frame;
            self.disconnect_player_at_frame(player_handle, last_frame);
        } else {
            // disconnecting spectators is simpler
            self.disconnect_player_at_frame(player_handle, NULL_FRAME);
        }
        Ok(())
    }

    fn network_stats(&self, player_handle: PlayerHandle) -> Result<NetworkStats, RollnetError> {
        match self
            .players
            .get(&player_handle)
            .ok_or(RollnetError::InvalidHandle)?
        {
            Player::Local => Err(RollnetError::InvalidRequest {
                info: "Network statistics do not exist for the local player.".to_owned(),
            }),
            Player::Remote(endpoint) | Player::Spectator(endpoint) => {
                endpoint.network_stats().ok_or(RollnetError::NotSynchronized)
            }
        }
    }

    fn set_frame_delay(
        &mut self,
        frame_delay: u32,
        player_handle: PlayerHandle,
    ) -> Result<(), RollnetError> {
        if frame_delay > MAX_INPUT_DELAY {
            return Err(RollnetError::InvalidRequest {
                info: format!("The input delay may be at most {} frames.", MAX_INPUT_DELAY),
            });
        }

        match self.players.get(&player_handle) {
            None => return Err(RollnetError::InvalidHandle),
            Some(Player::Remote(_)) | Some(Player::Spectator(_)) => {
                return Err(RollnetError::InvalidRequest {
                    info: "Frame delay can only be set for the local player.".to_owned(),
                })
            }
            Some(Player::Local) => (),
        }

        self.input_delay = frame_delay;
        self.sync_layer.set_frame_delay(player_handle, frame_delay);
        // remote peers learn about our delay during the handshake
        for endpoint in self
            .players
            .values_mut()
            .filter_map(Player::as_endpoint_mut)
        {
            endpoint.set_local_frame_delay(frame_delay);
        }
        Ok(())
    }

    fn set_disconnect_timeout(&mut self, timeout: Duration) -> Result<(), RollnetError> {
        self.disconnect_timeout = timeout;
        for endpoint in self
            .players
            .values_mut()
            .filter_map(Player::as_endpoint_mut)
        {
            endpoint.set_disconnect_timeout(timeout);
        }
        Ok(())
    }

    fn set_disconnect_notify_delay(&mut self, notify_delay: Duration) -> Result<(), RollnetError> {
        self.disconnect_notify_start = notify_delay;
        for endpoint in self
            .players
            .values_mut()
            .filter_map(Player::as_endpoint_mut)
        {
            endpoint.set_disconnect_notify_start(notify_delay);
        }
        Ok(())
    }

    fn current_state(&self) -> SessionState {
        self.state
    }

    fn close(&mut self) -> Result<(), RollnetError> {
        let now = self.clock.now_millis();
        for endpoint in self
            .players
            .values_mut()
            .filter_map(Player::as_endpoint_mut)
        {
            endpoint.disconnect(now);
            endpoint.send_all_messages(&mut *self.socket, now);
        }
        self.players.clear();
        Ok(())
    }
}
