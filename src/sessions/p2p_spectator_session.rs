use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use crate::error::RollnetError;
use crate::frame_info::GameInput;
use crate::network::network_stats::NetworkStats;
use crate::network::udp_msg::ConnectionStatus;
use crate::network::udp_protocol::{Event, UdpProtocol};
use crate::network::udp_socket::NonBlockingSocket;
use crate::{
    Clock, Frame, PlayerHandle, PlayerType, RollnetEvent, RollnetInterface, RollnetSession,
    SessionState, NULL_FRAME,
};

// The amount of frames the spectator advances in a single step if not too far behind
const NORMAL_SPEED: usize = 1;
// The amount of host inputs a spectator can buffer (a second worth of inputs)
pub(crate) const SPECTATOR_BUFFER_SIZE: usize = 60;
const MAX_EVENT_QUEUE_SIZE: usize = 100;

/// A `SpectatorSession` connects to a remote host in a peer-to-peer fashion. The host broadcasts
/// the confirmed inputs of all players to this session, which consumes them one frame at a time
/// without contributing any input of its own.
pub struct SpectatorSession {
    state: SessionState,
    num_players: usize,
    input_size: usize,
    /// The merged per-frame input records received from the host, indexed by frame number.
    inputs: [GameInput; SPECTATOR_BUFFER_SIZE],
    /// The host's view of every player's connection.
    host_connect_status: Vec<ConnectionStatus>,
    socket: Box<dyn NonBlockingSocket>,
    host: UdpProtocol,
    clock: Rc<dyn Clock>,
    event_queue: VecDeque<RollnetEvent>,
    current_frame: Frame,
    last_recv_frame: Frame,
    max_frames_behind: usize,
    catchup_speed: usize,
}

impl SpectatorSession {
    /// Creates a new `SpectatorSession` directly from a synchronizing host endpoint.
    pub(crate) fn new(
        num_players: usize,
        input_size: usize,
        socket: Box<dyn NonBlockingSocket>,
        host: UdpProtocol,
        clock: Rc<dyn Clock>,
        max_frames_behind: usize,
        catchup_speed: usize,
    ) -> Self {
        // the merged record carries the inputs of all players at once
        let mut host_connect_status = Vec::new();
        for _ in 0..num_players {
            host_connect_status.push(ConnectionStatus::default());
        }

        Self {
            state: SessionState::Synchronizing,
            num_players,
            input_size,
            inputs: [GameInput::blank_input(input_size * num_players); SPECTATOR_BUFFER_SIZE],
            host_connect_status,
            socket,
            host,
            clock,
            event_queue: VecDeque::new(),
            current_frame: NULL_FRAME,
            last_recv_frame: NULL_FRAME,
            max_frames_behind,
            catchup_speed,
        }
    }

    /// Returns the number of frames the spectator is behind the host input stream.
    pub fn frames_behind_host(&self) -> usize {
        let diff = self.last_recv_frame - self.current_frame;
        assert!(diff >= 0);
        diff as usize
    }

    fn do_poll(&mut self, interface: &mut impl RollnetInterface) {
        let now = self.clock.now_millis();

        // receive host messages, they all belong to the single host endpoint
        let messages = self.socket.receive_all_messages();
        for (from, msg) in &messages {
            if self.host.is_handling_message(from) {
                self.host.handle_message(msg, now);
            }
        }

        // run the endpoint timers and handle all events
        let mut events = VecDeque::new();
        for event in self.host.poll(&self.host_connect_status, now) {
            events.push_back(event);
        }
        for event in events.drain(..) {
            self.handle_event(event);
        }

        // push all due outbound messages onto the transport
        self.host.send_all_messages(&mut *self.socket, now);

        while let Some(event) = self.event_queue.pop_front() {
            interface.on_event(event);
        }
    }

    fn push_event(&mut self, event: RollnetEvent) {
        self.event_queue.push_back(event);
        while self.event_queue.len() > MAX_EVENT_QUEUE_SIZE {
            self.event_queue.pop_front();
        }
    }

    /// Splits the merged host record for `frame_to_grab` back into one input per player.
    fn inputs_at_frame(
        &self,
        frame_to_grab: Frame,
    ) -> Result<(Vec<GameInput>, u8), RollnetError> {
        assert!(frame_to_grab >= 0);
        let merged_input = self.inputs[frame_to_grab as usize % SPECTATOR_BUFFER_SIZE];

        // we have not received the input from the host yet, wait
        if merged_input.frame < frame_to_grab {
            return Err(RollnetError::PredictionThreshold);
        }

        // the host is so far ahead that the buffer slot was already overwritten
        if merged_input.frame > frame_to_grab {
            return Err(RollnetError::SpectatorTooFarBehind);
        }

        let mut inputs = Vec::with_capacity(self.num_players);
        let mut disconnect_flags = 0u8;
        for i in 0..self.num_players {
            if self.host_connect_status[i].disconnected
                && self.host_connect_status[i].last_frame < frame_to_grab
            {
                disconnect_flags |= 1 << i;
                inputs.push(GameInput::blank_input(self.input_size));
            } else {
                let mut input = GameInput::new(frame_to_grab, self.input_size);
                let start = i * self.input_size;
                let end = (i + 1) * self.input_size;
                input.copy_input(&merged_input.buffer[start..end]);
                inputs.push(input);
            }
        }

        Ok((inputs, disconnect_flags))
    }

    fn handle_event(&mut self, event: Event) {
        // the host endpoint is the only peer of a spectator
        let player_handle = 0;
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
            Event::Synchronized => {
                self.state = SessionState::Running;
                self.push_event(RollnetEvent::SynchronizedWithPeer { player_handle });
                self.push_event(RollnetEvent::Running);
            }
            Event::Disconnected => {
                self.push_event(RollnetEvent::DisconnectedFromPeer { player_handle });
            }
            Event::Input(input) => {
                // save the merged input the host streamed to us
                assert!(input.frame > self.last_recv_frame);
                self.inputs[input.frame as usize % SPECTATOR_BUFFER_SIZE] = input;
                self.last_recv_frame = input.frame;

                // the received frame doubles as the host's progress for the advantage estimate
                self.host.update_local_frame_advantage(input.frame);

                // refresh the host's view of all player connections
                for i in 0..self.num_players {
                    self.host_connect_status[i] = self.host.peer_connect_status(i);
                }
            }
        }
    }
}

impl RollnetSession for SpectatorSession {
    fn add_player(
        &mut self,
        _player_type: PlayerType,
        _player_handle: PlayerHandle,
    ) -> Result<PlayerHandle, RollnetError> {
        Err(RollnetError::InvalidRequest {
            info: "Spectators receive all players from the host, adding players is not possible."
                .to_owned(),
        })
    }

    fn start_session(&mut self) -> Result<(), RollnetError> {
        Err(RollnetError::InvalidRequest {
            info: "Spectator sessions start synchronizing as soon as they are created.".to_owned(),
        })
    }

    fn add_local_input(
        &mut self,
        _player_handle: PlayerHandle,
        _input: &[u8],
    ) -> Result<(), RollnetError> {
        Err(RollnetError::InvalidRequest {
            info: "Spectators do not contribute game input.".to_owned(),
        })
    }

    fn sync_input(&mut self) -> Result<(Vec<GameInput>, u8), RollnetError> {
        if self.state != SessionState::Running {
            return Err(RollnetError::NotSynchronized);
        }
        self.inputs_at_frame(self.current_frame + 1)
    }

    fn advance_frame(
        &mut self,
        interface: &mut impl RollnetInterface,
    ) -> Result<(), RollnetError> {
        // receive info from the host, trigger events and send messages
        self.do_poll(interface);

        if self.state != SessionState::Running {
            return Err(RollnetError::NotSynchronized);
        }

        let frames_to_advance = if self.frames_behind_host() > self.max_frames_behind {
            self.catchup_speed
        } else {
            NORMAL_SPEED
        };

        for _ in 0..frames_to_advance {
            let frame_to_grab = self.current_frame + 1;
            let (inputs, disconnect_flags) = self.inputs_at_frame(frame_to_grab)?;
            interface.advance_frame(inputs, disconnect_flags);
            // advance the frame only if grabbing the inputs succeeded
            self.current_frame += 1;
        }

        Ok(())
    }

    fn idle(&mut self, interface: &mut impl RollnetInterface) -> Result<(), RollnetError> {
        self.do_poll(interface);
        Ok(())
    }

    fn disconnect_player(&mut self, _player_handle: PlayerHandle) -> Result<(), RollnetError> {
        Err(RollnetError::InvalidRequest {
            info: "Spectators cannot disconnect players; stop spectating by closing the session."
                .to_owned(),
        })
    }

    fn network_stats(&self, _player_handle: PlayerHandle) -> Result<NetworkStats, RollnetError> {
        self.host
            .network_stats()
            .ok_or(RollnetError::NotSynchronized)
    }

    fn set_frame_delay(
        &mut self,
        _frame_delay: u32,
        _player_handle: PlayerHandle,
    ) -> Result<(), RollnetError> {
        Err(RollnetError::InvalidRequest {
            info: "Spectators do not contribute game input.".to_owned(),
        })
    }

    fn set_disconnect_timeout(&mut self, timeout: Duration) -> Result<(), RollnetError> {
        self.host.set_disconnect_timeout(timeout);
        Ok(())
    }

    fn set_disconnect_notify_delay(&mut self, notify_delay: Duration) -> Result<(), RollnetError> {
        self.host.set_disconnect_notify_start(notify_delay);
        Ok(())
    }

    fn current_state(&self) -> SessionState {
        self.state
    }

    fn close(&mut self) -> Result<(), RollnetError> {
        let now = self.clock.now_millis();
        self.host.disconnect(now);
        self.host.send_all_messages(&mut *self.socket, now);
        Ok(())
    }
}
