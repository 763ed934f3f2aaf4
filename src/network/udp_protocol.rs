use crate::frame_info::GameInput;
use crate::network::network_stats::NetworkStats;
use crate::network::udp_msg::{
    ConnectionStatus, Input, InputAck, MessageBody, MessageHeader, QualityReply, QualityReport,
    SyncReply, SyncRequest, UdpMessage, MAX_SEQ_DISTANCE,
};
use crate::network::udp_socket::NonBlockingSocket;
use crate::time_sync::TimeSync;
use crate::{Frame, PlayerHandle, NULL_FRAME, SPECTATOR_PLAYER_HANDLE_OFFSET};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::vec_deque::Drain;
use std::collections::VecDeque;
use std::convert::TryFrom;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, trace};

const UDP_HEADER_SIZE: usize = 28; // Size of IP + UDP headers
pub(crate) const NUM_SYNC_PACKETS: u32 = 5;
const UDP_SHUTDOWN_TIMER: u128 = 5000;
const PENDING_OUTPUT_SIZE: usize = 128;
const SYNC_FIRST_RETRY_INTERVAL: u128 = 500;
const SYNC_RETRY_INTERVAL: u128 = 2000;
const RUNNING_RETRY_INTERVAL: u128 = 200;
const KEEP_ALIVE_INTERVAL: u128 = 200;
const QUALITY_REPORT_INTERVAL: u128 = 1000;
const NETWORK_STATS_INTERVAL: u128 = 1000;

/// Events the endpoint reports to the session that owns it.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Event {
    /// The remote peer answered a sync probe for the first time.
    Connected,
    /// The handshake made progress. It continues until `count` reaches `total`.
    Synchronizing { total: u32, count: u32 },
    /// The handshake with the remote client is complete.
    Synchronized,
    /// The endpoint received an input from the remote client. This event is consumed by the session, not forwarded to the user.
    Input(GameInput),
    /// The remote client has disconnected.
    Disconnected,
    /// The endpoint has not received packets from the remote client for some time and will disconnect the remote in `disconnect_timeout` ms.
    NetworkInterrupted { disconnect_timeout: u128 },
    /// Sent only after a `NetworkInterrupted` event, if communication has resumed.
    NetworkResumed,
}

#[derive(Debug, PartialEq, Eq)]
enum ProtocolState {
    Initializing,
    Synchronizing,
    Running,
    Disconnected,
    Shutdown,
}

/// An outbound message waiting in the send pump, stamped with the time it was queued.
#[derive(Debug)]
struct QueueEntry {
    queue_time: u128,
    msg: UdpMessage,
}

/// A packet held back by the send pump to simulate out-of-order delivery.
#[derive(Debug)]
struct OoPacket {
    send_time: u128,
    msg: UdpMessage,
}

/// One `UdpProtocol` exists per remote peer. It owns the handshake, the reliable-ish input
/// exchange on top of unreliable datagrams, quality probes, keepalives and disconnect detection.
/// All time-based decisions read the `now` parameter fed in by the session's clock.
#[derive(Debug)]
pub(crate) struct UdpProtocol {
    handle: PlayerHandle,
    magic: u16,
    rng: StdRng,
    send_queue: VecDeque<QueueEntry>,
    event_queue: VecDeque<Event>,

    // simulated impairment of the send pump, defaults to pass-through
    send_latency: u128,
    oo_percent: u8,
    oo_packet: Option<OoPacket>,

    // state
    state: ProtocolState,
    sync_remaining_roundtrips: u32,
    sync_random_request: u32,
    connected: bool,
    running_last_quality_report: u128,
    running_last_network_stats: u128,
    running_last_input_recv: u128,
    disconnect_notify_sent: bool,
    disconnect_event_sent: bool,

    // constants
    disconnect_timeout: Duration,
    disconnect_notify_start: Duration,
    shutdown_timeout: u128,
    fps: u32,
    input_size: usize,
    /// input delay advertised to the peer during the handshake
    local_frame_delay: u8,
    /// input delay the peer advertised to us
    remote_frame_delay: u8,

    // sequence bookkeeping
    next_send_seq: u16,
    next_recv_seq: u16,

    // the other client
    peer_addr: SocketAddr,
    remote_magic: u16,
    peer_connect_status: Vec<ConnectionStatus>,

    // input exchange
    pending_output: VecDeque<GameInput>,
    last_received_input: GameInput,
    last_acked_input: GameInput,

    // time sync
    time_sync_layer: TimeSync,
    local_frame_advantage: i32,
    remote_frame_advantage: i32,

    // network stats
    stats_start_time: u128,
    packets_sent: usize,
    bytes_sent: usize,
    kbps_sent: usize,
    round_trip_time: u128,
    last_send_time: u128,
    last_recv_time: u128,
}

impl PartialEq for UdpProtocol {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle
    }
}
impl Eq for UdpProtocol {}

impl UdpProtocol {
    pub(crate) fn new(
        handle: PlayerHandle,
        peer_addr: SocketAddr,
        num_players: usize,
        input_size: usize,
        rng_seed: u64,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(rng_seed);

        // the magic number tags our outbound headers, zero is reserved for "unknown"
        let mut magic: u16 = rng.gen();
        while magic == 0 {
            magic = rng.gen();
        }

        // what this peer knows about every player of the session
        let mut peer_connect_status = Vec::new();
        for _ in 0..num_players {
            peer_connect_status.push(ConnectionStatus::default());
        }

        Self {
            handle,
            magic,
            rng,
            send_queue: VecDeque::new(),
            event_queue: VecDeque::new(),

            send_latency: 0,
            oo_percent: 0,
            oo_packet: None,

            // state
            state: ProtocolState::Initializing,
            sync_remaining_roundtrips: NUM_SYNC_PACKETS,
            sync_random_request: 0,
            connected: false,
            running_last_quality_report: 0,
            running_last_network_stats: 0,
            running_last_input_recv: 0,
            disconnect_notify_sent: false,
            disconnect_event_sent: false,

            // constants
            disconnect_timeout: Duration::ZERO,
            disconnect_notify_start: Duration::ZERO,
            shutdown_timeout: 0,
            fps: 60,
            input_size,
            local_frame_delay: 0,
            remote_frame_delay: 0,

            // sequence bookkeeping
            next_send_seq: 0,
            next_recv_seq: 0,

            // the other client
            peer_addr,
            remote_magic: 0,
            peer_connect_status,

            // input exchange
            pending_output: VecDeque::with_capacity(PENDING_OUTPUT_SIZE),
            last_received_input: GameInput::blank_input(input_size),
            last_acked_input: GameInput::blank_input(input_size),

            // time sync
            time_sync_layer: TimeSync::new(),
            local_frame_advantage: 0,
            remote_frame_advantage: 0,

            // network stats
            stats_start_time: 0,
            packets_sent: 0,
            bytes_sent: 0,
            kbps_sent: 0,
            round_trip_time: 0,
            last_send_time: 0,
            last_recv_time: 0,
        }
    }

    pub(crate) const fn player_handle(&self) -> PlayerHandle {
        self.handle
    }

    pub(crate) fn set_disconnect_timeout(&mut self, timeout: Duration) {
        self.disconnect_timeout = timeout;
    }

    pub(crate) fn set_disconnect_notify_start(&mut self, notify_start: Duration) {
        self.disconnect_notify_start = notify_start;
    }

    pub(crate) fn set_fps(&mut self, fps: u32) {
        assert!(fps > 0);
        self.fps = fps;
    }

    pub(crate) fn set_local_frame_delay(&mut self, delay: u32) {
        self.local_frame_delay = delay.min(u8::MAX as u32) as u8;
    }

    /// Configures artificial latency on the send pump, in milliseconds. Zero means pass-through.
    #[allow(dead_code)]
    pub(crate) fn set_send_latency(&mut self, latency: u128) {
        self.send_latency = latency;
    }

    /// Configures the percentage of packets the send pump holds back and releases late, simulating reordering.
    #[allow(dead_code)]
    pub(crate) fn set_oo_percent(&mut self, percent: u8) {
        assert!(percent <= 100);
        self.oo_percent = percent;
    }

    /// Estimates how many frames we are ahead of the remote client, from the last frame they sent
    /// us plus the frames that pass while a packet is in flight. Positive means we are ahead.
    pub(crate) fn update_local_frame_advantage(&mut self, local_frame: Frame) {
        if local_frame == NULL_FRAME || self.last_received_input.frame == NULL_FRAME {
            return;
        }
        let ping = i32::try_from(self.round_trip_time / 2).expect("Ping is higher than i32::MAX");
        // received inputs are stamped with the peer's input delay, their simulation lags behind that
        let remote_frame = self.last_received_input.frame - self.remote_frame_delay as i32
            + ((ping * self.fps as i32) / 1000);
        self.local_frame_advantage = local_frame - remote_frame;
    }

    pub(crate) fn network_stats(&self) -> Option<NetworkStats> {
        if self.state != ProtocolState::Synchronizing && self.state != ProtocolState::Running {
            return None;
        }

        Some(NetworkStats {
            ping: self.round_trip_time,
            send_queue_len: self.pending_output.len(),
            kbps_sent: self.kbps_sent,
            local_frames_ahead: self.local_frame_advantage,
            remote_frames_ahead: self.remote_frame_advantage,
        })
    }

    pub(crate) fn is_synchronized(&self) -> bool {
        self.state == ProtocolState::Running
            || self.state == ProtocolState::Disconnected
            || self.state == ProtocolState::Shutdown
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state == ProtocolState::Running
    }

    pub(crate) fn is_handling_message(&self, addr: &SocketAddr) -> bool {
        self.peer_addr == *addr
    }

    pub(crate) fn peer_connect_status(&self, handle: PlayerHandle) -> ConnectionStatus {
        self.peer_connect_status[handle]
    }

    pub(crate) fn recommend_frame_delay(&self, require_idle_input: bool) -> u32 {
        self.time_sync_layer
            .recommend_frame_wait_duration(require_idle_input)
    }

    pub(crate) fn disconnect(&mut self, now: u128) {
        if self.state == ProtocolState::Shutdown {
            return;
        }

        debug!(handle = self.handle, "disconnecting endpoint");
        self.state = ProtocolState::Disconnected;
        // schedule the timeout which will lead to shutdown
        self.shutdown_timeout = now + UDP_SHUTDOWN_TIMER;
    }

    pub(crate) fn synchronize(&mut self, now: u128) {
        assert_eq!(self.state, ProtocolState::Initializing);
        self.state = ProtocolState::Synchronizing;
        self.sync_remaining_roundtrips = NUM_SYNC_PACKETS;
        self.stats_start_time = now;
        self.running_last_quality_report = now;
        self.running_last_network_stats = now;
        self.running_last_input_recv = now;
        self.last_recv_time = now;
        self.send_sync_request(now);
    }

    pub(crate) fn poll(&mut self, connect_status: &[ConnectionStatus], now: u128) -> Drain<Event> {
        match self.state {
            ProtocolState::Synchronizing => {
                // the first retry comes quickly, later ones are spaced out
                let next_interval = if self.sync_remaining_roundtrips == NUM_SYNC_PACKETS {
                    SYNC_FIRST_RETRY_INTERVAL
                } else {
                    SYNC_RETRY_INTERVAL
                };
                if self.last_send_time > 0 && self.last_send_time + next_interval < now {
                    trace!(handle = self.handle, "no luck syncing, re-queueing sync packet");
                    self.send_sync_request(now);
                }
            }
            ProtocolState::Running => {
                // resend pending inputs if we have not received an input packet in a while
                if self.running_last_input_recv + RUNNING_RETRY_INTERVAL < now {
                    self.send_pending_output(connect_status, now);
                    self.running_last_input_recv = now;
                }

                // periodically send a quality report
                if self.running_last_quality_report + QUALITY_REPORT_INTERVAL < now {
                    self.send_quality_report(now);
                }

                // periodically refresh the bandwidth estimate
                if self.running_last_network_stats + NETWORK_STATS_INTERVAL < now {
                    self.update_network_stats(now);
                    self.running_last_network_stats = now;
                }

                // send a keepalive if we have not sent anything for some time
                if self.last_send_time > 0 && self.last_send_time + KEEP_ALIVE_INTERVAL < now {
                    trace!(handle = self.handle, "sending keep alive packet");
                    self.queue_message(MessageBody::KeepAlive, now);
                }

                let notify_start = self.disconnect_notify_start.as_millis();
                let timeout = self.disconnect_timeout.as_millis();

                // warn the session once if we have not received anything for a while
                if timeout > 0
                    && notify_start > 0
                    && !self.disconnect_notify_sent
                    && self.last_recv_time + notify_start < now
                {
                    debug!(
                        handle = self.handle,
                        "endpoint has stopped receiving packets, sending notification"
                    );
                    self.event_queue.push_back(Event::NetworkInterrupted {
                        disconnect_timeout: timeout - notify_start,
                    });
                    self.disconnect_notify_sent = true;
                }

                // past the disconnect timeout, give up on the peer
                if timeout > 0
                    && !self.disconnect_event_sent
                    && self.last_recv_time + timeout < now
                {
                    debug!(handle = self.handle, "endpoint timed out, disconnecting");
                    self.event_queue.push_back(Event::Disconnected);
                    self.disconnect_event_sent = true;
                }
            }
            ProtocolState::Disconnected => {
                if self.shutdown_timeout < now {
                    debug!(handle = self.handle, "shutting down endpoint");
                    self.state = ProtocolState::Shutdown;
                }
            }
            ProtocolState::Initializing | ProtocolState::Shutdown => (),
        }
        self.event_queue.drain(..)
    }

    /// Drops entries from the pending output whose frame is older than the acknowledged frame.
    fn pop_pending_output(&mut self, ack_frame: Frame) {
        while let Some(input) = self.pending_output.front() {
            if input.frame < ack_frame {
                self.last_acked_input = *input;
                self.pending_output.pop_front();
            } else {
                break;
            }
        }
    }

    /*
     *  SENDING MESSAGES
     */

    /// Pushes all due outbound messages onto the transport. With nonzero `send_latency` or
    /// `oo_percent`, entries are released late or out of order to exercise the protocol under
    /// simulated network impairment.
    pub(crate) fn send_all_messages(&mut self, socket: &mut dyn NonBlockingSocket, now: u128) {
        if self.state == ProtocolState::Shutdown {
            self.send_queue.clear();
            self.oo_packet = None;
            return;
        }

        while let Some(entry) = self.send_queue.front() {
            if self.send_latency > 0 {
                // jittered delay around the configured latency
                let jitter =
                    self.send_latency * 2 / 3 + self.rng.gen_range(0..self.send_latency) / 3;
                if now < entry.queue_time + jitter {
                    break;
                }
            }

            let entry = match self.send_queue.pop_front() {
                Some(entry) => entry,
                None => break,
            };

            if self.oo_percent > 0
                && self.oo_packet.is_none()
                && self.rng.gen_range(0..100u8) < self.oo_percent
            {
                let delay = self.rng.gen_range(0..(self.send_latency * 10 + 1000));
                trace!(
                    seq = entry.msg.header.sequence_number,
                    delay = delay as u64,
                    "holding back packet for out-of-order delivery"
                );
                self.oo_packet = Some(OoPacket {
                    send_time: now + delay,
                    msg: entry.msg,
                });
            } else {
                socket.send_to(&entry.msg, self.peer_addr);
            }
        }

        // release the rogue out-of-order packet once its time has come
        if self
            .oo_packet
            .as_ref()
            .map_or(false, |oo| oo.send_time < now)
        {
            if let Some(oo) = self.oo_packet.take() {
                trace!("sending rogue out-of-order packet");
                socket.send_to(&oo.msg, self.peer_addr);
            }
        }
    }

    pub(crate) fn send_input(
        &mut self,
        input: GameInput,
        connect_status: &[ConnectionStatus],
        now: u128,
    ) {
        if self.state != ProtocolState::Running {
            return;
        }

        // register the input and advantages in the time sync layer
        self.time_sync_layer.advance_frame(
            &input,
            self.local_frame_advantage as f32,
            self.remote_frame_advantage as f32,
        );

        self.pending_output.push_back(input);
        if self.pending_output.len() > PENDING_OUTPUT_SIZE {
            if self.handle >= SPECTATOR_PLAYER_HANDLE_OFFSET {
                // a spectator that never acks our input gets dropped
                self.event_queue.push_back(Event::Disconnected);
            } else {
                // a remote player is bounded by the prediction threshold, the ring cannot overflow
                assert!(self.pending_output.len() <= PENDING_OUTPUT_SIZE);
            }
        }
        self.send_pending_output(connect_status, now);
    }

    /// Builds one input message containing every not-yet-acked input and queues it for sending.
    fn send_pending_output(&mut self, connect_status: &[ConnectionStatus], now: u128) {
        let mut body = Input {
            input_size: self.input_size as u8,
            ..Input::default()
        };

        if let Some(input) = self.pending_output.front() {
            // the pending output must continue seamlessly after the acked inputs
            assert!(
                self.last_acked_input.frame == NULL_FRAME
                    || self.last_acked_input.frame + 1 == input.frame
            );
            body.start_frame = input.frame;

            let mut bits = Vec::with_capacity(self.pending_output.len() * self.input_size);
            for pending in &self.pending_output {
                bits.extend_from_slice(pending.input());
                body.checksum = pending.checksum;
            }
            body.bits = bits;
        } else {
            body.start_frame = 0;
        }

        body.ack_frame = self.last_received_input.frame;
        body.disconnect_requested = self.state == ProtocolState::Disconnected;
        body.peer_connect_status = connect_status.to_vec();

        self.queue_message(MessageBody::Input(body), now);
    }

    fn send_input_ack(&mut self, now: u128) {
        let body = InputAck {
            ack_frame: self.last_received_input.frame,
        };

        self.queue_message(MessageBody::InputAck(body), now);
    }

    fn send_sync_request(&mut self, now: u128) {
        // the nonce must be non-zero so stray replies are detectable
        let mut random: u32 = self.rng.gen();
        while random == 0 {
            random = self.rng.gen();
        }
        self.sync_random_request = random;
        let body = SyncRequest {
            random_request: random,
            remote_magic: self.magic,
            remote_endpoint: self.handle.min(u8::MAX as usize) as u8,
            remote_input_delay: self.local_frame_delay,
        };
        self.queue_message(MessageBody::SyncRequest(body), now);
    }

    fn send_quality_report(&mut self, now: u128) {
        self.running_last_quality_report = now;
        let body = QualityReport {
            frame_advantage: self
                .local_frame_advantage
                .clamp(i8::MIN as i32, i8::MAX as i32) as i8,
            ping: now,
        };

        self.queue_message(MessageBody::QualityReport(body), now);
    }

    fn queue_message(&mut self, body: MessageBody, now: u128) {
        // stamp the header with our magic and the next sequence number
        let header = MessageHeader {
            magic: self.magic,
            sequence_number: self.next_send_seq,
        };
        self.next_send_seq = self.next_send_seq.wrapping_add(1);
        let msg = UdpMessage { header, body };

        self.packets_sent += 1;
        self.last_send_time = now;
        self.bytes_sent += bincode::serialized_size(&msg).unwrap_or(0) as usize;

        self.send_queue.push_back(QueueEntry {
            queue_time: now,
            msg,
        });
    }

    fn update_network_stats(&mut self, now: u128) {
        if self.stats_start_time == 0 {
            self.stats_start_time = now;
        }
        let seconds = (now - self.stats_start_time) / 1000;
        if seconds == 0 {
            return;
        }

        let total_bytes_sent = self.bytes_sent + (self.packets_sent * UDP_HEADER_SIZE);
        let bps = total_bytes_sent / seconds as usize;
        self.kbps_sent = bps / 1024;
    }

    /*
     *  RECEIVING MESSAGES
     */

    pub(crate) fn handle_message(&mut self, msg: &UdpMessage, now: u128) {
        // don't handle messages if shutdown
        if self.state == ProtocolState::Shutdown {
            return;
        }

        let seq = msg.header.sequence_number;
        let is_sync_msg = matches!(
            msg.body,
            MessageBody::SyncRequest(_) | MessageBody::SyncReply(_)
        );

        // only the handshake messages are allowed through before the remote magic is known
        if !is_sync_msg {
            if msg.header.magic != self.remote_magic {
                trace!(handle = self.handle, "rejecting message with wrong magic");
                return;
            }

            // drop out-of-order packets that fell too far behind the receive cursor
            let skipped = seq.wrapping_sub(self.next_recv_seq);
            if skipped > MAX_SEQ_DISTANCE {
                trace!(
                    seq,
                    last_seq = self.next_recv_seq,
                    "dropping out of order packet"
                );
                return;
            }
        }

        self.next_recv_seq = seq;

        let handled = match &msg.body {
            MessageBody::SyncRequest(body) => self.on_sync_request(*body, now),
            MessageBody::SyncReply(body) => self.on_sync_reply(msg.header, *body, now),
            MessageBody::Input(body) => self.on_input(body, now),
            MessageBody::InputAck(body) => self.on_input_ack(*body),
            MessageBody::QualityReport(body) => self.on_quality_report(body, now),
            MessageBody::QualityReply(body) => self.on_quality_reply(body, now),
            MessageBody::KeepAlive => true,
        };

        if handled {
            self.last_recv_time = now;
            // a previously notified interruption has ended
            if self.disconnect_notify_sent && self.state == ProtocolState::Running {
                self.disconnect_notify_sent = false;
                self.event_queue.push_back(Event::NetworkResumed);
            }
        }
    }

    /// Upon receiving a `SyncRequest`, answer with a `SyncReply` echoing the nonce.
    fn on_sync_request(&mut self, body: SyncRequest, now: u128) -> bool {
        self.remote_frame_delay = body.remote_input_delay;
        let reply_body = SyncReply {
            random_reply: body.random_request,
        };
        self.queue_message(MessageBody::SyncReply(reply_body), now);
        true
    }

    /// Upon receiving a `SyncReply`, check validity and either continue the synchronization process or conclude it.
    fn on_sync_reply(&mut self, header: MessageHeader, body: SyncReply, now: u128) -> bool {
        // ignore sync replies when not syncing
        if self.state != ProtocolState::Synchronizing {
            return header.magic == self.remote_magic;
        }
        // this is not an answer to our current request
        if body.random_reply != self.sync_random_request {
            trace!(handle = self.handle, "sync reply with wrong nonce, keep looking");
            return false;
        }

        if !self.connected {
            self.event_queue.push_back(Event::Connected);
            self.connected = true;
        }

        // the roundtrip was successful, keep probing until enough roundtrips confirm the peer
        self.sync_remaining_roundtrips -= 1;
        if self.sync_remaining_roundtrips > 0 {
            let evt = Event::Synchronizing {
                total: NUM_SYNC_PACKETS,
                count: NUM_SYNC_PACKETS - self.sync_remaining_roundtrips,
            };
            self.event_queue.push_back(evt);
            self.send_sync_request(now);
        } else {
            debug!(handle = self.handle, "endpoint synchronized");
            self.event_queue.push_back(Event::Synchronized);
            self.state = ProtocolState::Running;
            self.last_received_input.frame = NULL_FRAME;
            // the remote endpoint is now "authorized"
            self.remote_magic = header.magic;
        }
        true
    }

    fn on_input(&mut self, body: &Input, now: u128) -> bool {
        // if the peer wants out, disconnect now
        if body.disconnect_requested {
            if self.state != ProtocolState::Disconnected && !self.disconnect_event_sent {
                debug!(handle = self.handle, "disconnecting endpoint on remote request");
                self.event_queue.push_back(Event::Disconnected);
                self.disconnect_event_sent = true;
            }
        } else {
            // the remote view of each player may only move forward
            for (ours, theirs) in self
                .peer_connect_status
                .iter()
                .zip(body.peer_connect_status.iter())
            {
                if theirs.last_frame < ours.last_frame {
                    trace!(
                        handle = self.handle,
                        "dropping input message with regressed connect status"
                    );
                    return false;
                }
            }
            // merge the peer connection status into our own view
            for (ours, theirs) in self
                .peer_connect_status
                .iter_mut()
                .zip(body.peer_connect_status.iter())
            {
                ours.disconnected = ours.disconnected || theirs.disconnected;
                ours.last_frame = std::cmp::max(ours.last_frame, theirs.last_frame);
            }
        }

        let input_size = body.input_size as usize;
        if input_size != self.input_size || body.bits.len() % input_size != 0 {
            trace!(handle = self.handle, "dropping malformed input message");
            return false;
        }

        // before any input arrived, pretend we stopped right before the batch
        if self.last_received_input.frame == NULL_FRAME {
            self.last_received_input.frame = body.start_frame - 1;
        }

        let num_frames = body.bits.len() / input_size;
        for i in 0..num_frames {
            let frame = body.start_frame + i as i32;

            // the batch may not skip over frames we are still missing
            if frame > self.last_received_input.frame + 1 {
                trace!(
                    handle = self.handle,
                    frame,
                    last_received = self.last_received_input.frame,
                    "dropping input batch with a frame gap"
                );
                return false;
            }

            // frames we already hold are retransmit duplicates
            if frame <= self.last_received_input.frame {
                continue;
            }

            self.running_last_input_recv = now;

            let mut input = GameInput::new(frame, input_size);
            input.copy_input(&body.bits[i * input_size..(i + 1) * input_size]);
            self.last_received_input = input;

            trace!(handle = self.handle, frame, "received remote input");
            self.event_queue.push_back(Event::Input(input));
            self.send_input_ack(now);
        }

        // the peer piggybacks its ack on the input message
        self.pop_pending_output(body.ack_frame);
        true
    }

    /// Upon receiving an `InputAck`, discard all pending inputs older than the acked frame.
    fn on_input_ack(&mut self, body: InputAck) -> bool {
        self.pop_pending_output(body.ack_frame);
        true
    }

    /// Upon receiving a `QualityReport`, record the remote frame advantage and reply with a `QualityReply`.
    fn on_quality_report(&mut self, body: &QualityReport, now: u128) -> bool {
        self.remote_frame_advantage = body.frame_advantage as i32;
        let reply_body = QualityReply { pong: body.ping };
        self.queue_message(MessageBody::QualityReply(reply_body), now);
        true
    }

    /// Upon receiving a `QualityReply`, update the round trip time.
    fn on_quality_reply(&mut self, body: &QualityReply, now: u128) -> bool {
        self.round_trip_time = now.saturating_sub(body.pong);
        true
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod udp_protocol_tests {

    use super::*;

    struct TestSocket {
        sent: Vec<(SocketAddr, UdpMessage)>,
    }

    impl TestSocket {
        fn new() -> Self {
            Self { sent: Vec::new() }
        }

        fn drain_messages(&mut self) -> Vec<UdpMessage> {
            self.sent.drain(..).map(|(_, msg)| msg).collect()
        }
    }

    impl NonBlockingSocket for TestSocket {
        fn send_to(&mut self, msg: &UdpMessage, addr: SocketAddr) {
            self.sent.push((addr, msg.clone()));
        }

        fn receive_all_messages(&mut self) -> Vec<(SocketAddr, UdpMessage)> {
            Vec::new()
        }
    }

    fn test_addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn endpoint_pair() -> (UdpProtocol, UdpProtocol) {
        let ep1 = UdpProtocol::new(0, test_addr(8888), 2, 4, 1);
        let ep2 = UdpProtocol::new(1, test_addr(7777), 2, 4, 2);
        (ep1, ep2)
    }

    fn exchange(
        from: &mut UdpProtocol,
        to: &mut UdpProtocol,
        socket: &mut TestSocket,
        now: u128,
    ) -> Vec<Event> {
        from.send_all_messages(socket, now);
        for msg in socket.drain_messages() {
            to.handle_message(&msg, now);
        }
        let status = vec![ConnectionStatus::default(); 2];
        to.poll(&status, now).collect()
    }

    #[test]
    fn test_handshake_completes() {
        let (mut ep1, mut ep2) = endpoint_pair();
        let mut socket = TestSocket::new();
        ep1.synchronize(0);
        ep2.synchronize(0);

        let mut ep1_events = Vec::new();
        let mut ep2_events = Vec::new();
        for _ in 0..NUM_SYNC_PACKETS + 1 {
            ep2_events.extend(exchange(&mut ep1, &mut ep2, &mut socket, 0));
            ep1_events.extend(exchange(&mut ep2, &mut ep1, &mut socket, 0));
        }

        assert!(ep1.is_running());
        assert!(ep2.is_running());
        assert!(ep1_events.contains(&Event::Connected));
        assert!(ep1_events.contains(&Event::Synchronized));
        assert!(ep2_events.contains(&Event::Connected));
        assert!(ep2_events.contains(&Event::Synchronized));
        // after the handshake, only each other's packets are accepted
        assert_eq!(ep1.remote_magic, ep2.magic);
        assert_eq!(ep2.remote_magic, ep1.magic);
    }

    #[test]
    fn test_wrong_magic_is_rejected() {
        let (mut ep1, mut ep2) = endpoint_pair();
        let mut socket = TestSocket::new();
        ep1.synchronize(0);
        ep2.synchronize(0);
        for _ in 0..NUM_SYNC_PACKETS + 1 {
            exchange(&mut ep1, &mut ep2, &mut socket, 0);
            exchange(&mut ep2, &mut ep1, &mut socket, 0);
        }
        assert!(ep2.is_running());

        let stray = UdpMessage {
            header: MessageHeader {
                magic: ep1.magic.wrapping_add(1),
                sequence_number: ep2.next_recv_seq,
            },
            body: MessageBody::QualityReport(QualityReport {
                frame_advantage: 7,
                ping: 1,
            }),
        };
        ep2.handle_message(&stray, 0);
        assert_eq!(ep2.remote_frame_advantage, 0);
    }

    #[test]
    fn test_stale_sequence_is_dropped() {
        let (mut ep1, mut ep2) = endpoint_pair();
        let mut socket = TestSocket::new();
        ep1.synchronize(0);
        ep2.synchronize(0);
        for _ in 0..NUM_SYNC_PACKETS + 1 {
            exchange(&mut ep1, &mut ep2, &mut socket, 0);
            exchange(&mut ep2, &mut ep1, &mut socket, 0);
        }
        assert!(ep2.is_running());

        let cursor = ep2.next_recv_seq;
        let stale = UdpMessage {
            header: MessageHeader {
                magic: ep1.magic,
                // one behind the cursor wraps to a distance greater than MAX_SEQ_DISTANCE
                sequence_number: cursor.wrapping_sub(1),
            },
            body: MessageBody::QualityReport(QualityReport {
                frame_advantage: 7,
                ping: 1,
            }),
        };
        ep2.handle_message(&stale, 0);
        assert_eq!(ep2.remote_frame_advantage, 0);
        assert_eq!(ep2.next_recv_seq, cursor);
    }

    #[test]
    fn test_sync_reply_with_wrong_nonce_is_ignored() {
        let (mut ep1, _) = endpoint_pair();
        ep1.synchronize(0);
        let wrong_nonce = ep1.sync_random_request.wrapping_add(1);
        let reply = UdpMessage {
            header: MessageHeader {
                magic: 999,
                sequence_number: 0,
            },
            body: MessageBody::SyncReply(SyncReply {
                random_reply: wrong_nonce,
            }),
        };
        ep1.handle_message(&reply, 0);
        assert_eq!(ep1.sync_remaining_roundtrips, NUM_SYNC_PACKETS);
        assert!(!ep1.connected);
    }

    #[test]
    fn test_send_pump_latency_delays_release() {
        let (mut ep1, _) = endpoint_pair();
        let mut socket = TestSocket::new();
        ep1.set_send_latency(100);
        ep1.synchronize(0);

        // too early: the jitter is at least two thirds of the configured latency
        ep1.send_all_messages(&mut socket, 0);
        assert!(socket.sent.is_empty());

        // past the maximum jitter, the packet must be released
        ep1.send_all_messages(&mut socket, 200);
        assert_eq!(socket.sent.len(), 1);
    }

    #[test]
    fn test_send_pump_out_of_order_holds_one_packet() {
        let (mut ep1, _) = endpoint_pair();
        let mut socket = TestSocket::new();
        ep1.set_oo_percent(100);
        ep1.synchronize(0);

        // the only queued packet is held aside as the rogue out-of-order packet
        ep1.send_all_messages(&mut socket, 0);
        assert!(socket.sent.is_empty());
        assert!(ep1.oo_packet.is_some());

        // the rogue packet is released after at most a second
        ep1.send_all_messages(&mut socket, 2000);
        assert_eq!(socket.sent.len(), 1);
        assert!(ep1.oo_packet.is_none());
    }

    #[test]
    fn test_input_batch_walk_and_ack() {
        let (mut ep1, mut ep2) = endpoint_pair();
        let mut socket = TestSocket::new();
        ep1.synchronize(0);
        ep2.synchronize(0);
        for _ in 0..NUM_SYNC_PACKETS + 1 {
            exchange(&mut ep1, &mut ep2, &mut socket, 0);
            exchange(&mut ep2, &mut ep1, &mut socket, 0);
        }
        assert!(ep1.is_running() && ep2.is_running());

        let status = vec![ConnectionStatus::default(); 2];
        for frame in 0..3 {
            let mut input = GameInput::new(frame, 4);
            input.copy_input(&[frame as u8; 4]);
            ep1.send_input(input, &status, 0);
        }

        let events = exchange(&mut ep1, &mut ep2, &mut socket, 0);
        let received: Vec<Frame> = events
            .iter()
            .filter_map(|e| match e {
                Event::Input(input) => Some(input.frame),
                _ => None,
            })
            .collect();
        assert_eq!(received, vec![0, 1, 2]);
        assert_eq!(ep2.last_received_input.frame, 2);

        // the ack travels back and clears the pending output
        assert_eq!(ep1.pending_output.len(), 3);
        exchange(&mut ep2, &mut ep1, &mut socket, 0);
        assert_eq!(ep1.pending_output.len(), 1);
        assert_eq!(ep1.last_acked_input.frame, 1);
    }
}
