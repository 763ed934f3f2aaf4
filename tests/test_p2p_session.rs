mod mock_socket;
mod stubs;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use mock_socket::MockSocket;
use rollnet::{
    Clock, P2PSession, PlayerType, RollnetError, RollnetEvent, RollnetSession, SessionBuilder,
    SessionState, UdpNonBlockingSocket,
};
use serial_test::serial;
use stubs::{GameStub, MockClock, INPUT_SIZE};

fn local_addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
}

/// Builds two sessions communicating over in-memory sockets driven by a shared mock clock.
/// Returns the sessions plus the socket handles used to script message delivery.
fn mock_session_pair(
    clock: std::rc::Rc<MockClock>,
    disconnect_timeout: Duration,
    disconnect_notify_start: Duration,
) -> (P2PSession, P2PSession, MockSocket, MockSocket) {
    let addr1 = local_addr(7777);
    let addr2 = local_addr(8888);
    let sockets = MockSocket::build_sockets(vec![addr1, addr2]);
    let socket1 = sockets[0].clone();
    let socket2 = sockets[1].clone();

    let mut sess1 = SessionBuilder::new()
        .with_num_players(2)
        .with_input_size(INPUT_SIZE)
        .with_disconnect_timeout(disconnect_timeout)
        .with_disconnect_notify_delay(disconnect_notify_start)
        .with_clock(clock.clone())
        .with_rng_seed(1)
        .start_p2p_session(socket1.clone())
        .unwrap();
    sess1.add_player(PlayerType::Local, 0).unwrap();
    sess1.add_player(PlayerType::Remote(addr2), 1).unwrap();

    let mut sess2 = SessionBuilder::new()
        .with_num_players(2)
        .with_input_size(INPUT_SIZE)
        .with_disconnect_timeout(disconnect_timeout)
        .with_disconnect_notify_delay(disconnect_notify_start)
        .with_clock(clock)
        .with_rng_seed(2)
        .start_p2p_session(socket2.clone())
        .unwrap();
    sess2.add_player(PlayerType::Remote(addr1), 0).unwrap();
    sess2.add_player(PlayerType::Local, 1).unwrap();

    (sess1, sess2, socket1, socket2)
}

/// Runs handshake rounds until both sessions report `Running`, advancing the clock per round.
fn synchronize_sessions(
    sess1: &mut P2PSession,
    sess2: &mut P2PSession,
    stub1: &mut GameStub,
    stub2: &mut GameStub,
    socket1: &mut MockSocket,
    socket2: &mut MockSocket,
    clock: &MockClock,
    rounds: usize,
) {
    for _ in 0..rounds {
        sess1.idle(stub1).unwrap();
        sess2.idle(stub2).unwrap();
        socket1.flush_messages();
        socket2.flush_messages();
        clock.advance(500);
        if sess1.current_state() == SessionState::Running
            && sess2.current_state() == SessionState::Running
        {
            return;
        }
    }
    panic!("sessions did not synchronize");
}

#[test]
fn test_add_players() {
    let addr1 = local_addr(7777);
    let addr2 = local_addr(8888);
    let spec_addr = local_addr(9999);
    let sockets = MockSocket::build_sockets(vec![addr1, addr2, spec_addr]);

    let mut sess = SessionBuilder::new()
        .with_num_players(2)
        .with_input_size(INPUT_SIZE)
        .start_p2p_session(sockets[0].clone())
        .unwrap();

    // starting without enough players is not allowed
    assert!(sess.start_session().is_err());

    assert_eq!(sess.add_player(PlayerType::Local, 0).unwrap(), 0);
    // handles must be below the player count, spectators are offset
    assert!(sess.add_player(PlayerType::Remote(addr2), 2).is_err());
    assert!(matches!(
        sess.add_player(PlayerType::Local, 1),
        Err(RollnetError::InvalidRequest { .. })
    ));
    assert_eq!(sess.add_player(PlayerType::Remote(addr2), 1).unwrap(), 1);
    // duplicate handles are rejected
    assert!(sess.add_player(PlayerType::Remote(addr2), 1).is_err());
    assert_eq!(
        sess.add_player(PlayerType::Spectator(spec_addr), 2).unwrap(),
        1002
    );

    assert!(sess.start_session().is_ok());
    // the session has left the init phase
    assert!(sess.start_session().is_err());
    assert!(sess.add_player(PlayerType::Local, 0).is_err());
    assert_eq!(sess.current_state(), SessionState::Synchronizing);
}

#[test]
fn test_invalid_handles_and_requests() {
    let clock = MockClock::new(1000);
    let (mut sess1, _sess2, _socket1, _socket2) = mock_session_pair(
        clock.clone(),
        Duration::from_millis(2000),
        Duration::from_millis(500),
    );
    sess1.start_session().unwrap();

    // unknown and local handles cannot be disconnected
    assert!(matches!(
        sess1.disconnect_player(5),
        Err(RollnetError::InvalidHandle)
    ));
    assert!(matches!(
        sess1.disconnect_player(0),
        Err(RollnetError::InvalidHandle)
    ));

    // frame delay only applies to the local player
    assert!(sess1.set_frame_delay(2, 1).is_err());
    assert!(sess1.set_frame_delay(2, 0).is_ok());

    // no stats for the local player
    assert!(sess1.network_stats(0).is_err());

    // input is rejected while synchronizing
    assert!(matches!(
        sess1.add_local_input(0, &[0; INPUT_SIZE]),
        Err(RollnetError::NotSynchronized)
    ));
}

#[test]
#[serial]
fn test_synchronize_over_udp() {
    let addr1 = local_addr(9111);
    let addr2 = local_addr(9112);
    let socket1 = UdpNonBlockingSocket::bind_to_port(9111).unwrap();
    let socket2 = UdpNonBlockingSocket::bind_to_port(9112).unwrap();

    let mut sess1 = SessionBuilder::new()
        .with_input_size(INPUT_SIZE)
        .start_p2p_session(socket1)
        .unwrap();
    sess1.add_player(PlayerType::Local, 0).unwrap();
    sess1.add_player(PlayerType::Remote(addr2), 1).unwrap();
    sess1.start_session().unwrap();

    let mut sess2 = SessionBuilder::new()
        .with_input_size(INPUT_SIZE)
        .start_p2p_session(socket2)
        .unwrap();
    sess2.add_player(PlayerType::Remote(addr1), 0).unwrap();
    sess2.add_player(PlayerType::Local, 1).unwrap();
    sess2.start_session().unwrap();

    assert_eq!(sess1.current_state(), SessionState::Synchronizing);
    assert_eq!(sess2.current_state(), SessionState::Synchronizing);

    let mut stub1 = GameStub::new();
    let mut stub2 = GameStub::new();
    for _ in 0..50 {
        sess1.idle(&mut stub1).unwrap();
        sess2.idle(&mut stub2).unwrap();
        std::thread::sleep(Duration::from_millis(1));
    }

    assert_eq!(sess1.current_state(), SessionState::Running);
    assert_eq!(sess2.current_state(), SessionState::Running);
    assert!(stub1
        .events
        .iter()
        .any(|e| matches!(e, RollnetEvent::SynchronizedWithPeer { player_handle: 1 })));
    assert!(stub1.events.contains(&RollnetEvent::Running));
}

#[test]
fn test_handshake_with_deterministic_clock() {
    let clock = MockClock::new(1000);
    let (mut sess1, mut sess2, mut socket1, mut socket2) = mock_session_pair(
        clock.clone(),
        Duration::from_millis(2000),
        Duration::from_millis(500),
    );
    sess1.start_session().unwrap();
    sess2.start_session().unwrap();

    let mut stub1 = GameStub::new();
    let mut stub2 = GameStub::new();

    // a full roundtrip takes two delivery rounds, so the handshake must complete
    // within two rounds per sync packet plus the initial exchange
    synchronize_sessions(
        &mut sess1,
        &mut sess2,
        &mut stub1,
        &mut stub2,
        &mut socket1,
        &mut socket2,
        &clock,
        12,
    );

    for stub in [&stub1, &stub2] {
        assert!(stub
            .events
            .iter()
            .any(|e| matches!(e, RollnetEvent::ConnectedToPeer { .. })));
        assert!(stub
            .events
            .iter()
            .any(|e| matches!(e, RollnetEvent::SynchronizingWithPeer { .. })));
        assert!(stub
            .events
            .iter()
            .any(|e| matches!(e, RollnetEvent::SynchronizedWithPeer { .. })));
        assert!(stub.events.contains(&RollnetEvent::Running));
    }
}

#[test]
fn test_mirror_inputs_and_correct_mispredictions() {
    let clock = MockClock::new(1000);
    let (mut sess1, mut sess2, mut socket1, mut socket2) = mock_session_pair(
        clock.clone(),
        Duration::from_millis(2000),
        Duration::from_millis(500),
    );
    sess1.start_session().unwrap();
    sess2.start_session().unwrap();

    let mut stub1 = GameStub::new();
    let mut stub2 = GameStub::new();
    synchronize_sessions(
        &mut sess1,
        &mut sess2,
        &mut stub1,
        &mut stub2,
        &mut socket1,
        &mut socket2,
        &clock,
        20,
    );

    let input1 = [1, 2, 3, 4];
    let input2 = [5, 6, 7, 8];
    for i in 0..10 {
        sess1.idle(&mut stub1).unwrap();
        sess2.idle(&mut stub2).unwrap();

        sess1.add_local_input(0, &input1).unwrap();
        sess2.add_local_input(1, &input2).unwrap();

        // after the first remote inputs arrived, both sessions agree on all inputs:
        // confirmed remote inputs for past frames, repeat-predictions for the current one
        if i >= 2 {
            let (inputs, flags) = sess1.sync_input().unwrap();
            assert_eq!(flags, 0);
            assert_eq!(inputs[0].input(), &input1);
            assert_eq!(inputs[1].input(), &input2);

            let (inputs, flags) = sess2.sync_input().unwrap();
            assert_eq!(flags, 0);
            assert_eq!(inputs[0].input(), &input1);
            assert_eq!(inputs[1].input(), &input2);
        }

        sess1.advance_frame(&mut stub1).unwrap();
        sess2.advance_frame(&mut stub2).unwrap();

        socket1.flush_messages();
        socket2.flush_messages();

        // the gamestate advances by exactly one frame per call
        assert_eq!(stub1.gs.frame, i + 1);
        assert_eq!(stub2.gs.frame, i + 1);
    }

    // the initial zero-predictions for the remote player were wrong, so both sides rolled back
    assert!(!stub1.loaded_frames.is_empty());
    assert!(!stub2.loaded_frames.is_empty());
}

#[test]
fn test_prediction_threshold() {
    let clock = MockClock::new(1000);
    let (mut sess1, mut sess2, mut socket1, mut socket2) = mock_session_pair(
        clock.clone(),
        Duration::from_millis(2000),
        Duration::from_millis(500),
    );
    sess1.start_session().unwrap();
    sess2.start_session().unwrap();

    let mut stub1 = GameStub::new();
    let mut stub2 = GameStub::new();
    synchronize_sessions(
        &mut sess1,
        &mut sess2,
        &mut stub1,
        &mut stub2,
        &mut socket1,
        &mut socket2,
        &clock,
        20,
    );

    // without any remote input arriving, only 8 frames may be predicted ahead
    for _ in 0..8 {
        sess1.add_local_input(0, &[1, 0, 0, 0]).unwrap();
        sess1.advance_frame(&mut stub1).unwrap();
    }
    assert!(matches!(
        sess1.add_local_input(0, &[1, 0, 0, 0]),
        Err(RollnetError::PredictionThreshold)
    ));
}

#[test]
fn test_disconnect_on_timeout() {
    let clock = MockClock::new(1000);
    let (mut sess1, mut sess2, mut socket1, mut socket2) = mock_session_pair(
        clock.clone(),
        Duration::from_millis(3000),
        Duration::from_millis(1000),
    );
    sess1.start_session().unwrap();
    sess2.start_session().unwrap();

    let mut stub1 = GameStub::new();
    let mut stub2 = GameStub::new();
    synchronize_sessions(
        &mut sess1,
        &mut sess2,
        &mut stub1,
        &mut stub2,
        &mut socket1,
        &mut socket2,
        &clock,
        20,
    );

    // settle the last received time of session 1 at the current clock
    let settle_time = clock.now_millis();
    sess2.idle(&mut stub2).unwrap();
    socket2.flush_messages();
    sess1.idle(&mut stub1).unwrap();
    stub1.events.clear();

    // from now on, traffic from session 2 no longer arrives
    clock.set(settle_time + 1200);
    sess1.idle(&mut stub1).unwrap();
    sess1.idle(&mut stub1).unwrap();

    let interrupted: Vec<_> = stub1
        .events
        .iter()
        .filter(|e| matches!(e, RollnetEvent::ConnectionInterrupted { .. }))
        .collect();
    assert_eq!(interrupted.len(), 1);
    assert!(matches!(
        interrupted[0],
        RollnetEvent::ConnectionInterrupted {
            player_handle: 1,
            disconnect_timeout: 2000,
        }
    ));
    assert!(!stub1
        .events
        .iter()
        .any(|e| matches!(e, RollnetEvent::DisconnectedFromPeer { .. })));

    clock.set(settle_time + 3200);
    sess1.idle(&mut stub1).unwrap();
    sess1.idle(&mut stub1).unwrap();

    let disconnected: Vec<_> = stub1
        .events
        .iter()
        .filter(|e| matches!(e, RollnetEvent::DisconnectedFromPeer { .. }))
        .collect();
    assert_eq!(disconnected.len(), 1);
    assert!(matches!(
        disconnected[0],
        RollnetEvent::DisconnectedFromPeer { player_handle: 1 }
    ));

    // disconnecting again by hand is now an error
    assert!(matches!(
        sess1.disconnect_player(1),
        Err(RollnetError::PlayerDisconnected)
    ));
}

#[test]
fn test_network_stats_after_sync() {
    let clock = MockClock::new(1000);
    let (mut sess1, mut sess2, mut socket1, mut socket2) = mock_session_pair(
        clock.clone(),
        Duration::from_millis(2000),
        Duration::from_millis(500),
    );
    sess1.start_session().unwrap();
    sess2.start_session().unwrap();

    let mut stub1 = GameStub::new();
    let mut stub2 = GameStub::new();
    synchronize_sessions(
        &mut sess1,
        &mut sess2,
        &mut stub1,
        &mut stub2,
        &mut socket1,
        &mut socket2,
        &clock,
        20,
    );

    let stats = sess1.network_stats(1).unwrap();
    assert_eq!(stats.send_queue_len, 0);

    // closing flushes and drops the endpoints
    assert!(sess1.close().is_ok());
    assert!(sess1.network_stats(1).is_err());
}
