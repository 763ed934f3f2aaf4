use std::{
    io::ErrorKind,
    net::{SocketAddr, ToSocketAddrs, UdpSocket},
};

use tracing::warn;

use crate::network::udp_msg::UdpMessage;

const RECV_BUFFER_SIZE: usize = 4096;

/// This `NonBlockingSocket` trait is used when you want to use rollnet with your own transport.
/// However you wish to send and receive messages, it should be implemented through these two
/// methods. Messages are expected to be sent in a UDP-like fashion, unordered and unreliable;
/// rollnet runs its own protocol on top to make sure all important information arrives.
pub trait NonBlockingSocket {
    /// Takes a [`UdpMessage`] and sends it to the given address. Best effort, must not block.
    fn send_to(&mut self, msg: &UdpMessage, addr: SocketAddr);

    /// Returns all messages received since the last time this method was called.
    /// The pairs `(SocketAddr, UdpMessage)` indicate from which address each message was received.
    fn receive_all_messages(&mut self) -> Vec<(SocketAddr, UdpMessage)>;
}

/// The default `NonBlockingSocket` implementation, backed by a nonblocking UDP socket.
#[derive(Debug)]
pub struct UdpNonBlockingSocket {
    socket: UdpSocket,
    buffer: [u8; RECV_BUFFER_SIZE],
}

impl UdpNonBlockingSocket {
    /// Binds a nonblocking UDP socket on all interfaces with the given port.
    pub fn bind_to_port(port: u16) -> Result<Self, std::io::Error> {
        Self::bind(("0.0.0.0", port))
    }

    /// Binds a nonblocking UDP socket to the given address.
    pub fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self, std::io::Error> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            buffer: [0; RECV_BUFFER_SIZE],
        })
    }
}

impl NonBlockingSocket for UdpNonBlockingSocket {
    fn send_to(&mut self, msg: &UdpMessage, addr: SocketAddr) {
        let buf = bincode::serialize(&msg).expect("message serialization failed");
        // best effort: a failed send is indistinguishable from a lost datagram for the peer
        if let Err(err) = self.socket.send_to(&buf, addr) {
            warn!(%addr, %err, "dropping outbound message");
        }
    }

    fn receive_all_messages(&mut self) -> Vec<(SocketAddr, UdpMessage)> {
        let mut received_messages = Vec::new();
        loop {
            match self.socket.recv_from(&mut self.buffer) {
                Ok((number_of_bytes, src_addr)) => {
                    assert!(number_of_bytes <= RECV_BUFFER_SIZE);
                    // malformed datagrams are dropped, they are not from a rollnet peer
                    match bincode::deserialize(&self.buffer[0..number_of_bytes]) {
                        Ok(msg) => received_messages.push((src_addr, msg)),
                        Err(err) => warn!(addr = %src_addr, %err, "dropping malformed datagram"),
                    }
                }
                // there are no more messages
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => return received_messages,
                // datagram sockets sometimes get this error as a result of calling the send_to method
                Err(ref err) if err.kind() == ErrorKind::ConnectionReset => continue,
                // all other errors cause a panic
                Err(err) => panic!("{:?}: {} on {:?}", err.kind(), err, &self.socket),
            }
        }
    }
}
