#![allow(dead_code)]

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use rollnet::{NonBlockingSocket, UdpMessage};

pub type MessageBuffer = Vec<(SocketAddr, UdpMessage)>;

/// An in-memory socket with scripted delivery. Sent messages stay invisible to the receiver
/// until the test explicitly flushes them, so tests can reproduce precise delivery timings,
/// withhold traffic from single peers or cut a connection entirely.
///
/// [`MockSocket::build_sockets`] generates fully connected sockets for all given addresses.
#[derive(Clone)]
pub struct MockSocket {
    /// Messages sent, but not yet flushed to the receiver, keyed by destination.
    sent_messages: HashMap<SocketAddr, Arc<Mutex<Vec<UdpMessage>>>>,

    /// The inbound buffer of every participating address, shared between all sockets.
    /// Flushing moves messages from the sent buffer into the destination's inbound buffer.
    remote_delivery_buffers: HashMap<SocketAddr, Arc<Mutex<MessageBuffer>>>,

    /// Delivered messages ready for consumption by the local owner of this socket.
    received_messages: Arc<Mutex<MessageBuffer>>,

    /// Address of the local socket.
    local_addr: SocketAddr,
}

impl MockSocket {
    /// Builds one socket per address such that each one can write to any other address.
    pub fn build_sockets(addrs: Vec<SocketAddr>) -> Vec<MockSocket> {
        let receive_buffers: HashMap<SocketAddr, Arc<Mutex<MessageBuffer>>> = addrs
            .iter()
            .map(|addr| (*addr, Arc::new(Mutex::new(Vec::new()))))
            .collect();

        addrs
            .iter()
            .map(|addr| MockSocket {
                sent_messages: addrs
                    .iter()
                    .map(|addr| (*addr, Arc::new(Mutex::new(Vec::new()))))
                    .collect(),
                remote_delivery_buffers: receive_buffers.clone(),
                received_messages: receive_buffers.get(addr).unwrap().clone(),
                local_addr: *addr,
            })
            .collect()
    }

    /// Delivers all pending messages to their receiving sockets.
    pub fn flush_messages(&mut self) {
        for (addr, sent) in self.sent_messages.iter_mut() {
            let mut sent = sent.lock().unwrap();
            let mut remote_buffer = self
                .remote_delivery_buffers
                .get_mut(addr)
                .unwrap()
                .lock()
                .unwrap();

            remote_buffer.extend(sent.drain(..).map(|msg| (self.local_addr, msg)));
        }
    }

    /// Delivers pending messages to the specified address only.
    pub fn flush_messages_to(&mut self, addr: SocketAddr) {
        let mut sent = self.sent_messages.get_mut(&addr).unwrap().lock().unwrap();
        let mut remote_buffer = self
            .remote_delivery_buffers
            .get_mut(&addr)
            .unwrap()
            .lock()
            .unwrap();

        remote_buffer.extend(sent.drain(..).map(|msg| (self.local_addr, msg)));
    }

    /// Drops all pending messages instead of delivering them.
    pub fn drop_pending_messages(&mut self) {
        for sent in self.sent_messages.values_mut() {
            sent.lock().unwrap().clear();
        }
    }
}

impl NonBlockingSocket for MockSocket {
    fn send_to(&mut self, msg: &UdpMessage, addr: SocketAddr) {
        let mut sent = self.sent_messages.get_mut(&addr).unwrap().lock().unwrap();
        sent.push(msg.clone());
    }

    fn receive_all_messages(&mut self) -> Vec<(SocketAddr, UdpMessage)> {
        let mut messages = self.received_messages.lock().unwrap();
        messages.drain(..).collect()
    }
}
