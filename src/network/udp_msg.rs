use serde::{Deserialize, Serialize};

use crate::{Frame, NULL_FRAME};

/// Messages whose sequence number is further than this ahead of the receive cursor (in wrapping
/// u16 arithmetic) are considered old duplicates and dropped.
pub(crate) const MAX_SEQ_DISTANCE: u16 = 1 << 15;

/// What a peer knows about one player of the session: whether the player was disconnected and the
/// last frame an input was received for. Carried on every input message and merged monotonically.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ConnectionStatus {
    pub disconnected: bool,
    pub last_frame: Frame,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            disconnected: false,
            last_frame: NULL_FRAME,
        }
    }
}

/// Every message starts with this header. The magic number identifies the sending session and is
/// used to reject stray packets; the sequence number orders packets per endpoint.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct MessageHeader {
    pub magic: u16,
    pub sequence_number: u16,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct SyncRequest {
    /// please reply back with this random data
    pub random_request: u32,
    /// the magic number of the requesting session
    pub remote_magic: u16,
    /// which endpoint of the requesting session this is
    pub remote_endpoint: u8,
    /// the input delay configured on the requesting side
    pub remote_input_delay: u8,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct SyncReply {
    /// here's your random data back
    pub random_reply: u32,
}

/// A batch of consecutive inputs starting at `start_frame`. `bits` is the plain concatenation of
/// one `input_size`-byte slice per frame; retransmits simply resend everything not yet acked.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Input {
    pub peer_connect_status: Vec<ConnectionStatus>,
    pub disconnect_requested: bool,
    pub start_frame: Frame,
    pub ack_frame: Frame,
    pub input_size: u8,
    pub checksum: u32,
    pub bits: Vec<u8>,
}

impl Default for Input {
    fn default() -> Self {
        Self {
            peer_connect_status: Vec::new(),
            disconnect_requested: false,
            start_frame: NULL_FRAME,
            ack_frame: NULL_FRAME,
            input_size: 0,
            checksum: 0,
            bits: Vec::new(),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct InputAck {
    pub ack_frame: Frame,
}

impl Default for InputAck {
    fn default() -> Self {
        Self {
            ack_frame: NULL_FRAME,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct QualityReport {
    /// frame advantage of the sending player
    pub frame_advantage: i8,
    pub ping: u128,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct QualityReply {
    pub pong: u128,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum MessageBody {
    SyncRequest(SyncRequest),
    SyncReply(SyncReply),
    Input(Input),
    InputAck(InputAck),
    QualityReport(QualityReport),
    QualityReply(QualityReply),
    KeepAlive,
}

/// A message that [`NonBlockingSocket`] implementations send and receive. When implementing
/// [`NonBlockingSocket`] yourself, deserialize received datagrams into this type and pass them on.
///
/// [`NonBlockingSocket`]: crate::NonBlockingSocket
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdpMessage {
    pub(crate) header: MessageHeader,
    pub(crate) body: MessageBody,
}

// #########
// # TESTS #
// #########
