/// The `NetworkStats` struct contains statistics about the connection to one remote client.
#[derive(Debug, Default, Clone, Copy)]
pub struct NetworkStats {
    /// The length of the queue containing inputs which have not yet been acknowledged by the remote client.
    /// The send queue length is a rough indication of connection quality: the longer it is, the higher the
    /// round-trip time and the higher the packet loss.
    pub send_queue_len: usize,
    /// The roundtrip packet transmission time in milliseconds.
    pub ping: u128,
    /// The estimated bandwidth used towards the remote client, in kilobytes per second.
    pub kbps_sent: usize,
    /// The number of frames rollnet estimates the local client to be ahead of this remote client.
    /// Negative values mean the remote client is ahead.
    pub local_frames_ahead: i32,
    /// The same estimate, but from the perspective of the remote player as carried by its quality reports.
    pub remote_frames_ahead: i32,
}

impl NetworkStats {
    /// Creates a new `NetworkStats` instance with default values.
    pub fn new() -> Self {
        Self::default()
    }
}
