/// A snapshot of connection quality towards one remote endpoint, obtained
/// through [`P2PSession::network_stats`].
///
/// [`P2PSession::network_stats`]: crate::P2PSession::network_stats
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct NetworkStats {
    /// Estimated round trip time in milliseconds.
    pub ping_ms: u32,
    /// Number of inputs sent but not yet acknowledged by the peer.
    pub send_queue_len: usize,
    /// Estimated outbound bandwidth in kilobytes per second.
    pub kbps_sent: usize,
    /// How many frames the local client runs ahead of this peer (negative
    /// when behind).
    pub local_frames_ahead: i32,
    /// How many frames the peer reports running ahead of the local client.
    pub remote_frames_ahead: i32,
}

impl NetworkStats {
    /// Creates an all-zero stats value.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_is_zeroed() {
        let stats = NetworkStats::new();
        assert_eq!(stats.ping_ms, 0);
        assert_eq!(stats.send_queue_len, 0);
        assert_eq!(stats.kbps_sent, 0);
        assert_eq!(stats.local_frames_ahead, 0);
        assert_eq!(stats.remote_frames_ahead, 0);
    }
}
