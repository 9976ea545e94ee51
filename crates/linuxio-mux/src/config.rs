use std::time::Duration;

/// Multiplexer tuning knobs.
///
/// Both ends of a connection must agree on `initial_window_size`; the
/// remaining values are local policy.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Ceiling for a single control frame. Larger envelopes fail to
    /// encode, larger announced frames kill the connection.
    pub max_frame_size: usize,
    /// Starting credit for each DATA direction of a stream.
    pub initial_window_size: u32,
    /// DATA payloads are chunked to at most this size.
    pub max_data_chunk: usize,
    /// Idle time on the send side before a PING is emitted.
    pub keepalive_idle: Duration,
    /// How long the peer has to answer a PING with a PONG.
    pub keepalive_deadline: Duration,
    /// Per-stream PROGRESS buffer; oldest records are dropped on overflow.
    pub progress_queue_depth: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            max_frame_size: linuxio_proto::DEFAULT_MAX_FRAME_SIZE,
            initial_window_size: 256 * 1024,
            max_data_chunk: 64 * 1024,
            keepalive_idle: Duration::from_secs(20),
            keepalive_deadline: Duration::from_secs(10),
            progress_queue_depth: 32,
        }
    }
}
