use std::time::Duration;

use serde::Deserialize;

/// Tunables for a [`crate::Comm`] instance.
///
/// Millisecond fields are plain integers so the struct deserializes from any
/// config front end without custom parsing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CommConfig {
    /// Number of reactor threads. Defaults to the host core count.
    pub reactor_count: usize,
    /// Upper bound on how long a reactor blocks in the OS readiness call.
    pub poll_interval_ms: u64,
    /// Per-connection cap on bytes sitting in the outbound frame queue.
    pub send_queue_bytes: usize,
    /// Frames whose header claims more than this disconnect the peer.
    pub max_frame_bytes: usize,
    /// Per-attempt connect timeout used by the connection manager.
    pub connect_timeout_ms: u64,
    /// Initial reconnect backoff.
    pub reconnect_initial_ms: u64,
    /// Reconnect backoff cap.
    pub reconnect_max_ms: u64,
    /// Optional kernel SO_SNDBUF/SO_RCVBUF size applied to stream sockets.
    pub socket_buf_bytes: Option<usize>,
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            reactor_count: std::thread::available_parallelism().map_or(1, |n| n.get()),
            poll_interval_ms: 1000,
            send_queue_bytes: 16 * 1024 * 1024,
            max_frame_bytes: 32 * 1024 * 1024,
            connect_timeout_ms: 10_000,
            reconnect_initial_ms: 1000,
            reconnect_max_ms: 30_000,
            socket_buf_bytes: None,
        }
    }
}

impl CommConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }
}
