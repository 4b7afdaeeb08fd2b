use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;

use crate::wire::MAX_LENGTH_PREFIX;

/// Supplies the opaque payload returned to discovery probes.
pub type DiscoveryResponse = Arc<dyn Fn() -> Vec<u8> + Send + Sync>;

/// Per-endpoint configuration, shared by all connections of a [`crate::server::Server`]
/// or [`crate::client::Client`]. Addresses and ports are passed at
/// `start` / `connect` time.
#[derive(Clone)]
pub struct EndpointConfig {
    /// Capacity of the per-connection outbound buffer on the reliable
    /// channel. Send calls fail with `BufferOverflow` when a frame does not
    /// fit into the free part, which happens when the application produces
    /// faster than the network drains.
    pub write_buffer_size: usize,

    /// Upper bound for a single serialized object on the reliable channel,
    /// and the size of the per-connection read buffer. Both peers must agree:
    /// an incoming length prefix above this bound is fatal for the
    /// connection.
    pub object_buffer_size: usize,

    /// Upper bound for a single serialized object on the datagram channel,
    /// and the size of the datagram receive buffer.
    pub datagram_buffer_size: usize,

    /// Free fraction of the write buffer above which the `idle` event is
    /// fired after a drain pass. Must be within `[0, 1]`.
    pub idle_threshold: f32,

    /// If no bytes are received for this interval while connected, the
    /// connection is closed and `disconnected` fires. `None` disables the
    /// check. Keep-alive frames count as received bytes, so this should be
    /// comfortably larger than the peer's keep-alive interval.
    pub receive_timeout: Option<Duration>,

    /// If nothing has been sent for this interval while connected, an empty
    /// keep-alive frame is queued on the reliable channel. `None` disables
    /// keep-alives.
    pub keep_alive: Option<Duration>,

    /// The single byte that discovery probes carry. Both peers must use the
    /// same value.
    pub discovery_magic: u8,

    /// Supplies the payload for discovery responses. The default responds
    /// with an empty datagram.
    pub discovery_response: DiscoveryResponse,
}

impl Default for EndpointConfig {
    fn default() -> EndpointConfig {
        EndpointConfig {
            write_buffer_size: 16 * 1024,
            object_buffer_size: 2 * 1024,
            datagram_buffer_size: 2 * 1024,
            idle_threshold: 0.9,
            receive_timeout: Some(Duration::from_millis(12_000)),
            keep_alive: Some(Duration::from_millis(8_000)),
            discovery_magic: 0xC3,
            discovery_response: Arc::new(Vec::new),
        }
    }
}

impl EndpointConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.object_buffer_size < 64 {
            bail!("object buffer size is too small");
        }
        if self.datagram_buffer_size < 64 {
            bail!("datagram buffer size is too small");
        }
        if self.write_buffer_size < self.object_buffer_size + MAX_LENGTH_PREFIX {
            bail!("write buffer must hold at least one maximum-size frame");
        }
        if !(0.0..=1.0).contains(&self.idle_threshold) {
            bail!("idle threshold must be within [0, 1]");
        }
        Ok(())
    }
}
