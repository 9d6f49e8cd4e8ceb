use std::time::Duration;

use anyhow::bail;

use crate::packet_header::PacketHeader;

/// Tunables recognized by the messaging core. One instance is shared by all
///  sessions created from the same [crate::context::RemoteContext].
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Deadline for a registered RPC continuation. The sweeper fires pending
    ///  entries with a timeout once this much time has passed since
    ///  registration.
    pub rpc_timeout: Duration,

    /// When set, an unsolicited link failure starts the reconnect supervisor
    ///  instead of tearing the session down immediately.
    pub is_reconnect: bool,

    /// How long the reconnect supervisor keeps retrying before giving up and
    ///  invalidating the session.
    pub reconnect_window: Duration,

    /// Capacity of each pooled serialization buffer. Must be at least
    ///  `max_packet_size` so a full packet always fits a single buffer.
    pub buffer_pool_chunk_size: usize,

    /// Number of reclaimed buffers retained by the pool - buffers returned in
    ///  excess of this are discarded.
    pub buffer_pool_size: usize,

    /// Upper limit for the `len` field of the packet header. Packets claiming
    ///  more are a framing violation.
    pub max_packet_size: usize,
}

impl Default for RemoteConfig {
    fn default() -> RemoteConfig {
        RemoteConfig {
            rpc_timeout: Duration::from_secs(30),
            is_reconnect: false,
            reconnect_window: Duration::from_secs(10),
            buffer_pool_chunk_size: 64 * 1024,
            buffer_pool_size: 4096,
            max_packet_size: 8192,
        }
    }
}

impl RemoteConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_packet_size < PacketHeader::SERIALIZED_LEN {
            bail!("max packet size {} is smaller than the packet header", self.max_packet_size);
        }
        if self.max_packet_size > u16::MAX as usize {
            bail!("max packet size {} does not fit the 16 bit length field", self.max_packet_size);
        }
        if self.buffer_pool_chunk_size < self.max_packet_size {
            bail!("buffer chunk size {} is smaller than max packet size {}", self.buffer_pool_chunk_size, self.max_packet_size);
        }
        Ok(())
    }

    /// Granularity of the per-session RPC timeout sweeper. Fine-grained enough
    ///  that an entry observably times out within 1.5x the configured timeout.
    pub(crate) fn rpc_sweep_interval(&self) -> Duration {
        (self.rpc_timeout / 2)
            .clamp(Duration::from_millis(10), Duration::from_secs(1))
    }
}
