use std::net::SocketAddr;
use std::time::Duration;
use anyhow::bail;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CompressionKind {
    None,
    Lz4,
}

#[derive(Debug)]
pub struct PeerNetConfig {
    pub self_addr: SocketAddr,

    /// This is the maximum size of a UDP payload, i.e. including the channel tag and the
    ///  compressed packet. Every slot in the send and receive pools has this size.
    ///
    /// With full Ethernet frames and no optional IP headers, this is `1500 - 20 - 8 = 1472` for
    ///  IPV4 and `1500 - 40 - 8 = 1452` for IPV6.
    pub max_datagram_size: usize,

    /// number of slots in the send pool, i.e. the maximum number of sends in flight at any time
    pub max_outstanding_sends: usize,
    /// number of slots in the receive pool, each of which always has a receive posted
    pub max_pending_receives: usize,
    pub worker_threads: usize,

    /// A peer with more than this number of unacknowledged keep-alive pings is considered
    ///  unreachable and dropped
    pub keep_alive_ceiling: usize,
    /// assumed RTT before the first sample arrives
    pub initial_rtt: Duration,
    /// lower bound for a peer's tick interval
    pub min_tick_interval: Duration,
    /// The weight of the rolling RTT average: each sample contributes `1/rtt_smoothing`
    pub rtt_smoothing: u32,

    /// The maximum distance between the next expected and the highest received packet on an
    ///  ordered channel. Gaps that fall out of this window are given up on.
    pub max_reorder_window: u64,
    pub max_naks_per_packet: usize,

    pub compression: CompressionKind,
}

impl PeerNetConfig {
    pub fn new(self_addr: SocketAddr) -> PeerNetConfig {
        PeerNetConfig {
            self_addr,
            max_datagram_size: 1472,
            max_outstanding_sends: 1024,
            max_pending_receives: 64,
            worker_threads: 4,
            keep_alive_ceiling: 1000,
            initial_rtt: Duration::from_millis(200),
            min_tick_interval: Duration::from_millis(50),
            rtt_smoothing: 6,
            max_reorder_window: 1024,
            max_naks_per_packet: 64,
            compression: CompressionKind::Lz4,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_datagram_size < 100 {
            bail!("max datagram size is too small");
        }
        if self.max_datagram_size > 65507 {
            bail!("max datagram size exceeds the maximum UDP payload");
        }
        if self.max_outstanding_sends == 0 {
            bail!("at least one send slot is required");
        }
        if self.max_pending_receives == 0 {
            bail!("at least one receive slot is required");
        }
        if self.worker_threads == 0 {
            bail!("at least one worker is required");
        }
        if self.rtt_smoothing == 0 {
            bail!("RTT smoothing must be at least 1");
        }
        if self.min_tick_interval.is_zero() {
            bail!("minimum tick interval must be positive");
        }
        if self.max_reorder_window == 0 {
            bail!("reorder window must be positive");
        }
        // a negative ack with all ids must fit into a single packet
        if self.max_naks_per_packet > u16::MAX as usize || 40 + 8 * self.max_naks_per_packet > self.max_datagram_size {
            bail!("max number of NAKs per packet does not fit into a datagram");
        }
        Ok(())
    }

    /// Builds a multi-threaded tokio runtime with one thread per configured worker. Using this
    ///  is optional - the protocol works on any multi-threaded runtime.
    pub fn build_runtime(&self) -> anyhow::Result<tokio::runtime::Runtime> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.worker_threads)
            .thread_name("peernet-worker")
            .enable_all()
            .build()?;
        Ok(runtime)
    }
}
