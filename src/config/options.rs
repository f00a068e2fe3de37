use std::convert::TryFrom;
use std::net::{Ipv4Addr, SocketAddr};
use tokio::time::Duration;

/// Which transport carries cluster broadcasts. A closed set on purpose: selecting a
/// transport by class name and loading it dynamically is exactly what we avoid here.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransportKind {
    /// UDP multicast plus the application-level reliability layer.
    Multicast,
    /// Point-to-point TCP to a statically configured peer list.
    Socket,
    /// Clustering off; broadcasts become no-ops.
    Disabled,
}

#[derive(Clone, Debug)]
pub struct ClusterConfig {
    /// Identity of this node in the cluster, embedded in every outgoing envelope.
    pub local_node_id: String,
    pub transport: TransportKind,
    pub multicast: MulticastConfig,
    pub socket: SocketConfig,
    pub options: ClusterOptions,
}

#[derive(Clone, Debug)]
pub struct MulticastConfig {
    pub group: Ipv4Addr,
    pub port: u16,
    /// Local interface to join the group on. 0.0.0.0 lets the OS pick.
    pub interface: Ipv4Addr,
}

#[derive(Clone, Debug)]
pub struct SocketConfig {
    /// Port the local listener binds. Port 0 asks the OS for a free one.
    pub listen_port: u16,
    pub peers: Vec<SocketAddr>,
}

impl Default for MulticastConfig {
    fn default() -> Self {
        MulticastConfig {
            group: Ipv4Addr::new(235, 1, 1, 1),
            port: 4446,
            interface: Ipv4Addr::UNSPECIFIED,
        }
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        SocketConfig {
            listen_port: 0,
            peers: Vec::new(),
        }
    }
}

/// Tuning knobs, all optional. Absent values fall back to defaults; the whole set is
/// validated once at startup into `ClusterOptionsValidated`.
#[derive(Clone, Debug, Default)]
pub struct ClusterOptions {
    /// Cached packet older than this without full-group ack gets resent.
    pub resend_timeout: Option<Duration>,
    /// Resend attempts per packet before the lagging peer is escalated to resync.
    pub retry_budget: Option<u32>,
    /// A peer silent for this long is considered departed.
    pub silence_timeout: Option<Duration>,
    /// How often receivers emit cumulative acks and senders run the resend sweep.
    pub ack_interval: Option<Duration>,
    /// How many out-of-order packets a receiver buffers per sender.
    pub reorder_window: Option<usize>,
    /// Max unacknowledged packets retained; overflow evicts oldest and escalates laggards.
    pub outgoing_cache_capacity: Option<usize>,
    /// Socket transport: workers processing inbound connections.
    pub worker_pool_size: Option<usize>,
    /// Depth of the outbound queue between `notify_commit` and the transport.
    pub outbound_queue_depth: Option<usize>,
    /// Socket transport: attempts per send before the event is dropped.
    pub send_retries: Option<u32>,
    /// Socket transport: timeout for connect and for awaiting a receipt.
    pub io_timeout: Option<Duration>,
}

#[derive(Clone, Debug)]
pub(crate) struct ClusterOptionsValidated {
    pub resend_timeout: Duration,
    pub retry_budget: u32,
    pub silence_timeout: Duration,
    pub ack_interval: Duration,
    pub reorder_window: usize,
    pub outgoing_cache_capacity: usize,
    pub worker_pool_size: usize,
    pub outbound_queue_depth: usize,
    pub send_retries: u32,
    pub io_timeout: Duration,
}

impl ClusterOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.ack_interval >= self.silence_timeout {
            return Err("ack interval must be well below the peer silence timeout");
        }
        if self.resend_timeout < self.ack_interval {
            return Err("resend timeout below the ack interval would resend before peers can ack");
        }
        if self.worker_pool_size == 0 {
            return Err("worker pool must have at least one worker");
        }
        if self.outbound_queue_depth == 0 {
            return Err("outbound queue must hold at least one event");
        }
        if self.outgoing_cache_capacity == 0 {
            return Err("outgoing packet cache must hold at least one packet");
        }
        if self.reorder_window == 0 {
            return Err("reorder window must hold at least one packet");
        }

        Ok(())
    }
}

impl TryFrom<ClusterOptions> for ClusterOptionsValidated {
    type Error = &'static str;

    fn try_from(options: ClusterOptions) -> Result<Self, Self::Error> {
        let values = ClusterOptionsValidated {
            resend_timeout: options.resend_timeout.unwrap_or(Duration::from_millis(1000)),
            retry_budget: options.retry_budget.unwrap_or(5),
            silence_timeout: options.silence_timeout.unwrap_or(Duration::from_secs(30)),
            ack_interval: options.ack_interval.unwrap_or(Duration::from_millis(250)),
            reorder_window: options.reorder_window.unwrap_or(64),
            outgoing_cache_capacity: options.outgoing_cache_capacity.unwrap_or(1024),
            worker_pool_size: options.worker_pool_size.unwrap_or(4),
            outbound_queue_depth: options.outbound_queue_depth.unwrap_or(512),
            send_retries: options.send_retries.unwrap_or(3),
            io_timeout: options.io_timeout.unwrap_or(Duration::from_secs(5)),
        };

        values.validate()?;
        Ok(values)
    }
}
