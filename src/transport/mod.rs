mod multicast;
mod null;
mod socket;

pub(crate) use multicast::MulticastTransport;
pub(crate) use null::NullTransport;
pub(crate) use socket::SocketTransport;

use crate::config::TransportKind;
use crate::event::ChangeEvent;
use std::io;

/// Failure to hand an event to the transport's outbound queue. Both kinds are contained by
/// the coordinator (logged and counted); nothing propagates to the committing transaction.
#[derive(Debug, thiserror::Error)]
pub(crate) enum OfferError {
    #[error("outbound queue is full")]
    QueueFull,
    #[error("transport has stopped")]
    Stopped,
}

/// Startup-time failure (bad group address, port in use). The caller degrades to disabled
/// clustering with a loud log; a node serves correctly without cluster coherence.
#[derive(Debug, thiserror::Error)]
pub(crate) enum TransportStartError {
    #[error("failed to bind transport socket: {0}")]
    Bind(io::Error),
    #[error("failed to join multicast group: {0}")]
    JoinGroup(io::Error),
}

/// Reliability-layer numbers a transport can report for the status snapshot. The socket
/// transport has no sequencing, so it reports only its peer count.
#[derive(Clone, Debug, Default)]
pub(crate) struct TransportStatus {
    pub group_size: usize,
    pub outgoing_cache_size: usize,
    pub current_packet_id: u64,
    pub min_acked_packet_id: u64,
    pub ack_digest: String,
}

/// The seam between the coordinator and the delivery mechanism. `offer` must be cheap and
/// non-blocking: it is called on the committing thread.
#[async_trait::async_trait]
pub(crate) trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn offer(&self, event: ChangeEvent) -> Result<(), OfferError>;

    fn status(&self) -> TransportStatus;

    /// Stop background tasks and join them with a bounded wait. A hung worker is left to
    /// finish on its own rather than force-killed.
    async fn shutdown(&self);
}
