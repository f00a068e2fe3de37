//! Application-level reliability over an unreliable datagram transport: sender-scoped
//! monotonic packet ids, a bounded cache of unacknowledged packets, per-peer ack
//! watermarks, NACK-driven and timer-driven retransmission, and escalation to a full
//! invalidate when incremental repair is no longer possible.

mod inbound;
mod membership;
mod outbound;
mod peer_table;

pub use inbound::Accepted;
pub use inbound::InboundSequencer;
pub use outbound::NackReply;
pub use outbound::OutboundSequencer;
pub use outbound::Prepared;
pub use outbound::SequencerSnapshot;
pub use outbound::Sweep;
pub use peer_table::PeerSyncState;
