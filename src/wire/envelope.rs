use crate::event::ChangeEvent;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Everything that crosses the wire, for both transports. One datagram carries exactly one
/// envelope (multicast); one length-prefixed frame carries exactly one envelope (socket).
///
/// No cross-version compatibility is promised beyond same-cluster same-build nodes.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Envelope {
    /// Socket path: events delivered over an already-reliable stream, no sequencing needed.
    Events { sender_id: String, events: Vec<ChangeEvent> },
    /// Multicast path: a sequenced unit of transmission.
    Packet(Packet),
    /// Cumulative acknowledgement watermark, receiver -> original sender.
    Ack(AckMessage),
    /// Selective holes observed by a receiver, receiver -> original sender.
    Nack(NackMessage),
    /// Socket path: per-frame success/failure written back to the caller.
    Receipt(Receipt),
}

/// One unit of multicast transmission. `packet_id` is sender-scoped, starts at 1 on process
/// start and is gap-free in send order; a gap observed by a receiver means loss. `group_epoch`
/// is bumped when the sender resets, so receivers never gap-fill across a restart.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub sender_id: String,
    pub group_epoch: u32,
    pub packet_id: u64,
    /// One or more bincode-encoded `ChangeEvent`s, batched when small.
    pub payload: Bytes,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct AckMessage {
    /// Who is acking.
    pub sender_id: String,
    /// Whose packets are being acked.
    pub origin_id: String,
    /// Highest contiguously received packet id. Non-decreasing per (sender, origin) pair.
    pub acked_up_to: u64,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct NackMessage {
    pub sender_id: String,
    pub origin_id: String,
    pub missing: Vec<u64>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub ok: bool,
    pub detail: Option<String>,
}

impl Packet {
    /// Decode the batched events carried in this packet's payload.
    pub fn events(&self) -> Result<Vec<ChangeEvent>, super::WireError> {
        super::decode::<Vec<ChangeEvent>>(&self.payload)
    }
}
