mod codec;
mod envelope;

pub use codec::decode;
pub use codec::encode;
pub use codec::read_frame;
pub use codec::write_frame;
pub use codec::FrameError;
pub use codec::WireError;
pub use codec::MAX_FRAME_BYTES;
pub use envelope::AckMessage;
pub use envelope::Envelope;
pub use envelope::NackMessage;
pub use envelope::Packet;
pub use envelope::Receipt;
