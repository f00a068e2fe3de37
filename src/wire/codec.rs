use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on one encoded envelope. Keeps a malformed or hostile length prefix from
/// allocating unbounded memory, and keeps multicast packets under typical UDP limits.
pub const MAX_FRAME_BYTES: usize = 60 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("frame of {0} bytes exceeds limit of {MAX_FRAME_BYTES}")]
    FrameTooLarge(usize),
}

/// Errors from framed stream I/O. `Closed` is the expected end of a reused connection
/// (EOF exactly at a frame boundary) so callers can branch on kind instead of guessing
/// from an io::Error.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("connection closed at frame boundary")]
    Closed,
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
    #[error("frame io error: {0}")]
    Io(#[from] io::Error),
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    let bytes = bincode::serialize(value).map_err(|e| WireError::Malformed(e.to_string()))?;
    if bytes.len() > MAX_FRAME_BYTES {
        return Err(WireError::FrameTooLarge(bytes.len()));
    }
    Ok(bytes)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    if bytes.len() > MAX_FRAME_BYTES {
        return Err(WireError::FrameTooLarge(bytes.len()));
    }
    bincode::deserialize(bytes).map_err(|e| WireError::Malformed(e.to_string()))
}

/// Read one length-prefixed frame from a stream (socket transport).
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, FrameError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(FrameError::Closed),
        Err(e) => return Err(FrameError::Io(e)),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(FrameError::Wire(WireError::FrameTooLarge(len)));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Write one length-prefixed frame to a stream (socket transport).
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError> {
    if payload.len() > MAX_FRAME_BYTES {
        return Err(FrameError::Wire(WireError::FrameTooLarge(payload.len())));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ChangeEventBuilder;
    use crate::wire::{AckMessage, Envelope, Packet};
    use bytes::Bytes;

    #[test]
    fn envelope_survives_encode_decode() {
        let event = ChangeEventBuilder::new("db").table("customer", 0, 1, 0).build().unwrap();
        let payload = Bytes::from(encode(&vec![event]).unwrap());
        let envelope = Envelope::Packet(Packet {
            sender_id: "node-a".to_string(),
            group_epoch: 1,
            packet_id: 7,
            payload,
        });

        let bytes = encode(&envelope).unwrap();
        let decoded: Envelope = decode(&bytes).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn garbage_bytes_are_malformed_not_panic() {
        let result = decode::<Envelope>(&[0xFF, 0x13, 0x37, 0x00, 0x01]);
        assert!(matches!(result, Err(WireError::Malformed(_))));
    }

    #[test]
    fn oversized_frame_rejected_before_deserialize() {
        let huge = vec![0u8; MAX_FRAME_BYTES + 1];
        let result = decode::<Envelope>(&huge);
        assert!(matches!(result, Err(WireError::FrameTooLarge(_))));
    }

    #[tokio::test]
    async fn frame_round_trip_and_clean_close() {
        let ack = Envelope::Ack(AckMessage {
            sender_id: "node-b".to_string(),
            origin_id: "node-a".to_string(),
            acked_up_to: 5,
        });
        let bytes = encode(&ack).unwrap();

        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, &bytes).await.unwrap();
        drop(client);

        let frame = read_frame(&mut server).await.unwrap();
        assert_eq!(decode::<Envelope>(&frame).unwrap(), ack);

        // EOF at the frame boundary is a clean close, not an io fault.
        assert!(matches!(read_frame(&mut server).await, Err(FrameError::Closed)));
    }
}
