use std::io;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::swarm::unit::UnitMetadata;
use crate::swarm::PeerId;

// ── Peer wire ───────────────────────────────────────────────────────────────

/// Upper bound on a single frame, prefix excluded. A full 64 KB piece
/// plus framing fits comfortably; anything near this size is hostile or
/// corrupt.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Messages carried on a peer wire. Bincode-encoded, with a `u32`
/// little-endian length prefix per frame.
///
/// `Handshake` must be the first frame in each direction; it pins the
/// unit being exchanged and declares the sender's extension capabilities
/// once, permanently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    Handshake {
        info_hash: [u8; 20],
        peer_id: PeerId,
        capabilities: Vec<String>,
    },
    Metadata(UnitMetadata),
    Bitfield(Vec<bool>),
    Have(u32),
    Request(u32),
    Piece {
        index: u32,
        data: Vec<u8>,
    },
    /// Named extension channel payload. Sent only to peers that declared
    /// the capability; decoded (or dropped) above this layer.
    Extended {
        name: String,
        payload: Vec<u8>,
    },
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let encoded = bincode::serialize(frame)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = encoded.len() as u32;
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(&encoded).await?;
    writer.flush().await
}

pub async fn read_frame<R>(reader: &mut R) -> io::Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    reader.read_exact(&mut prefix).await?;
    let len = u32::from_le_bytes(prefix);
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("peer announced frame of {len} bytes"),
        ));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    bincode::deserialize(&buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_roundtrip_in_order() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let frames = vec![
            Frame::Handshake {
                info_hash: [7u8; 20],
                peer_id: "-WA0001-abcdefghijkl".into(),
                capabilities: vec!["watchalong_sync".into()],
            },
            Frame::Have(3),
            Frame::Piece {
                index: 1,
                data: vec![0xAB; 4096],
            },
            Frame::Extended {
                name: "watchalong_signaling".into(),
                payload: br#"{"type":"offer","sdp":"v=0"}"#.to_vec(),
            },
        ];
        for frame in &frames {
            write_frame(&mut a, frame).await.unwrap();
        }
        for expected in &frames {
            let got = read_frame(&mut b).await.unwrap();
            assert_eq!(&got, expected);
        }
    }

    #[tokio::test]
    async fn oversized_prefix_is_rejected_before_allocation() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let bogus = (MAX_FRAME_SIZE + 1).to_le_bytes();
        a.write_all(&bogus).await.unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn truncated_stream_surfaces_eof() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&8u32.to_le_bytes()).await.unwrap();
        a.write_all(&[1, 2, 3]).await.unwrap();
        drop(a);
        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn garbage_payload_is_invalid_data() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&4u32.to_le_bytes()).await.unwrap();
        a.write_all(&[0xFF, 0xFF, 0xFF, 0xFF]).await.unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
