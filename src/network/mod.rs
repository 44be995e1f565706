//! Network Module
//!
//! Election transport abstraction and stream framing for election messages.

pub mod protocol;
pub mod local;

pub use protocol::{ElectionBody, ElectionMessage, FrameHeader};
pub use local::{LocalLinkFactory, LocalNetwork};

use crate::error::{Error, Result};
use crate::state::NodeId;

/// Carries election messages between domain peers
///
/// Delivery is at-most-once and unordered across senders. Implementations
/// must not call back into the sending election synchronously.
#[async_trait::async_trait]
pub trait ElectionTransport: Send + Sync {
    /// Send a message to a peer
    async fn send(&self, to: NodeId, message: ElectionMessage) -> Result<()>;

    /// Whether the peer is currently connected
    fn is_connected(&self, node: NodeId) -> bool;
}

/// Read a framed election message from a reader
pub async fn read_message<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<ElectionMessage> {
    use tokio::io::AsyncReadExt;

    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length > FrameHeader::MAX_LENGTH {
        return Err(Error::Network(format!("Frame too large: {} bytes", header.length)));
    }

    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    if crc32fast::hash(&body) != header.checksum {
        return Err(Error::ChecksumMismatch);
    }

    Ok(ElectionMessage::deserialize(&body)?)
}

/// Write a framed election message to a writer
pub async fn write_message<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    message: &ElectionMessage,
) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let body = message.serialize()?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}
