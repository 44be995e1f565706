//! Election Protocol
//!
//! Defines the wire messages exchanged between domain peers during leader
//! election.

use serde::{Deserialize, Serialize};

use crate::state::{DomainId, NodeId};

/// Election message envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionMessage {
    /// Domain the sender belongs to
    pub domain_id: DomainId,
    /// Opaque id for tracing, unique per sender
    pub transaction_id: u64,
    /// Message payload
    pub body: ElectionBody,
}

/// Election message payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElectionBody {
    /// Sender is standing for election with the given weight
    Candidate { from: NodeId, weight: i32 },

    /// Sender has won the election and is about to take office
    LeaderAnnounce { from: NodeId, weight: i32 },

    /// Sender accepts the recipient as leader
    LeaderAck { from: NodeId },
}

impl ElectionBody {
    /// Node that sent this message
    pub fn sender(&self) -> NodeId {
        match *self {
            ElectionBody::Candidate { from, .. }
            | ElectionBody::LeaderAnnounce { from, .. }
            | ElectionBody::LeaderAck { from } => from,
        }
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            ElectionBody::Candidate { .. } => "Candidate",
            ElectionBody::LeaderAnnounce { .. } => "LeaderAnnounce",
            ElectionBody::LeaderAck { .. } => "LeaderAck",
        }
    }
}

impl ElectionMessage {
    /// Serialize message to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Upper bound on a single election frame
    pub const MAX_LENGTH: u32 = 64 * 1024;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let [l0, l1, l2, l3, c0, c1, c2, c3] = *bytes;
        Self {
            length: u32::from_le_bytes([l0, l1, l2, l3]),
            checksum: u32::from_le_bytes([c0, c1, c2, c3]),
        }
    }
}
