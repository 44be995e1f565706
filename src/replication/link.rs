//! Peer Links
//!
//! One-directional push channels from the leader to a single follower.

use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Error, Result};

/// Request method used for a push. Pushes replace the follower's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushMethod {
    Put,
}

impl std::fmt::Display for PushMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PushMethod::Put => write!(f, "PUT"),
        }
    }
}

/// A single push to a follower
#[derive(Debug, Clone)]
pub struct PushRequest {
    pub method: PushMethod,
    pub content_type: String,
    pub body: Bytes,
}

/// Result of a push
#[derive(Debug)]
pub enum PushOutcome {
    /// Follower applied the content
    Success,
    /// Follower refused because it considers itself authoritative
    Rejected(String),
    /// Transport failure, timeout or unexpected status
    Failed(Error),
}

/// Push channel to one follower
///
/// The replication engine guarantees at most one outstanding `send` per link.
#[async_trait::async_trait]
pub trait PeerLink: Send + Sync {
    /// Push a request and wait for exactly one outcome
    async fn send(&self, request: PushRequest) -> PushOutcome;

    /// Address of the follower this link pushes to
    fn address(&self) -> &str;
}

/// Creates links to follower addresses
pub trait PeerLinkFactory: Send + Sync {
    /// Create a link, rejecting malformed addresses
    fn link(&self, address: &str) -> Result<Arc<dyn PeerLink>>;

    /// Release every link created by this factory
    fn close_all(&self) {}
}

/// Check that an address has the form `host:port`
pub fn validate_address(address: &str) -> Result<()> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| Error::InvalidAddress(address.to_string()))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() || host.chars().any(char::is_whitespace) {
        return Err(Error::InvalidAddress(address.to_string()));
    }
    match port.parse::<u16>() {
        Ok(p) if p > 0 => Ok(()),
        _ => Err(Error::InvalidAddress(address.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_address() {
        assert!(validate_address("10.0.0.2:6643").is_ok());
        assert!(validate_address("controller-2.lab:8443").is_ok());
        assert!(validate_address("[fe80::1]:6643").is_ok());

        assert!(validate_address("10.0.0.2").is_err());
        assert!(validate_address(":6643").is_err());
        assert!(validate_address("10.0.0.2:0").is_err());
        assert!(validate_address("10.0.0.2:http").is_err());
        assert!(validate_address("bad host:1").is_err());
    }
}
