//! Error types for the simulation core.

use crate::net::packet::Address;
use thiserror::Error;

/// Wire codec errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    /// Buffer shorter than the variant's fixed minimum length
    #[error("truncated packet: need {needed} bytes, have {have}")]
    Truncated { needed: usize, have: usize },

    /// Unknown packet kind byte
    #[error("unknown packet kind {0:#04x}")]
    UnknownKind(u8),

    /// Unsupported wire format version
    #[error("unsupported wire version {0}")]
    UnsupportedVersion(u8),

    /// Declared payload length exceeds the remaining buffer
    #[error("payload length {declared} exceeds remaining {remaining} bytes")]
    BadPayloadLength { declared: usize, remaining: usize },

    /// Invalid bounding region tag
    #[error("invalid bounding region tag {0}")]
    BadRegionTag(u8),

    /// A sub-packet kind not allowed inside a hybrid batch
    #[error("packet kind {0:#04x} cannot be nested in a hybrid batch")]
    BadHybridMember(u8),
}

/// Transport (socket/stream) errors
///
/// These are the only error class besides fatal conditions that should
/// surface to a top-level caller; everything protocol-level is handled
/// at the entity boundary.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Socket creation/bind/listen failed; `start` rolls back and fails
    #[error("bind failed on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    /// Connecting to a peer failed
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    /// Mid-stream read failure; the connection is dropped, not retried
    #[error("read from {peer} failed: {source}")]
    Read {
        peer: String,
        source: std::io::Error,
    },

    /// Mid-stream write failure; the packet is dropped, not retried
    #[error("write to {peer} failed: {source}")]
    Write {
        peer: String,
        source: std::io::Error,
    },

    /// Transport is not running
    #[error("transport not started")]
    NotStarted,

    /// Undecodable bytes from a peer
    #[error("codec error from {peer}: {source}")]
    Codec { peer: String, source: CodecError },

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Model configuration errors, one distinguishing variant per failure
/// class so a loader can report which parameter was at fault and keep
/// loading other models.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Required parameter missing from the dictionary
    #[error("model {model}: missing parameter `{key}`")]
    MissingParam { model: String, key: String },

    /// Parameter present but not parseable as the declared type
    #[error("model {model}: parameter `{key}` invalid: {reason}")]
    InvalidParam {
        model: String,
        key: String,
        reason: String,
    },

    /// Unknown policy type tag at init
    #[error("model {model}: unknown policy tag `{tag}`")]
    UnknownPolicy { model: String, tag: String },

    /// Two entities configured with the same address
    #[error("duplicate address {0} in registry")]
    DuplicateAddress(Address),

    /// Model dependency list cannot be ordered
    #[error("dependency cycle involving model `{0}`")]
    DependencyCycle(String),

    /// A declared dependency does not exist
    #[error("model {model} depends on unknown model `{dependency}`")]
    UnknownDependency { model: String, dependency: String },
}

/// Why a packet left the receive state machine without being delivered.
///
/// These are expected outcomes, not failures; they are counted, never
/// logged as errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// Not addressed to this entity
    AddressMismatch,
    /// Hop count exhausted
    HopLimitExceeded,
    /// Sequence already recorded by the link layer
    Duplicate,
    /// Transmitter outside the physical range threshold
    OutOfRange,
    /// Reception window overlapped an earlier one on the channel
    Collision,
    /// Message lifetime elapsed before reception completed
    ExpiredLifetime,
    /// Receiver was inactive
    Inactive,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DropReason::AddressMismatch => "address mismatch",
            DropReason::HopLimitExceeded => "hop limit exceeded",
            DropReason::Duplicate => "duplicate",
            DropReason::OutOfRange => "out of range",
            DropReason::Collision => "collision",
            DropReason::ExpiredLifetime => "expired lifetime",
            DropReason::Inactive => "receiver inactive",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors_name_the_peer() {
        let read = TransportError::Read {
            peer: "10.0.0.5:46001".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"),
        };
        assert!(read.to_string().contains("10.0.0.5:46001"));

        let codec = TransportError::Codec {
            peer: "10.0.0.5:46001".to_string(),
            source: CodecError::UnknownKind(0x7F),
        };
        let message = codec.to_string();
        assert!(message.contains("10.0.0.5:46001"));
        assert!(message.contains("0x7f"));
    }
}
