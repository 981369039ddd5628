use thiserror::Error;

use crate::proto;

/// Errors surfaced by the TPDP engine.
///
/// The first three variants have single-byte wire encodings that a node
/// sends to its source before closing a failed handshake; `from_wire_byte`
/// is the inverse mapping used by the client.
#[derive(Debug, Error)]
pub enum Error {
    /// Peer deviated from the expected byte sequence (bad hello, bad ACK,
    /// unexpected EOF mid-handshake). Fatal to the session.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A handshake step exceeded its deadline. Fatal to the session.
    #[error("handshake step timed out")]
    Timeout,

    /// The node could not open a connection to the nominated destination.
    #[error("destination connection failed")]
    DestinationConnection,

    /// The client could not construct a path (insufficient known nodes, or
    /// a hop's handshake failed).
    #[error("path construction failed: {0}")]
    PathBuild(String),

    /// Post-handshake socket failure. Never signalled on the wire; the
    /// session simply tears down.
    #[error("transport failure: {0}")]
    Transport(#[from] std::io::Error),
}

impl Error {
    /// Map a handshake error byte received from a node to its error kind.
    /// Returns `None` for bytes that are not error codes.
    pub fn from_wire_byte(byte: u8) -> Option<Error> {
        match byte {
            proto::ERR_TIMEOUT => Some(Error::Timeout),
            proto::ERR_PROTOCOL => Some(Error::Protocol("reported by peer".into())),
            proto::ERR_DESTINATION => Some(Error::DestinationConnection),
            _ => None,
        }
    }

    /// The single-byte wire encoding a node sends before closing, if this
    /// error kind has one.
    pub fn wire_byte(&self) -> Option<u8> {
        match self {
            Error::Timeout => Some(proto::ERR_TIMEOUT),
            Error::Protocol(_) => Some(proto::ERR_PROTOCOL),
            Error::DestinationConnection => Some(proto::ERR_DESTINATION),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_byte_roundtrip() {
        for byte in [0x00u8, 0x01, 0x02] {
            let err = Error::from_wire_byte(byte).expect("known error byte");
            assert_eq!(err.wire_byte(), Some(byte));
        }
    }

    #[test]
    fn test_unknown_bytes_are_not_errors() {
        assert!(Error::from_wire_byte(0x06).is_none());
        assert!(Error::from_wire_byte(0x17).is_none());
        assert!(Error::from_wire_byte(0xFF).is_none());
    }
}
