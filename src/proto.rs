//! TPDP/0.1 wire constants.
//!
//! The handshake is a fixed byte sequence: hello exchange, X25519 public
//! keys, AES-CTR nonce, then the encrypted destination negotiation. All
//! multi-byte integers on the wire are big-endian. ACK, ETB and the error
//! bytes travel node→source in the clear; everything the source sends after
//! its nonce is ciphertext.

use std::time::Duration;

/// Protocol hello, exchanged verbatim in both directions.
pub const HELLO: &[u8; 16] = b"Hello TPDP/0.1\r\n";

/// Positive acknowledgement of a handshake step.
pub const ACK: [u8; 2] = [0x06, 0x06];

/// End-of-transmission-block: the destination connection is up and the
/// session switches to stream forwarding.
pub const ETB: [u8; 2] = [0x17, 0x17];

/// Handshake step deadline expired.
pub const ERR_TIMEOUT: u8 = 0x00;
/// Peer broke the handshake byte sequence.
pub const ERR_PROTOCOL: u8 = 0x01;
/// The nominated destination could not be reached.
pub const ERR_DESTINATION: u8 = 0x02;

/// X25519 public key size on the wire.
pub const PUBLIC_KEY_LEN: usize = 32;
/// AES-CTR initial counter block size on the wire.
pub const NONCE_LEN: usize = 16;

/// Per-step handshake deadline. Data forwarding is exempt: post-handshake
/// reads block indefinitely.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
