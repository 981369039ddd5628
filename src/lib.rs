//! Torpydo — a peer-to-peer onion-routing overlay speaking TPDP/0.1.
//!
//! A client builds a chain of relay nodes toward a final destination. Each
//! hop runs an authenticated key exchange (X25519 + HKDF-SHA256), after
//! which stream data is layered-encrypted with AES-256-CTR so that every
//! node peels exactly one layer and none learns both the origin and the
//! final destination. Nodes announce themselves to a pool index, which the
//! client queries to pick random hops.

pub mod client;
pub mod crypto;
pub mod error;
pub mod index;
pub mod node;
pub mod proto;
pub mod types;

pub use error::{Error, Result};
