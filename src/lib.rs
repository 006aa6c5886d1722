pub mod client;
pub mod config;
pub mod download;
pub mod error;
pub mod handshake;
pub mod message;
pub mod metainfo;
pub mod parse;
pub mod piece;
pub mod serialise;
pub mod tracker;

pub use error::{Error, Result};
pub use parse::{BencodeDict, BencodeType};

/// Protocol identifier sent in the handshake
pub const PSTR: &str = "BitTorrent protocol";
/// Default local peer identifier
pub const PEER_ID: &[u8; 20] = b"-BF0001-abcd12345678";
/// Size of the handshake in both directions
pub const HANDSHAKE_BYTES_LEN: usize = 68;
/// Size of a SHA1 digest
pub const SHA1_LEN: usize = 20;

/// Render bytes as lowercase hex
pub fn to_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|val| format!("{:02x}", val))
        .collect::<Vec<String>>()
        .join("")
}
