use crate::PEER_ID;

/// Default port announced to the tracker
pub const DEFAULT_PORT: u16 = 6881;

/// Locally chosen identifiers and tracker options
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Identifier sent in the handshake and tracker request
    pub peer_id: [u8; 20],
    /// Reserved handshake bytes (extension flags)
    pub reserved: [u8; 8],
    /// Listening port announced to the tracker
    pub port: u16,
    /// Request the compact (6 bytes per peer) peer list
    pub compact: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            peer_id: *PEER_ID,
            reserved: [0; 8],
            port: DEFAULT_PORT,
            compact: true,
        }
    }
}

/// Parse a peer id given as exactly 20 ASCII bytes
pub fn parse_peer_id(value: &str) -> Result<[u8; 20], String> {
    <[u8; 20]>::try_from(value.as_bytes())
        .map_err(|_| format!("peer id must be 20 bytes, got {}", value.len()))
}
