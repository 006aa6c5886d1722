use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};
use crate::{HANDSHAKE_BYTES_LEN, PSTR, SHA1_LEN};

const PROTOCOL_ID_LEN: u8 = 0x13;
const RESERVED_LEN: usize = 8;

/// BitTorrent handshake
#[derive(Debug, Clone, PartialEq)]
pub struct Handshake {
    /// Extension flags
    pub reserved: [u8; RESERVED_LEN],
    /// SHA1 hash of bencoded `info` dict of file
    pub info_hash: [u8; SHA1_LEN],
    /// Identifier of peer
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(reserved: [u8; RESERVED_LEN], info_hash: [u8; SHA1_LEN], peer_id: [u8; 20]) -> Handshake {
        Handshake {
            reserved,
            info_hash,
            peer_id,
        }
    }

    /// Serialise handshake data
    pub fn serialise(&self) -> Vec<u8> {
        let mut output = BytesMut::with_capacity(HANDSHAKE_BYTES_LEN);
        output.put_u8(PROTOCOL_ID_LEN);
        output.put_slice(PSTR.as_bytes());
        output.put_slice(&self.reserved);
        output.put_slice(&self.info_hash);
        output.put_slice(&self.peer_id);
        output.to_vec()
    }

    /// Deserialise handshake received from peer
    pub fn deserialise(data: &[u8; HANDSHAKE_BYTES_LEN]) -> Result<Handshake> {
        let pstr_end = 1 + PSTR.len();
        if data[0] != PROTOCOL_ID_LEN || &data[1..pstr_end] != PSTR.as_bytes() {
            return Err(Error::InvalidHandshake(format!(
                "unexpected protocol identifier {:?}",
                String::from_utf8_lossy(&data[1..pstr_end])
            )));
        }
        let reserved_end = pstr_end + RESERVED_LEN;
        let info_hash_end = reserved_end + SHA1_LEN;
        let mut handshake = Handshake::new([0; RESERVED_LEN], [0; SHA1_LEN], [0; 20]);
        handshake.reserved.copy_from_slice(&data[pstr_end..reserved_end]);
        handshake
            .info_hash
            .copy_from_slice(&data[reserved_end..info_hash_end]);
        handshake.peer_id.copy_from_slice(&data[info_hash_end..]);
        Ok(handshake)
    }
}
