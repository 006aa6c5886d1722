use std::fmt;

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

const BITS_IN_BYTE: usize = 8;

/// Largest frame accepted from a peer (a 16 KiB block needs just over 16 KiB)
pub const MAX_MESSAGE_LEN: u32 = 1 << 20;

const CHOKE_ID: u8 = 0;
const UNCHOKE_ID: u8 = 1;
const INTERESTED_ID: u8 = 2;
const NOT_INTERESTED_ID: u8 = 3;
const HAVE_ID: u8 = 4;
const BITFIELD_ID: u8 = 5;
const REQUEST_ID: u8 = 6;
const PIECE_ID: u8 = 7;
const CANCEL_ID: u8 = 8;
const PORT_ID: u8 = 9;

/// Wrapper type for bitfield message payload
#[derive(Debug, Clone, PartialEq)]
pub struct Bitfield {
    data: Vec<u8>,
}

impl Bitfield {
    /// Create instance from bitfield message payload
    pub fn new(data: Vec<u8>) -> Bitfield {
        Bitfield { data }
    }

    /// Check if the bitfield contains the piece with the given index
    pub fn has_piece(&self, idx: usize) -> bool {
        let byte_index = idx / BITS_IN_BYTE;
        let offset = idx % BITS_IN_BYTE;
        match self.data.get(byte_index) {
            Some(byte) => (byte >> (BITS_IN_BYTE - 1 - offset)) & 0b00000001 == 0b00000001,
            None => false,
        }
    }

    /// Set the bit in the bitfield that corresponds to the given piece index
    pub fn set_piece(&mut self, idx: usize) {
        let byte_index = idx / BITS_IN_BYTE;
        let offset = idx % BITS_IN_BYTE;
        if let Some(byte) = self.data.get_mut(byte_index) {
            *byte |= 0b00000001 << (BITS_IN_BYTE - 1 - offset);
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

/// Peer message types
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    /// Index of piece the sender has completed and checked the hash of
    Have(u32),
    /// Describes which pieces (by index) the sender has
    Bitfield(Bitfield),
    /// Request a subset of a piece (a block)
    Request { index: u32, begin: u32, length: u32 },
    /// Send a subset of a piece (a block)
    Piece {
        index: u32,
        begin: u32,
        block: Vec<u8>,
    },
    /// Cancel a request for a block
    Cancel { index: u32, begin: u32, length: u32 },
    /// DHT listening port of the sender
    Port(u16),
}

fn check_payload_len(id: u8, payload: &[u8], expected: usize) -> Result<()> {
    if payload.len() != expected {
        return Err(Error::InvalidMessage(format!(
            "message with ID {} has payload of {} bytes, expected {}",
            id,
            payload.len(),
            expected
        )));
    }
    Ok(())
}

impl Message {
    /// Message ID, `None` for keep-alive
    pub fn id(&self) -> Option<u8> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(CHOKE_ID),
            Message::Unchoke => Some(UNCHOKE_ID),
            Message::Interested => Some(INTERESTED_ID),
            Message::NotInterested => Some(NOT_INTERESTED_ID),
            Message::Have(_) => Some(HAVE_ID),
            Message::Bitfield(_) => Some(BITFIELD_ID),
            Message::Request { .. } => Some(REQUEST_ID),
            Message::Piece { .. } => Some(PIECE_ID),
            Message::Cancel { .. } => Some(CANCEL_ID),
            Message::Port(_) => Some(PORT_ID),
        }
    }

    /// Read one length-prefixed message from the socket
    ///
    /// The whole frame is consumed before the payload is interpreted. A frame
    /// longer than [`MAX_MESSAGE_LEN`] is rejected after only its length
    /// prefix has been read, which leaves the stream misaligned.
    pub async fn deserialise<T>(socket: &mut T) -> Result<Message>
    where
        T: AsyncRead + Unpin,
    {
        let len = socket.read_u32().await?;
        if len == 0 {
            return Ok(Message::KeepAlive);
        }
        if len > MAX_MESSAGE_LEN {
            return Err(Error::InvalidMessage(format!(
                "message length {} exceeds maximum of {}",
                len, MAX_MESSAGE_LEN
            )));
        }

        let id = socket.read_u8().await?;
        let mut payload = vec![0; len as usize - 1];
        socket.read_exact(&mut payload[..]).await?;
        Message::from_parts(id, payload)
    }

    /// Build a message from its ID and payload
    pub fn from_parts(id: u8, payload: Vec<u8>) -> Result<Message> {
        let mut bytes = &payload[..];
        match id {
            CHOKE_ID | UNCHOKE_ID | INTERESTED_ID | NOT_INTERESTED_ID => {
                check_payload_len(id, &payload, 0)?;
                Ok(match id {
                    CHOKE_ID => Message::Choke,
                    UNCHOKE_ID => Message::Unchoke,
                    INTERESTED_ID => Message::Interested,
                    _ => Message::NotInterested,
                })
            }
            HAVE_ID => {
                check_payload_len(id, &payload, 4)?;
                Ok(Message::Have(bytes.get_u32()))
            }
            BITFIELD_ID => Ok(Message::Bitfield(Bitfield::new(payload))),
            REQUEST_ID | CANCEL_ID => {
                check_payload_len(id, &payload, 12)?;
                let index = bytes.get_u32();
                let begin = bytes.get_u32();
                let length = bytes.get_u32();
                if id == REQUEST_ID {
                    Ok(Message::Request {
                        index,
                        begin,
                        length,
                    })
                } else {
                    Ok(Message::Cancel {
                        index,
                        begin,
                        length,
                    })
                }
            }
            PIECE_ID => {
                if payload.len() < 8 {
                    return Err(Error::InvalidMessage(format!(
                        "piece message payload of {} bytes is too short",
                        payload.len()
                    )));
                }
                let index = bytes.get_u32();
                let begin = bytes.get_u32();
                Ok(Message::Piece {
                    index,
                    begin,
                    block: bytes.to_vec(),
                })
            }
            PORT_ID => {
                check_payload_len(id, &payload, 2)?;
                Ok(Message::Port(bytes.get_u16()))
            }
            _ => Err(Error::InvalidMessage(format!("unknown message ID: {}", id))),
        }
    }

    /// Serialise [`Message`] to raw bytes
    pub fn serialise(&self) -> Vec<u8> {
        let mut payload = BytesMut::new();
        match self {
            Message::KeepAlive => return u32::to_be_bytes(0).to_vec(),
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => {}
            Message::Have(index) => payload.put_u32(*index),
            Message::Bitfield(bitfield) => payload.put_slice(bitfield.as_bytes()),
            Message::Request {
                index,
                begin,
                length,
            }
            | Message::Cancel {
                index,
                begin,
                length,
            } => {
                payload.put_u32(*index);
                payload.put_u32(*begin);
                payload.put_u32(*length);
            }
            Message::Piece {
                index,
                begin,
                block,
            } => {
                payload.put_u32(*index);
                payload.put_u32(*begin);
                payload.put_slice(block);
            }
            Message::Port(port) => payload.put_u16(*port),
        }

        let mut buf = BytesMut::with_capacity(5 + payload.len());
        buf.put_u32(1 + payload.len() as u32);
        if let Some(id) = self.id() {
            buf.put_u8(id);
        }
        buf.put_slice(&payload);
        buf.to_vec()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::KeepAlive => write!(f, "keep-alive"),
            Message::Choke => write!(f, "choke"),
            Message::Unchoke => write!(f, "unchoke"),
            Message::Interested => write!(f, "interested"),
            Message::NotInterested => write!(f, "not interested"),
            Message::Have(index) => write!(f, "have(index={})", index),
            Message::Bitfield(bitfield) => {
                write!(f, "bitfield({} bytes)", bitfield.as_bytes().len())
            }
            Message::Request {
                index,
                begin,
                length,
            } => write!(f, "request(index={}, begin={}, length={})", index, begin, length),
            Message::Piece {
                index,
                begin,
                block,
            } => write!(
                f,
                "piece(index={}, begin={}, length={})",
                index,
                begin,
                block.len()
            ),
            Message::Cancel {
                index,
                begin,
                length,
            } => write!(f, "cancel(index={}, begin={}, length={})", index, begin, length),
            Message::Port(port) => write!(f, "port({})", port),
        }
    }
}
