use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, instrument};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::handshake::Handshake;
use crate::message::{Bitfield, Message};
use crate::{to_hex, HANDSHAKE_BYTES_LEN, SHA1_LEN};

/// Position of the connection in the download protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    AwaitHandshake,
    AwaitBitfield,
    SendInterested,
    AwaitUnchoke,
    Requesting,
    PieceComplete,
}

/// Send our handshake and validate the one the peer echoes back
///
/// Returns the peer's handshake.
pub async fn handshake<T>(
    socket: &mut T,
    info_hash: [u8; SHA1_LEN],
    config: &Config,
) -> Result<Handshake>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let initial_handshake = Handshake::new(config.reserved, info_hash, config.peer_id);
    socket.write_all(&initial_handshake.serialise()).await?;

    let mut response_handshake = [0; HANDSHAKE_BYTES_LEN];
    socket.read_exact(&mut response_handshake).await?;
    let deserialised_response = Handshake::deserialise(&response_handshake)?;

    if deserialised_response.info_hash != initial_handshake.info_hash {
        return Err(Error::HandshakeMismatch {
            expected: to_hex(&initial_handshake.info_hash),
            received: to_hex(&deserialised_response.info_hash),
        });
    }
    Ok(deserialised_response)
}

/// Connected peer
///
/// Owns the stream exclusively; every operation runs to completion before the next starts.
pub struct Client<T: AsyncRead + AsyncWrite + Unpin> {
    socket: T,
    state: State,
    /// Identifier the peer sent in its handshake
    pub peer_id: [u8; 20],
    /// Pieces the peer advertised
    pub bitfield: Bitfield,
}

impl<T: AsyncRead + AsyncWrite + Unpin> Client<T> {
    /// Send handshake and receive bitfield message from peer
    #[instrument(skip_all)]
    pub async fn new(socket: T, info_hash: [u8; SHA1_LEN], config: &Config) -> Result<Client<T>> {
        let mut client = Client {
            socket,
            state: State::AwaitHandshake,
            peer_id: [0; 20],
            bitfield: Bitfield::new(vec![]),
        };
        let response = handshake(&mut client.socket, info_hash, config).await?;
        info!("Completed handshake with peer {}", to_hex(&response.peer_id));
        client.peer_id = response.peer_id;
        client.set_state(State::AwaitBitfield);
        client.bitfield = client.receive_bitfield().await?;
        Ok(client)
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: State) {
        debug!("State {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    /// Send a message to the peer
    pub async fn send(&mut self, message: Message) -> Result<()> {
        debug!("Sending message: {}", message);
        self.socket.write_all(&message.serialise()).await?;
        Ok(())
    }

    /// Receive the next message from the peer
    pub async fn receive(&mut self) -> Result<Message> {
        let message = Message::deserialise(&mut self.socket).await?;
        debug!("Received message: {}", message);
        Ok(message)
    }

    /// Receive the next message that carries an ID, skipping keep-alives
    async fn receive_non_keep_alive(&mut self) -> Result<Message> {
        loop {
            match self.receive().await? {
                Message::KeepAlive => continue,
                message => return Ok(message),
            }
        }
    }

    fn unexpected(&self, message: &Message) -> Error {
        Error::UnexpectedMessage {
            state: self.state,
            message: message.to_string(),
        }
    }

    /// Receive initial bitfield message from peer
    async fn receive_bitfield(&mut self) -> Result<Bitfield> {
        match self.receive_non_keep_alive().await? {
            Message::Bitfield(bitfield) => {
                self.set_state(State::SendInterested);
                Ok(bitfield)
            }
            message => Err(self.unexpected(&message)),
        }
    }

    /// Declare interest and wait to be unchoked
    ///
    /// Does nothing once the peer has unchoked us.
    pub async fn prepare(&mut self) -> Result<()> {
        match self.state {
            State::Requesting | State::PieceComplete => return Ok(()),
            State::SendInterested => {}
            state => {
                return Err(Error::UnexpectedMessage {
                    state,
                    message: "cannot declare interest before bitfield".to_string(),
                })
            }
        }
        self.send(Message::Interested).await?;
        self.set_state(State::AwaitUnchoke);
        match self.receive_non_keep_alive().await? {
            Message::Unchoke => {
                info!("Unchoked by peer");
                self.set_state(State::Requesting);
                Ok(())
            }
            message => Err(self.unexpected(&message)),
        }
    }
}
