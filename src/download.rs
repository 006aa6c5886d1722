use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::Sender;
use tracing::{debug, info, instrument, warn};

use crate::client::{Client, State};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::metainfo::Metainfo;
use crate::piece::{blocks, Block, Piece, PieceBuffer};
use crate::SHA1_LEN;

/// Wait for the `piece` message answering `block`
///
/// The returned data is exactly `block.length` bytes.
async fn receive_block<T>(client: &mut Client<T>, block: &Block) -> Result<Vec<u8>>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match client.receive().await? {
            Message::KeepAlive | Message::Have(_) => continue,
            Message::Piece {
                index,
                begin,
                block: data,
            } => {
                if index != block.index || begin != block.begin {
                    return Err(Error::ProtocolDesync {
                        expected: *block,
                        index,
                        begin,
                    });
                }
                if data.len() != block.length as usize {
                    return Err(Error::IncompletePiece {
                        index,
                        expected: block.length as usize,
                        received: data.len(),
                    });
                }
                return Ok(data);
            }
            message => {
                return Err(Error::UnexpectedMessage {
                    state: client.state(),
                    message: message.to_string(),
                })
            }
        }
    }
}

/// Download one piece, one block at a time
///
/// Each block is requested only after the previous one has arrived.
#[instrument(skip(client, metainfo))]
pub async fn fetch_piece<T>(client: &mut Client<T>, metainfo: &Metainfo, index: u32) -> Result<Vec<u8>>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let piece_length = metainfo.piece_size(index)?;
    client.prepare().await?;
    client.set_state(State::Requesting);

    let mut piece = PieceBuffer::new(index, piece_length);
    for block in blocks(index, piece_length) {
        client
            .send(Message::Request {
                index: block.index,
                begin: block.begin,
                length: block.length,
            })
            .await?;
        let data = receive_block(client, &block).await?;
        piece.insert(block.begin, &data)?;
    }
    let buf = piece.finish()?;
    client.set_state(State::PieceComplete);
    debug!("Fetched piece {} ({} bytes)", index, buf.len());
    Ok(buf)
}

/// Check SHA1 hash of downloaded piece is as expected
pub fn verify_piece(piece: &[u8], expected_hash: &[u8; SHA1_LEN]) -> bool {
    sha1_smol::Sha1::from(piece).digest().bytes() == *expected_hash
}

/// Download one piece and check it against the metainfo's hash
pub async fn download_piece<T>(client: &mut Client<T>, metainfo: &Metainfo, index: u32) -> Result<Vec<u8>>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let buf = fetch_piece(client, metainfo, index).await?;
    if !verify_piece(&buf, metainfo.piece_hash(index)?) {
        warn!("Piece {} failed hash verification", index);
        return Err(Error::HashMismatch { index });
    }
    info!("Downloaded piece with index {}", index);
    Ok(buf)
}

/// Download every piece in ascending order, handing each verified piece to `tx`
///
/// The first failure, including a hash mismatch, aborts the whole download.
#[instrument(skip_all, fields(pieces = metainfo.piece_count()))]
pub async fn fetch_file<T>(client: &mut Client<T>, metainfo: &Metainfo, tx: Sender<Piece>) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    for index in 0..metainfo.piece_count() as u32 {
        let buf = download_piece(client, metainfo, index).await?;
        tx.send(Piece { index, buf })
            .await
            .map_err(|_| Error::Sink(format!("receiver dropped before piece {}", index)))?;
    }
    info!("Downloaded all {} pieces", metainfo.piece_count());
    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio_test::io::Builder;

    use super::*;
    use crate::config::Config;
    use crate::handshake::Handshake;
    use crate::message::Bitfield;
    use crate::metainfo::Info;
    use crate::piece::BLOCK_SIZE;

    const OUR_PEER_ID: &[u8; 20] = b"12345678901234567890";
    const THEIR_PEER_ID: &[u8; 20] = b"-DEF123-efgh12345678";
    const INFO_HASH: [u8; 20] = [0x42; 20];

    fn test_config() -> Config {
        Config {
            peer_id: *OUR_PEER_ID,
            ..Config::default()
        }
    }

    fn file_data(len: usize) -> Vec<u8> {
        (0..len).map(|idx| (idx % 251) as u8).collect()
    }

    fn metainfo_for(data: &[u8], piece_length: u32) -> Metainfo {
        let pieces = data
            .chunks(piece_length as usize)
            .map(|piece| sha1_smol::Sha1::from(piece).digest().bytes())
            .collect();
        Metainfo {
            announce: "http://tracker.example/announce".to_string(),
            info: Info {
                name: Some("file".to_string()),
                length: data.len() as u64,
                piece_length,
                pieces,
            },
            info_hash: INFO_HASH,
        }
    }

    /// Scripted peer up to (and including) the unchoke
    fn preamble() -> Builder {
        let mut builder = Builder::new();
        builder
            .write(&Handshake::new([0; 8], INFO_HASH, *OUR_PEER_ID).serialise())
            .read(&Handshake::new([0; 8], INFO_HASH, *THEIR_PEER_ID).serialise())
            .read(&Message::Bitfield(Bitfield::new(vec![0xff])).serialise())
            .write(&Message::Interested.serialise())
            .read(&Message::Unchoke.serialise());
        builder
    }

    /// Script a request/response pair for every block of a piece
    fn serve_piece(builder: &mut Builder, index: u32, piece: &[u8]) {
        for block in blocks(index, piece.len() as u32) {
            let start = block.begin as usize;
            let end = start + block.length as usize;
            builder
                .write(
                    &Message::Request {
                        index,
                        begin: block.begin,
                        length: block.length,
                    }
                    .serialise(),
                )
                .read(
                    &Message::Piece {
                        index,
                        begin: block.begin,
                        block: piece[start..end].to_vec(),
                    }
                    .serialise(),
                );
        }
    }

    #[tokio::test]
    async fn fetch_piece_assembles_four_blocks_in_offset_order() {
        let piece_length = 4 * BLOCK_SIZE;
        let data = file_data(piece_length as usize * 2);
        let metainfo = metainfo_for(&data, piece_length);

        let mut builder = preamble();
        serve_piece(&mut builder, 0, &data[..piece_length as usize]);
        let mut client = Client::new(builder.build(), INFO_HASH, &test_config())
            .await
            .unwrap();

        let piece = fetch_piece(&mut client, &metainfo, 0).await.unwrap();
        assert_eq!(piece.len(), piece_length as usize);
        assert_eq!(piece, &data[..piece_length as usize]);
        assert_eq!(client.state(), State::PieceComplete);
    }

    #[tokio::test]
    async fn fetch_last_piece_requests_only_the_remainder() {
        let piece_length = 2 * BLOCK_SIZE;
        let data = file_data(piece_length as usize + 100);
        let metainfo = metainfo_for(&data, piece_length);

        let mut builder = preamble();
        serve_piece(&mut builder, 1, &data[piece_length as usize..]);
        let mut client = Client::new(builder.build(), INFO_HASH, &test_config())
            .await
            .unwrap();

        let piece = download_piece(&mut client, &metainfo, 1).await.unwrap();
        assert_eq!(piece, &data[piece_length as usize..]);
    }

    #[tokio::test]
    async fn keep_alive_and_have_between_blocks_are_ignored() {
        let data = file_data(10);
        let metainfo = metainfo_for(&data, 10);

        let mut builder = preamble();
        builder
            .write(
                &Message::Request {
                    index: 0,
                    begin: 0,
                    length: 10,
                }
                .serialise(),
            )
            .read(&Message::KeepAlive.serialise())
            .read(&Message::Have(3).serialise())
            .read(
                &Message::Piece {
                    index: 0,
                    begin: 0,
                    block: data.clone(),
                }
                .serialise(),
            );
        let mut client = Client::new(builder.build(), INFO_HASH, &test_config())
            .await
            .unwrap();

        assert_eq!(fetch_piece(&mut client, &metainfo, 0).await.unwrap(), data);
    }

    #[tokio::test]
    async fn return_error_if_piece_does_not_match_request() {
        let data = file_data(10);
        let metainfo = metainfo_for(&data, 10);

        let mut builder = preamble();
        builder
            .write(
                &Message::Request {
                    index: 0,
                    begin: 0,
                    length: 10,
                }
                .serialise(),
            )
            .read(
                &Message::Piece {
                    index: 0,
                    begin: 4,
                    block: data[4..].to_vec(),
                }
                .serialise(),
            );
        let mut client = Client::new(builder.build(), INFO_HASH, &test_config())
            .await
            .unwrap();

        let res = fetch_piece(&mut client, &metainfo, 0).await;
        assert!(matches!(
            res,
            Err(Error::ProtocolDesync {
                expected: Block {
                    index: 0,
                    begin: 0,
                    length: 10,
                },
                index: 0,
                begin: 4,
            })
        ));
    }

    #[tokio::test]
    async fn return_error_if_peer_chokes_mid_piece() {
        let data = file_data(10);
        let metainfo = metainfo_for(&data, 10);

        let mut builder = preamble();
        builder
            .write(
                &Message::Request {
                    index: 0,
                    begin: 0,
                    length: 10,
                }
                .serialise(),
            )
            .read(&Message::Choke.serialise());
        let mut client = Client::new(builder.build(), INFO_HASH, &test_config())
            .await
            .unwrap();

        let res = fetch_piece(&mut client, &metainfo, 0).await;
        assert!(matches!(
            res,
            Err(Error::UnexpectedMessage {
                state: State::Requesting,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn return_error_for_short_block() {
        let data = file_data(10);
        let metainfo = metainfo_for(&data, 10);

        let mut builder = preamble();
        builder
            .write(
                &Message::Request {
                    index: 0,
                    begin: 0,
                    length: 10,
                }
                .serialise(),
            )
            .read(
                &Message::Piece {
                    index: 0,
                    begin: 0,
                    block: data[..6].to_vec(),
                }
                .serialise(),
            );
        let mut client = Client::new(builder.build(), INFO_HASH, &test_config())
            .await
            .unwrap();

        let res = fetch_piece(&mut client, &metainfo, 0).await;
        assert!(matches!(
            res,
            Err(Error::IncompletePiece {
                index: 0,
                expected: 10,
                received: 6,
            })
        ));
    }

    #[tokio::test]
    async fn return_error_for_block_longer_than_requested() {
        let data = file_data(2 * BLOCK_SIZE as usize);
        let metainfo = metainfo_for(&data, 2 * BLOCK_SIZE);

        // 5 bytes more than requested
        let mut builder = preamble();
        builder
            .write(
                &Message::Request {
                    index: 0,
                    begin: 0,
                    length: BLOCK_SIZE,
                }
                .serialise(),
            )
            .read(
                &Message::Piece {
                    index: 0,
                    begin: 0,
                    block: vec![1; BLOCK_SIZE as usize + 5],
                }
                .serialise(),
            );
        let mut client = Client::new(builder.build(), INFO_HASH, &test_config())
            .await
            .unwrap();

        let res = fetch_piece(&mut client, &metainfo, 0).await;
        assert!(matches!(
            res,
            Err(Error::IncompletePiece {
                index: 0,
                expected: 16384,
                received: 16389,
            })
        ));
    }

    #[tokio::test]
    async fn return_error_for_short_first_block_of_piece() {
        let data = file_data(2 * BLOCK_SIZE as usize);
        let metainfo = metainfo_for(&data, 2 * BLOCK_SIZE);

        let mut builder = preamble();
        builder
            .write(
                &Message::Request {
                    index: 0,
                    begin: 0,
                    length: BLOCK_SIZE,
                }
                .serialise(),
            )
            .read(
                &Message::Piece {
                    index: 0,
                    begin: 0,
                    block: vec![1; BLOCK_SIZE as usize - 5],
                }
                .serialise(),
            );
        let mut client = Client::new(builder.build(), INFO_HASH, &test_config())
            .await
            .unwrap();

        let res = fetch_piece(&mut client, &metainfo, 0).await;
        assert!(matches!(
            res,
            Err(Error::IncompletePiece {
                index: 0,
                expected: 16384,
                received: 16379,
            })
        ));
    }

    #[tokio::test]
    async fn return_hash_mismatch_for_corrupted_piece() {
        let data = file_data(10);
        let metainfo = metainfo_for(&data, 10);
        let mut corrupted = data.clone();
        corrupted[0] ^= 0xff;

        let mut builder = preamble();
        serve_piece(&mut builder, 0, &corrupted);
        let mut client = Client::new(builder.build(), INFO_HASH, &test_config())
            .await
            .unwrap();

        let res = download_piece(&mut client, &metainfo, 0).await;
        assert!(matches!(res, Err(Error::HashMismatch { index: 0 })));
    }

    #[tokio::test]
    async fn return_error_for_piece_index_out_of_range() {
        let data = file_data(10);
        let metainfo = metainfo_for(&data, 10);
        let mut client = Client::new(
            Builder::new()
                .write(&Handshake::new([0; 8], INFO_HASH, *OUR_PEER_ID).serialise())
                .read(&Handshake::new([0; 8], INFO_HASH, *THEIR_PEER_ID).serialise())
                .read(&Message::Bitfield(Bitfield::new(vec![0xff])).serialise())
                .build(),
            INFO_HASH,
            &test_config(),
        )
        .await
        .unwrap();

        let res = fetch_piece(&mut client, &metainfo, 1).await;
        assert!(matches!(
            res,
            Err(Error::InvalidPieceIndex { index: 1, count: 1 })
        ));
    }

    #[test]
    fn verify_piece_compares_sha1() {
        let data = b"hello";
        let hash = sha1_smol::Sha1::from(data).digest().bytes();
        assert!(verify_piece(data, &hash));
        assert!(!verify_piece(b"hellO", &hash));
    }

    #[tokio::test]
    async fn fetch_file_delivers_all_pieces_in_order() {
        let piece_length = BLOCK_SIZE + 1;
        let data = file_data(piece_length as usize * 2 + 7);
        let metainfo = metainfo_for(&data, piece_length);

        let mut builder = preamble();
        for (index, piece) in data.chunks(piece_length as usize).enumerate() {
            serve_piece(&mut builder, index as u32, piece);
        }
        let mut client = Client::new(builder.build(), INFO_HASH, &test_config())
            .await
            .unwrap();

        let (tx, rx) = tokio::sync::mpsc::channel(metainfo.piece_count());
        let mut out = Vec::new();
        let (fetched, written) = tokio::join!(
            fetch_file(&mut client, &metainfo, tx),
            crate::piece::receiver(&mut out, rx)
        );
        fetched.unwrap();
        assert_eq!(written.unwrap(), data.len() as u64);
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn fetch_file_aborts_on_first_hash_mismatch() {
        let data = file_data(30);
        let metainfo = metainfo_for(&data, 10);
        let mut corrupted = data[10..20].to_vec();
        corrupted[9] ^= 0x01;

        let mut builder = preamble();
        serve_piece(&mut builder, 0, &data[..10]);
        serve_piece(&mut builder, 1, &corrupted);
        let mut client = Client::new(builder.build(), INFO_HASH, &test_config())
            .await
            .unwrap();

        let (tx, rx) = tokio::sync::mpsc::channel(metainfo.piece_count());
        let mut out = Vec::new();
        let (fetched, written) = tokio::join!(
            fetch_file(&mut client, &metainfo, tx),
            crate::piece::receiver(&mut out, rx)
        );
        assert!(matches!(fetched, Err(Error::HashMismatch { index: 1 })));
        assert_eq!(written.unwrap(), 10);
        assert_eq!(out, &data[..10]);
    }
}
