use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::Receiver;
use tracing::debug;

use crate::error::{Error, Result};

/// Maximum size of a single block request
pub const BLOCK_SIZE: u32 = 16 * 1024;

/// One request unit within a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    /// Index of piece within file
    pub index: u32,
    /// Byte offset within the piece
    pub begin: u32,
    /// Number of bytes requested
    pub length: u32,
}

/// Split a piece into consecutive blocks of at most [`BLOCK_SIZE`] bytes
pub fn blocks(index: u32, piece_length: u32) -> impl Iterator<Item = Block> {
    (0..piece_length)
        .step_by(BLOCK_SIZE as usize)
        .map(move |begin| Block {
            index,
            begin,
            length: BLOCK_SIZE.min(piece_length - begin),
        })
}

/// In-progress piece assembled from received blocks
#[derive(Debug)]
pub struct PieceBuffer {
    index: u32,
    buf: Vec<u8>,
    /// Byte ranges written so far, kept sorted by start
    filled: Vec<(usize, usize)>,
}

impl PieceBuffer {
    pub fn new(index: u32, length: u32) -> PieceBuffer {
        PieceBuffer {
            index,
            buf: vec![0; length as usize],
            filled: Vec::new(),
        }
    }

    fn received(&self) -> usize {
        self.filled.iter().map(|(start, end)| end - start).sum()
    }

    /// Copy a received block into place
    ///
    /// Blocks must lie within the piece and must not overlap earlier blocks.
    pub fn insert(&mut self, begin: u32, block: &[u8]) -> Result<()> {
        let start = begin as usize;
        let end = start + block.len();
        if end > self.buf.len() {
            return Err(Error::IncompletePiece {
                index: self.index,
                expected: self.buf.len(),
                received: end,
            });
        }
        let pos = self.filled.partition_point(|&(existing, _)| existing < start);
        let overlaps_prev = pos > 0 && self.filled[pos - 1].1 > start;
        let overlaps_next = self
            .filled
            .get(pos)
            .is_some_and(|&(next_start, _)| next_start < end);
        if overlaps_prev || overlaps_next {
            return Err(Error::ProtocolDesync {
                expected: Block {
                    index: self.index,
                    begin,
                    length: block.len() as u32,
                },
                index: self.index,
                begin,
            });
        }
        self.buf[start..end].copy_from_slice(block);
        self.filled.insert(pos, (start, end));
        Ok(())
    }

    /// Return the assembled piece once every byte has been received
    pub fn finish(self) -> Result<Vec<u8>> {
        let received = self.received();
        if received != self.buf.len() {
            return Err(Error::IncompletePiece {
                index: self.index,
                expected: self.buf.len(),
                received,
            });
        }
        Ok(self.buf)
    }
}

/// Downloaded and verified piece
#[derive(Debug)]
pub struct Piece {
    /// Index of piece within file
    pub index: u32,
    /// Piece data
    pub buf: Vec<u8>,
}

/// Receive completed pieces and write them to `out` in index order
///
/// Returns the number of bytes written once the sending side is dropped.
pub async fn receiver<W>(out: &mut W, mut rx: Receiver<Piece>) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut next_index = 0;
    let mut written = 0;
    while let Some(piece) = rx.recv().await {
        if piece.index != next_index {
            return Err(Error::Sink(format!(
                "received piece {} while expecting piece {}",
                piece.index, next_index
            )));
        }
        out.write_all(&piece.buf).await?;
        debug!("Wrote piece {} ({} bytes)", piece.index, piece.buf.len());
        written += piece.buf.len() as u64;
        next_index += 1;
    }
    out.flush().await?;
    Ok(written)
}
