use sha2::{Digest, Sha256};

use crate::{
    error::BlockError,
    piece_map::PieceMap,
    types::{BlockRequest, PieceIndex},
};

/// One piece under assembly.
pub trait Piece {
    fn index_of(&self) -> PieceIndex;

    /// All blocks have been written.
    fn is_complete(&self) -> bool;

    /// Complete, and the contents match the expected digest.
    fn is_valid(&self) -> bool;

    /// Every block has been requested or received.
    fn is_fully_requested(&self) -> bool;

    fn write_block(&mut self, offset: u32, data: &[u8]) -> Result<(), BlockError>;

    /// Next block not yet requested, marking it requested.
    fn next_request(&mut self) -> Option<BlockRequest>;

    /// Forget outstanding requests for blocks not yet received.
    fn release_requests(&mut self);

    /// Return the piece to an unfinished state with every block requestable.
    fn reset(&mut self);
}

/// Storage for the pieces of the content being downloaded.
pub trait PieceStore {
    type Piece: Piece;

    fn get(&mut self, piece_index: PieceIndex) -> Option<&mut Self::Piece>;

    fn piece_count(&self) -> u32;

    fn all_complete(&self) -> bool;
}

pub fn piece_digest(data: &[u8]) -> [u8; 32] {
    let mut digest = Sha256::new();
    digest.update(data);
    digest.finalize().into()
}

/// A piece held in memory, validated against a SHA-256 digest.
#[derive(Debug, Clone)]
pub struct MemoryPiece {
    index: PieceIndex,
    digest: [u8; 32],
    block_size: u32,
    n_blocks: u32,
    data: Vec<u8>,
    received: PieceMap,
    requested: PieceMap,
}

impl MemoryPiece {
    pub fn new(index: PieceIndex, digest: [u8; 32], length: u32, block_size: u32) -> MemoryPiece {
        let n_blocks = length.div_ceil(block_size);
        MemoryPiece {
            index,
            digest,
            block_size,
            n_blocks,
            data: vec![0u8; length as usize],
            received: PieceMap::with_capacity(n_blocks as usize),
            requested: PieceMap::with_capacity(n_blocks as usize),
        }
    }

    pub fn len(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn digest(&self) -> &[u8; 32] {
        &self.digest
    }

    pub fn block_count(&self) -> u32 {
        self.n_blocks
    }

    pub fn block_len(&self, block_index: u32) -> u32 {
        let start = block_index * self.block_size;
        self.block_size.min(self.len().saturating_sub(start))
    }

    /// Contents of a received block.
    pub fn block(&self, offset: u32, length: u32) -> Option<&[u8]> {
        if offset % self.block_size != 0 || !self.received.get(offset / self.block_size) {
            return None;
        }
        let end = offset.checked_add(length)?;
        self.data.get(offset as usize..end as usize)
    }

    /// Whole piece contents, once complete and valid.
    pub fn contents(&self) -> Option<&[u8]> {
        if self.is_valid() {
            Some(&self.data)
        } else {
            None
        }
    }
}

impl Piece for MemoryPiece {
    fn index_of(&self) -> PieceIndex {
        self.index
    }

    fn is_complete(&self) -> bool {
        self.received.count() == self.n_blocks as usize
    }

    fn is_valid(&self) -> bool {
        self.is_complete() && piece_digest(&self.data) == self.digest
    }

    fn is_fully_requested(&self) -> bool {
        self.requested.count() == self.n_blocks as usize
    }

    fn write_block(&mut self, offset: u32, data: &[u8]) -> Result<(), BlockError> {
        if offset % self.block_size != 0 {
            return Err(BlockError::Misaligned {
                offset,
                block_size: self.block_size,
            });
        }
        if offset >= self.len() {
            return Err(BlockError::OutOfRange {
                offset,
                piece_len: self.len(),
            });
        }
        let block_index = offset / self.block_size;
        let expected = self.block_len(block_index);
        if data.len() != expected as usize {
            return Err(BlockError::WrongLength {
                offset,
                expected,
                actual: data.len(),
            });
        }
        let start = offset as usize;
        self.data[start..start + data.len()].copy_from_slice(data);
        self.received.set(block_index);
        self.requested.set(block_index);
        Ok(())
    }

    fn next_request(&mut self) -> Option<BlockRequest> {
        let block_index = (0..self.n_blocks).find(|b| !self.requested.get(*b))?;
        self.requested.set(block_index);
        Some(BlockRequest {
            piece: self.index,
            offset: block_index * self.block_size,
            length: self.block_len(block_index),
        })
    }

    fn release_requests(&mut self) {
        self.requested = self.received.clone();
    }

    fn reset(&mut self) {
        self.received = PieceMap::with_capacity(self.n_blocks as usize);
        self.requested = PieceMap::with_capacity(self.n_blocks as usize);
    }
}

/// In-memory [`PieceStore`].
#[derive(Debug, Clone)]
pub struct MemoryPieceStore {
    pieces: Vec<MemoryPiece>,
}

impl MemoryPieceStore {
    pub fn new(pieces: Vec<MemoryPiece>) -> MemoryPieceStore {
        MemoryPieceStore { pieces }
    }

    /// An empty store that will accept `payload`, split into pieces of
    /// `piece_len` bytes (the last may be shorter).
    pub fn for_payload(payload: &[u8], piece_len: u32, block_size: u32) -> MemoryPieceStore {
        let pieces = payload
            .chunks(piece_len as usize)
            .enumerate()
            .map(|(i, chunk)| {
                MemoryPiece::new(i as PieceIndex, piece_digest(chunk), chunk.len() as u32, block_size)
            })
            .collect();
        MemoryPieceStore { pieces }
    }

    /// A store already holding all of `payload`.
    pub fn seeded(payload: &[u8], piece_len: u32, block_size: u32) -> MemoryPieceStore {
        let mut store = Self::for_payload(payload, piece_len, block_size);
        for (piece, chunk) in store.pieces.iter_mut().zip(payload.chunks(piece_len as usize)) {
            piece.data.copy_from_slice(chunk);
            for block_index in 0..piece.n_blocks {
                piece.received.set(block_index);
                piece.requested.set(block_index);
            }
        }
        store
    }

    pub fn piece(&self, piece_index: PieceIndex) -> Option<&MemoryPiece> {
        self.pieces.get(piece_index as usize)
    }

    pub fn complete_count(&self) -> usize {
        self.pieces.iter().filter(|p| p.is_valid()).count()
    }
}

impl PieceStore for MemoryPieceStore {
    type Piece = MemoryPiece;

    fn get(&mut self, piece_index: PieceIndex) -> Option<&mut MemoryPiece> {
        self.pieces.get_mut(piece_index as usize)
    }

    fn piece_count(&self) -> u32 {
        self.pieces.len() as u32
    }

    fn all_complete(&self) -> bool {
        self.pieces.iter().all(|p| p.is_valid())
    }
}
