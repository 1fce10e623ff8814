use super::error::ExchangeError;
use crate::constants::METADATA_PIECE_SIZE;
use bytes::{Bytes, BytesMut};

/// Assembly buffer for one peer's metadata, filled strictly in piece order.
///
/// Created once the peer's extension handshake reveals `metadata_size`;
/// consumed into the final byte buffer when the last piece lands.
#[derive(Debug)]
pub struct PieceBuffer {
    total_size: usize,
    piece_count: usize,
    next_piece: usize,
    buf: BytesMut,
}

impl PieceBuffer {
    /// `total_size` must already be validated positive and within bounds.
    pub fn new(total_size: usize) -> Self {
        Self {
            total_size,
            piece_count: total_size.div_ceil(METADATA_PIECE_SIZE),
            next_piece: 0,
            buf: BytesMut::with_capacity(total_size),
        }
    }

    pub fn piece_count(&self) -> usize {
        self.piece_count
    }

    /// The next piece to request.
    pub fn next_piece(&self) -> usize {
        self.next_piece
    }

    pub fn is_complete(&self) -> bool {
        self.next_piece == self.piece_count
    }

    /// Expected byte length of piece `index`: full pieces except a short
    /// tail.
    pub fn piece_len(&self, index: usize) -> usize {
        let offset = index * METADATA_PIECE_SIZE;
        self.total_size.saturating_sub(offset).min(METADATA_PIECE_SIZE)
    }

    /// Appends the next sequential piece. Out-of-order writes cannot
    /// happen by construction; a piece of the wrong length is the peer
    /// misbehaving.
    pub fn write_piece(&mut self, data: &[u8]) -> Result<(), ExchangeError> {
        if self.is_complete() {
            return Err(ExchangeError::Protocol("piece after completion"));
        }
        if data.len() != self.piece_len(self.next_piece) {
            return Err(ExchangeError::Protocol("piece length mismatch"));
        }
        self.buf.extend_from_slice(data);
        self.next_piece += 1;
        Ok(())
    }

    /// The assembled metadata.
    ///
    /// # Panics
    ///
    /// Panics if the download is not complete; callers gate on
    /// [`is_complete`](Self::is_complete).
    pub fn into_bytes(self) -> Bytes {
        assert!(self.is_complete(), "metadata not fully downloaded");
        self.buf.freeze()
    }
}
