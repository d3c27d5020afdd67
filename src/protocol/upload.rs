//! Chunked transfers.
//!
//! A transfer is a stream of [`Chunk`]s sharing one transfer id, numbered from
//! 0 with `is_final` set on the last. Chunks are never buffered on the sending
//! side and the receiving side only accumulates the bytes of the transfer in
//! progress. There is no resumption: after a connection loss the sender
//! restarts from chunk 0 and the receiver drops what it had.

use super::message::Chunk;
use crate::error::{ProtocolError, Result};
use bytes::{Bytes, BytesMut};

/// Split `data` into chunk payloads of at most `chunk_size` bytes.
///
/// Slices share the original buffer. Empty input yields a single empty
/// payload so that every transfer has a final chunk.
pub fn split(data: &Bytes, chunk_size: usize) -> Vec<Bytes> {
    let chunk_size = chunk_size.max(1);
    if data.is_empty() {
        return vec![Bytes::new()];
    }
    (0..data.len())
        .step_by(chunk_size)
        .map(|start| data.slice(start..(start + chunk_size).min(data.len())))
        .collect()
}

/// Sender-side sequencing for one upload.
#[derive(Debug)]
pub struct UploadSession {
    upload_id: u32,
    next_index: u32,
    finished: bool,
}

impl UploadSession {
    pub fn new(upload_id: u32) -> Self {
        Self {
            upload_id,
            next_index: 0,
            finished: false,
        }
    }

    pub fn upload_id(&self) -> u32 {
        self.upload_id
    }

    /// Index the next chunk will carry.
    pub fn next_index(&self) -> u32 {
        self.next_index
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Wrap `data` as the next chunk. Refused once the final chunk was issued.
    pub fn next_chunk(&mut self, data: Bytes, is_final: bool) -> Result<Chunk> {
        if self.finished {
            return Err(ProtocolError::ChunkSequence {
                expected: self.next_index,
                got: self.next_index,
            });
        }
        let chunk = Chunk {
            transfer_id: self.upload_id,
            sequence_index: self.next_index,
            is_final,
            data,
        };
        self.next_index += 1;
        self.finished = is_final;
        Ok(chunk)
    }
}

/// Receiver-side reassembly for one transfer.
#[derive(Debug)]
pub struct ChunkAssembler {
    transfer_id: u32,
    expected: u32,
    buffer: BytesMut,
}

impl ChunkAssembler {
    pub fn new(transfer_id: u32) -> Self {
        Self {
            transfer_id,
            expected: 0,
            buffer: BytesMut::new(),
        }
    }

    pub fn transfer_id(&self) -> u32 {
        self.transfer_id
    }

    /// Bytes received so far.
    pub fn received(&self) -> usize {
        self.buffer.len()
    }

    /// Accept the next chunk. Returns the whole payload once the final chunk
    /// arrives. Any gap or repeat is a [`ProtocolError::ChunkSequence`].
    pub fn push(&mut self, chunk: Chunk) -> Result<Option<Bytes>> {
        if chunk.sequence_index != self.expected {
            return Err(ProtocolError::ChunkSequence {
                expected: self.expected,
                got: chunk.sequence_index,
            });
        }
        self.expected += 1;
        self.buffer.extend_from_slice(&chunk.data);
        if chunk.is_final {
            Ok(Some(std::mem::take(&mut self.buffer).freeze()))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn chunk(index: u32, is_final: bool, data: &'static [u8]) -> Chunk {
        Chunk {
            transfer_id: 1,
            sequence_index: index,
            is_final,
            data: Bytes::from_static(data),
        }
    }

    #[test]
    fn test_split_sizes() {
        let data = Bytes::from(vec![7u8; 10]);
        let parts = split(&data, 4);
        assert_eq!(parts.iter().map(Bytes::len).collect::<Vec<_>>(), vec![4, 4, 2]);
        assert_eq!(split(&Bytes::new(), 4).len(), 1);
    }

    #[test]
    fn test_session_numbers_from_zero_and_stops_after_final() {
        let mut session = UploadSession::new(42);
        let first = session.next_chunk(Bytes::from_static(b"a"), false).unwrap();
        let last = session.next_chunk(Bytes::from_static(b"b"), true).unwrap();
        assert_eq!((first.sequence_index, first.is_final), (0, false));
        assert_eq!((last.sequence_index, last.is_final), (1, true));
        assert_eq!(last.transfer_id, 42);
        assert!(session.is_finished());
        assert!(session.next_chunk(Bytes::new(), true).is_err());
    }

    #[test]
    fn test_in_order_chunks_reassemble() {
        let mut assembler = ChunkAssembler::new(1);
        assert_eq!(assembler.push(chunk(0, false, b"ab")).unwrap(), None);
        assert_eq!(assembler.push(chunk(1, false, b"cd")).unwrap(), None);
        let whole = assembler.push(chunk(2, true, b"e")).unwrap().unwrap();
        assert_eq!(&whole[..], b"abcde");
    }

    #[test]
    fn test_gap_is_rejected() {
        let mut assembler = ChunkAssembler::new(1);
        assembler.push(chunk(0, false, b"ab")).unwrap();
        assert!(matches!(
            assembler.push(chunk(2, true, b"x")),
            Err(ProtocolError::ChunkSequence { expected: 1, got: 2 })
        ));
    }

    #[test]
    fn test_unfinished_transfer_surfaces_nothing() {
        let mut assembler = ChunkAssembler::new(1);
        assert_eq!(assembler.push(chunk(0, false, b"partial")).unwrap(), None);
        assert_eq!(assembler.received(), 7);
        // Dropping the assembler is how a connection loss discards it
        drop(assembler);
    }
}
