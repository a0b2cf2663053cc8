//! Payload chunking for bounded-size data-channel frames.
//!
//! A WebRTC data channel caps the size of a single message, so application
//! payloads are split into a stream of chunks, each one data-channel frame.
//! Every chunk carries a fixed-width big-endian header:
//!
//! ```text
//! dtype: u16 | total_length: u32 | stream_id: u32 | seq_id: u32 | seq_len: u32
//! ```
//!
//! followed by `total_length - 18` payload bytes. Trailing padding after
//! `total_length` is tolerated on decode. Completion of a stream is inferred
//! by the receiver once `seq_len` chunks of one `stream_id` have arrived;
//! there is no terminator frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size in bytes of the fixed chunk header.
pub const CHUNK_HEADER_LEN: usize = 2 + 4 * 4;

/// Data type carried by a chunk stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkDType {
    /// Payload is raw bytes.
    Bytes = 1,
    /// Payload is UTF-8 text.
    Utf8 = 2,
}

impl ChunkDType {
    fn from_wire(value: u16) -> Result<Self, ChunkError> {
        match value {
            1 => Ok(ChunkDType::Bytes),
            2 => Ok(ChunkDType::Utf8),
            other => Err(ChunkError::UnknownDType(other)),
        }
    }
}

/// An application payload on either side of the chunk codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Bytes(Bytes),
    Text(String),
}

impl Payload {
    /// Length of the payload in bytes (UTF-8 length for text).
    pub fn len(&self) -> usize {
        match self {
            Payload::Bytes(data) => data.len(),
            Payload::Text(text) => text.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> ChunkDType {
        match self {
            Payload::Bytes(_) => ChunkDType::Bytes,
            Payload::Text(_) => ChunkDType::Utf8,
        }
    }

    fn as_bytes(&self) -> Bytes {
        match self {
            Payload::Bytes(data) => data.clone(),
            Payload::Text(text) => Bytes::copy_from_slice(text.as_bytes()),
        }
    }
}

impl From<Vec<u8>> for Payload {
    fn from(data: Vec<u8>) -> Self {
        Payload::Bytes(Bytes::from(data))
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_owned())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

// ---------------------------------------------------------------------------
// Chunk
// ---------------------------------------------------------------------------

/// One frame of a chunked payload stream.
///
/// The data slice of a text stream need not be valid UTF-8 on its own; a
/// chunk boundary may fall inside a code point. Validation happens once at
/// [`reconstruct`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub stream_id: u32,
    pub seq_id: u32,
    pub seq_len: u32,
    pub dtype: ChunkDType,
    pub data: Bytes,
}

impl Chunk {
    /// Build a chunk, enforcing `seq_id < seq_len`.
    pub fn new(
        stream_id: u32,
        seq_id: u32,
        seq_len: u32,
        dtype: ChunkDType,
        data: Bytes,
    ) -> Result<Self, ChunkError> {
        if seq_id >= seq_len {
            return Err(ChunkError::InvalidSequence { seq_id, seq_len });
        }
        Ok(Chunk {
            stream_id,
            seq_id,
            seq_len,
            dtype,
            data,
        })
    }

    /// Pack the chunk into one wire frame.
    pub fn to_bytes(&self) -> Bytes {
        let total_length = CHUNK_HEADER_LEN + self.data.len();
        let mut buf = BytesMut::with_capacity(total_length);
        buf.put_u16(self.dtype as u16);
        buf.put_u32(u32::try_from(total_length).expect("chunk frame exceeds u32 length"));
        buf.put_u32(self.stream_id);
        buf.put_u32(self.seq_id);
        buf.put_u32(self.seq_len);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    /// Decode one wire frame into a chunk.
    pub fn from_bytes(frame: &[u8]) -> Result<Self, ChunkError> {
        if frame.len() < CHUNK_HEADER_LEN {
            return Err(ChunkError::Truncated {
                length: frame.len(),
            });
        }
        let mut header = &frame[..CHUNK_HEADER_LEN];
        let dtype = ChunkDType::from_wire(header.get_u16())?;
        let total_length = header.get_u32() as usize;
        let stream_id = header.get_u32();
        let seq_id = header.get_u32();
        let seq_len = header.get_u32();
        if total_length < CHUNK_HEADER_LEN || total_length > frame.len() {
            return Err(ChunkError::Truncated {
                length: frame.len(),
            });
        }
        Chunk::new(
            stream_id,
            seq_id,
            seq_len,
            dtype,
            Bytes::copy_from_slice(&frame[CHUNK_HEADER_LEN..total_length]),
        )
    }
}

// ---------------------------------------------------------------------------
// chunkify / reconstruct
// ---------------------------------------------------------------------------

/// Error type for the chunk codec.
#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("seq_id ({seq_id}) must be less than seq_len ({seq_len})")]
    InvalidSequence { seq_id: u32, seq_len: u32 },
    #[error("unknown chunk dtype tag: {0}")]
    UnknownDType(u16),
    #[error("frame of {length} bytes is shorter than its declared length")]
    Truncated { length: usize },
    #[error("chunk list is empty")]
    Empty,
    #[error("got {actual} chunks but the stream declares {expected}")]
    IncompleteStream { expected: u32, actual: usize },
    #[error("duplicate chunk seq_id {seq_id} in stream {stream_id}")]
    DuplicateChunk { stream_id: u32, seq_id: u32 },
    #[error("chunks from stream {other} mixed into stream {stream_id}")]
    MixedStreams { stream_id: u32, other: u32 },
    #[error("reassembled text stream is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

/// Split a payload into `ceil(len / size)` chunks of at most `size` payload
/// bytes each, all tagged with `stream_id`.
///
/// An empty payload yields exactly one empty chunk (`seq_len = 1`), so every
/// payload — including zero-length ones — is representable on the wire.
/// Payloads longer than `size * 2^32` bytes cannot be represented.
///
/// # Panics
///
/// Panics if `size` is zero; the transport always supplies its positive
/// maximum frame size.
pub fn chunkify(payload: &Payload, size: usize, stream_id: u32) -> impl Iterator<Item = Chunk> {
    assert!(size > 0, "chunk size must be positive");
    let data = payload.as_bytes();
    let dtype = payload.dtype();
    let seq_len = u32::try_from(data.len().div_ceil(size)).expect("payload exceeds chunk limit");
    let seq_len = seq_len.max(1);
    (0..seq_len).map(move |seq_id| {
        let start = seq_id as usize * size;
        let end = (start + size).min(data.len());
        Chunk {
            stream_id,
            seq_id,
            seq_len,
            dtype,
            data: data.slice(start..end),
        }
    })
}

/// Reassemble a payload from the complete set of chunks of one stream.
///
/// Requires exactly `seq_len` chunks; order does not matter. Duplicate
/// sequence numbers and chunks from foreign streams are rejected.
pub fn reconstruct(mut chunks: Vec<Chunk>) -> Result<Payload, ChunkError> {
    let Some(first) = chunks.first() else {
        return Err(ChunkError::Empty);
    };
    let stream_id = first.stream_id;
    let seq_len = first.seq_len;
    let dtype = first.dtype;
    if chunks.len() != seq_len as usize {
        return Err(ChunkError::IncompleteStream {
            expected: seq_len,
            actual: chunks.len(),
        });
    }
    for chunk in &chunks {
        if chunk.stream_id != stream_id {
            return Err(ChunkError::MixedStreams {
                stream_id,
                other: chunk.stream_id,
            });
        }
    }

    chunks.sort_by_key(|chunk| chunk.seq_id);
    for (expected, chunk) in chunks.iter().enumerate() {
        let expected = u32::try_from(expected).expect("chunk count fits u32");
        if chunk.seq_id != expected {
            return Err(ChunkError::DuplicateChunk {
                stream_id,
                seq_id: chunk.seq_id,
            });
        }
    }

    let mut data = BytesMut::with_capacity(chunks.iter().map(|c| c.data.len()).sum());
    for chunk in &chunks {
        data.put_slice(&chunk.data);
    }
    match dtype {
        ChunkDType::Bytes => Ok(Payload::Bytes(data.freeze())),
        ChunkDType::Utf8 => Ok(Payload::Text(String::from_utf8(data.to_vec())?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_bytes_payload() {
        let payload = Payload::from((0..=255u8).cycle().take(10_000).collect::<Vec<u8>>());
        let chunks: Vec<Chunk> = chunkify(&payload, 1024, 7).collect();
        assert_eq!(chunks.len(), 10);
        assert!(chunks.iter().all(|c| c.stream_id == 7 && c.seq_len == 10));
        assert_eq!(reconstruct(chunks).expect("reconstruct"), payload);
    }

    #[test]
    fn round_trip_text_payload_with_multibyte_boundary() {
        // 3-byte code points with a chunk size that splits them mid-sequence.
        let payload = Payload::from("\u{2603}".repeat(100));
        let chunks: Vec<Chunk> = chunkify(&payload, 7, 1).collect();
        assert_eq!(reconstruct(chunks).expect("reconstruct"), payload);
    }

    #[test]
    fn round_trip_through_wire_frames() {
        let payload = Payload::from(vec![42u8; 5000]);
        let frames: Vec<Bytes> = chunkify(&payload, 999, 3).map(|c| c.to_bytes()).collect();
        let chunks: Vec<Chunk> = frames
            .iter()
            .map(|f| Chunk::from_bytes(f).expect("decode"))
            .collect();
        assert_eq!(reconstruct(chunks).expect("reconstruct"), payload);
    }

    #[test]
    fn empty_payload_is_one_chunk() {
        let chunks: Vec<Chunk> = chunkify(&Payload::from(Vec::new()), 16, 0).collect();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].seq_len, 1);
        assert!(chunks[0].data.is_empty());
        assert_eq!(
            reconstruct(chunks).expect("reconstruct"),
            Payload::Bytes(Bytes::new())
        );
    }

    #[test]
    fn out_of_order_chunks_reassemble() {
        let payload = Payload::from("abcdefghij");
        let mut chunks: Vec<Chunk> = chunkify(&payload, 3, 0).collect();
        chunks.reverse();
        assert_eq!(reconstruct(chunks).expect("reconstruct"), payload);
    }

    #[test]
    fn fewer_chunks_than_declared_is_rejected() {
        let mut chunks: Vec<Chunk> = chunkify(&Payload::from("abcdefghij"), 3, 0).collect();
        chunks.pop();
        assert!(matches!(
            reconstruct(chunks),
            Err(ChunkError::IncompleteStream { expected: 4, .. })
        ));
    }

    #[test]
    fn duplicate_chunk_is_rejected() {
        let mut chunks: Vec<Chunk> = chunkify(&Payload::from("abcdef"), 3, 0).collect();
        chunks[1] = chunks[0].clone();
        assert!(matches!(
            reconstruct(chunks),
            Err(ChunkError::DuplicateChunk { .. })
        ));
    }

    #[test]
    fn mixed_streams_are_rejected() {
        let mut chunks: Vec<Chunk> = chunkify(&Payload::from("abcdef"), 3, 0).collect();
        chunks[1].stream_id = 9;
        assert!(matches!(
            reconstruct(chunks),
            Err(ChunkError::MixedStreams { .. })
        ));
    }

    #[test]
    fn invalid_sequence_is_rejected_at_construction() {
        assert!(matches!(
            Chunk::new(0, 2, 2, ChunkDType::Bytes, Bytes::new()),
            Err(ChunkError::InvalidSequence { .. })
        ));
    }

    #[test]
    fn header_is_big_endian_with_declared_length() {
        let chunk = Chunk::new(1, 0, 1, ChunkDType::Utf8, Bytes::from_static(b"hi"))
            .expect("chunk");
        let frame = chunk.to_bytes();
        assert_eq!(frame.len(), CHUNK_HEADER_LEN + 2);
        assert_eq!(frame[..2], [0, 2]);
        assert_eq!(
            u32::from_be_bytes([frame[2], frame[3], frame[4], frame[5]]) as usize,
            frame.len()
        );
    }

    #[test]
    fn trailing_padding_is_tolerated_on_decode() {
        let chunk = Chunk::new(1, 0, 1, ChunkDType::Bytes, Bytes::from_static(b"abc"))
            .expect("chunk");
        let mut frame = chunk.to_bytes().to_vec();
        frame.extend_from_slice(&[0, 0, 0]);
        let decoded = Chunk::from_bytes(&frame).expect("decode");
        assert_eq!(decoded.data, Bytes::from_static(b"abc"));
    }

    #[test]
    fn truncated_frame_is_rejected() {
        assert!(matches!(
            Chunk::from_bytes(&[0u8; 4]),
            Err(ChunkError::Truncated { .. })
        ));
        let chunk = Chunk::new(1, 0, 1, ChunkDType::Bytes, Bytes::from_static(b"abcdef"))
            .expect("chunk");
        let frame = chunk.to_bytes();
        assert!(Chunk::from_bytes(&frame[..frame.len() - 2]).is_err());
    }

    #[test]
    fn unknown_dtype_is_rejected() {
        let chunk = Chunk::new(1, 0, 1, ChunkDType::Bytes, Bytes::from_static(b"x"))
            .expect("chunk");
        let mut frame = chunk.to_bytes().to_vec();
        frame[1] = 99;
        assert!(matches!(
            Chunk::from_bytes(&frame),
            Err(ChunkError::UnknownDType(99))
        ));
    }
}
