// ps-protocol: Wire formats for the peer-to-peer data plane.
//
// Two codecs live here:
//
// - `messages`: the relay control plane. JSON text frames with a top-level
//   `message_type` field for discriminated deserialization. These travel
//   between endpoints and the relay server over WebSocket and never carry
//   object bytes.
// - `chunks`: the data plane framing. Fixed-header binary frames that split
//   arbitrarily large payloads across the bounded message size of a WebRTC
//   data channel.

pub mod chunks;
pub mod messages;

pub use chunks::{
    Chunk, ChunkDType, ChunkError, Payload, CHUNK_HEADER_LEN, chunkify, reconstruct,
};
pub use messages::{
    DescriptionType, MessageDecodeError, MessageEncodeError, PeerConnectionMessage, RelayMessage,
    ServerRegistration, ServerResponse, decode, encode,
};
