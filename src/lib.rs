// proxystore: Facade over the peer-to-peer data plane.
//
// Re-exports the member crates under stable module names. The relay server
// itself lives in the `relay` service crate and ships as the
// `proxystore-relay` binary.

pub use ps_endpoint as endpoint;
pub use ps_peer as peer;
pub use ps_protocol as protocol;
