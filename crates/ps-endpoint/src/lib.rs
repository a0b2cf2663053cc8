// ps-endpoint: Endpoint-addressed key/value RPC over the peer mesh.
//
// An endpoint serves `get`/`set`/`exists`/`evict` against a storage
// collaborator and transparently dispatches operations addressed to other
// endpoints through the peer manager. Request/response correlation is by
// message id; the wire envelope lives in `messages`.

pub mod endpoint;
pub mod messages;
pub mod storage;

pub use endpoint::{Endpoint, EndpointConfig, EndpointError, EndpointMode};
pub use messages::{EndpointOp, EndpointRequest, MessageKind};
pub use storage::{MemoryStorage, Storage, StorageError};
