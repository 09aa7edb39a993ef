pub mod client;
pub mod coord;
pub mod crypto;
pub mod heartbeat;
pub mod protocol;
pub mod router;
pub mod rpc;

pub use client::ClientCore;
pub use coord::{Coordinator, CoordinatorHandle};
pub use crypto::{CryptoError, RsaKeyPair, SymKey};
pub use heartbeat::{FailureDetector, MonitorTarget};
pub use protocol::*;
pub use router::{Router, RouterHandle, RouterTuning};
pub use rpc::RpcError;
