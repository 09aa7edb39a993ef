pub mod config;
pub mod error;
pub mod types;

pub use config::{circuit, heartbeat, rpc, ClientConfig, ConfigError, CoordConfig, RouterConfig};
pub use error::{Result, VeilNetError};
pub use types::{ClientId, RouterId, TraceToken};
