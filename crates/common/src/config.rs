use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Circuit and key-lifecycle constants
pub mod circuit {
    use std::time::Duration;

    /// Number of hops in every onion ring
    pub const RING_LEN: usize = 3;

    /// Symmetric circuit key length in bytes (128-bit)
    pub const SYM_KEY_LEN: usize = 16;

    /// Asymmetric key size in bits
    pub const RSA_BITS: usize = 2048;

    /// Lifetime of a router-held shared key from the moment it is installed
    pub const SHARED_KEY_TTL: Duration = Duration::from_secs(5 * 60);

    /// Period of the shared-key sweeper
    pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

    /// Artificial per-hop forwarding delay
    pub const HOP_DELAY: Duration = Duration::from_millis(300);
}

/// Heartbeat failure-detector constants
pub mod heartbeat {
    use std::time::Duration;

    /// Consecutive missed acks before a target is declared failed
    pub const LOSS_THRESHOLD: u32 = 3;

    /// Starting round-trip estimate for a new monitor
    pub const INITIAL_RTT: Duration = Duration::from_secs(1);

    /// Floor for the adaptive round-trip estimate
    pub const MIN_RTT: Duration = Duration::from_millis(300);

    /// Read deadline for the ack responder socket
    pub const RESPONDER_READ_TIMEOUT: Duration = Duration::from_secs(1);
}

/// RPC transport constants
pub mod rpc {
    /// Maximum frame size (10 MB)
    pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;
}

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordConfig {
    /// RPC (TCP) address to listen on for clients
    pub client_listen_addr: String,

    /// RPC (TCP) address to listen on for routers
    pub router_listen_addr: String,

    /// UDP address for the heartbeat ack responder
    pub ack_local_addr: String,

    /// Local UDP address heartbeat monitors bind to ("ip:0" for ephemeral)
    pub hbeat_local_addr: String,

    /// Trace collector address (unused unless emission is wired up)
    #[serde(default)]
    pub tracing_server_addr: Option<String>,

    /// Identity to tag log lines with
    #[serde(default)]
    pub tracing_identity: Option<String>,
}

/// Router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Router's numeric id
    pub router_id: u32,

    /// RPC (TCP) address to listen on for clients and other routers
    pub client_listen_addr: String,

    /// RPC (TCP) address to listen on for the coordinator
    pub coord_listen_addr: String,

    /// UDP address to answer heartbeats on
    pub ocheck_addr: String,

    /// RPC (TCP) address of the coordinator
    pub coord_addr: String,

    /// Public host to advertise; listen ports are re-attached to it
    pub public_addr: String,

    #[serde(default)]
    pub tracing_server_addr: Option<String>,

    #[serde(default)]
    pub tracing_identity: Option<String>,
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Stable name for this client process (per-request ids are minted fresh)
    pub client_id: String,

    /// RPC (TCP) address of the coordinator
    pub coord_addr: String,

    /// HTTP address the browser-facing gateway listens on
    pub web_server_addr: String,

    #[serde(default)]
    pub tracing_server_addr: Option<String>,

    #[serde(default)]
    pub tracing_identity: Option<String>,
}

macro_rules! impl_json_config {
    ($ty:ty) => {
        impl $ty {
            /// Load configuration from a JSON file
            pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
                let contents = std::fs::read_to_string(path.as_ref())
                    .map_err(|e| ConfigError::ReadError(e.to_string()))?;

                serde_json::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))
            }

            /// Save configuration to a JSON file
            pub fn to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
                let contents = serde_json::to_string_pretty(self)
                    .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

                std::fs::write(path.as_ref(), contents)
                    .map_err(|e| ConfigError::WriteError(e.to_string()))?;

                Ok(())
            }
        }
    };
}

impl_json_config!(CoordConfig);
impl_json_config!(RouterConfig);
impl_json_config!(ClientConfig);

impl RouterConfig {
    /// Re-attach a locally bound port to the advertised public host.
    ///
    /// Listen addresses in the config are frequently "0.0.0.0:port" or
    /// "host:0"; peers must be handed `public_addr` plus whatever port was
    /// actually bound.
    pub fn public_address_for(&self, bound_addr: &str) -> String {
        match bound_addr.rsplit_once(':') {
            Some((_, port)) => format!("{}:{}", self.public_addr, port),
            None => self.public_addr.clone(),
        }
    }
}

/// Delay between client request attempts
pub fn retry_delay() -> Duration {
    Duration::from_secs(1)
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to serialize config: {0}")]
    SerializeError(String),

    #[error("Failed to write config file: {0}")]
    WriteError(String),
}
