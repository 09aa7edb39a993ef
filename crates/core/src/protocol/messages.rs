use serde::{Deserialize, Serialize};
use veilnet_common::{ClientId, RouterId, TraceToken};

/// How the receiving router must open a sealed payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SealKind {
    /// RSA-OAEP to the router's long-lived public key (key-establishing hop)
    Asym,
    /// AES-CFB under the already-established shared key (forwarding hop)
    Sym,
}

// ============================================================================
// Coordinator RPC
// ============================================================================

/// Requests served by the coordinator, on both its listen addresses
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "body")]
pub enum CoordRequest {
    RegisterRouter(RouterJoinRequest),
    GetOnionRing(OnionRingRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "body")]
pub enum CoordResponse {
    RegisterRouter(RouterJoinResponse),
    GetOnionRing(OnionRingResponse),
    Error(String),
}

/// A router announcing itself to the directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterJoinRequest {
    pub router_id: RouterId,

    /// PKCS#1 DER public key; the router's identity in the directory
    pub public_key: Vec<u8>,

    /// RPC (TCP) address the router serves clients and peers on
    pub client_listen_addr: String,

    /// RPC (TCP) address the router serves the coordinator on
    pub coord_listen_addr: String,

    /// UDP address the router answers heartbeats on
    pub ocheck_addr: String,

    pub token: TraceToken,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterJoinResponse {
    pub token: TraceToken,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnionRingRequest {
    pub client_id: ClientId,
    pub token: TraceToken,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnionRingResponse {
    /// `[guard, middle, exit]`
    pub onion_ring: Vec<RingRouter>,
    pub token: TraceToken,
}

/// What a client learns about each hop of its ring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingRouter {
    pub router_id: RouterId,
    pub public_key: Vec<u8>,

    /// RPC (TCP) address the client (or previous hop) dials
    pub addr: String,
}

// ============================================================================
// Router RPC
// ============================================================================

/// Requests served by every router
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "body")]
pub enum RouterRequest {
    Init(CircuitPackage),
    Send(OnionMessage),
    Teardown(CircuitPackage),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "body")]
pub enum RouterResponse {
    Init(CircuitPackageReply),
    Send(RouterHttpResponse),
    Teardown(CircuitPackageReply),
    Error(String),
}

/// Outermost envelope for `Init` and `Teardown`: an opaque sealed payload
/// plus the tag saying how to open it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitPackage {
    pub client_id: ClientId,
    pub payload: Vec<u8>,
    pub seal: SealKind,
    pub token: TraceToken,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitPackageReply {
    /// Sealed reply bytes; `None` only for the exit hop of a teardown
    pub payload: Option<Vec<u8>>,
    pub token: TraceToken,
}

/// Request-phase envelope: the onion with this hop's layer outermost
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnionMessage {
    pub client_id: ClientId,
    pub onion: Vec<u8>,
    pub token: TraceToken,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterHttpResponse {
    /// Response onion, sealed under the answering hop's shared key
    pub response: Vec<u8>,
    pub token: TraceToken,
}

// ============================================================================
// Sealed layer payloads
// ============================================================================

/// One peeled layer: what a router finds inside a seal addressed to it.
///
/// `next == None` means this hop is the target of the message (the key grant
/// during init, the exit during send/teardown).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LayerRequest {
    pub client_id: ClientId,
    pub next: Option<NextHop>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NextHop {
    pub addr: String,
    pub seal: SealKind,
}

/// A router's sealed answer, one per layer of a reply onion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayReply {
    pub payload: Option<Vec<u8>>,
    pub did_succeed: bool,
    pub is_web_server: bool,
    pub err_msg: Option<String>,
}

impl RelayReply {
    pub fn ok(payload: Option<Vec<u8>>) -> Self {
        Self {
            payload,
            did_succeed: true,
            is_web_server: false,
            err_msg: None,
        }
    }

    pub fn web_server(body: Vec<u8>) -> Self {
        Self {
            payload: Some(body),
            did_succeed: true,
            is_web_server: true,
            err_msg: None,
        }
    }

    pub fn failed(err_msg: impl Into<String>) -> Self {
        Self {
            payload: None,
            did_succeed: false,
            is_web_server: false,
            err_msg: Some(err_msg.into()),
        }
    }
}

/// The innermost plaintext of a request onion, consumed by the exit hop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpTunnelRequest {
    pub headers: Vec<(String, String)>,
    pub method: String,
    pub url: String,
    pub body: Vec<u8>,
}

impl HttpTunnelRequest {
    /// A bare GET, the only method the exit will serve
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            headers: Vec::new(),
            method: "GET".to_string(),
            url: url.into(),
            body: Vec::new(),
        }
    }
}
