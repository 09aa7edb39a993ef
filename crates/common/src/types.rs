use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric identity a router is configured with.
///
/// Routers are *authenticated* by their RSA public key; the id exists for
/// operators and log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RouterId(pub u32);

impl RouterId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for RouterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "router-{}", self.0)
    }
}

impl From<u32> for RouterId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Opaque per-request client identity.
///
/// A fresh id is minted for every request attempt, so a router can never
/// correlate two requests from the same user. Routers key their shared-key
/// tables by this value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ClientId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for ClientId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Opaque token carried on every RPC request/response pair.
///
/// Each handler mints a fresh token for its reply, so a request's path
/// through the overlay can be stitched together from log lines without any
/// node learning more than its own hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraceToken(u64);

impl TraceToken {
    pub fn generate() -> Self {
        Self(rand::thread_rng().gen())
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TraceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0.to_be_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_router_id_display() {
        assert_eq!(RouterId::new(7).to_string(), "router-7");
    }

    #[test]
    fn test_client_id_transparent_serde() {
        let id = ClientId::new("abc-123");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"abc-123\"");
        let back: ClientId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_trace_token_uniqueness() {
        let t1 = TraceToken::generate();
        let t2 = TraceToken::generate();
        assert_ne!(t1, t2);
    }
}
