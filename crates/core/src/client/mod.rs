/// Client core: the circuit lifecycle for one HTTP request
///
/// Fetch a ring from the coordinator, grow the circuit with three `Init`
/// calls to the guard, tunnel the request as a three-layer onion, unwrap the
/// reply, and tear the circuit down. Any failure before the body arrives
/// restarts the whole lifecycle under a fresh client id; a teardown failure
/// is logged and the body still returned.
pub mod onion;

pub use onion::{
    circuit_init_packages, deonionize_response, onionize_request, teardown_package, unwrap_acks,
    OnionError,
};

use crate::coord;
use crate::crypto::SymKey;
use crate::protocol::{
    CircuitPackage, CircuitPackageReply, HttpTunnelRequest, OnionMessage, OnionRingRequest,
    RingRouter, RouterHttpResponse, RouterRequest, RouterResponse,
};
use crate::rpc::{self, RpcError};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};
use uuid::Uuid;
use veilnet_common::circuit::RING_LEN;
use veilnet_common::{config, ClientConfig, ClientId, Result, TraceToken, VeilNetError};

pub struct ClientCore {
    coord_addr: String,

    /// `None` retries until the caller gives up on the future
    max_attempts: Option<u32>,
    retry_delay: Duration,
}

impl ClientCore {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            coord_addr: config.coord_addr.clone(),
            max_attempts: None,
            retry_delay: config::retry_delay(),
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Tunnel one GET through a fresh circuit, retrying transparently
    pub async fn fetch(&self, request: HttpTunnelRequest) -> Result<Vec<u8>> {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            if attempt > 1 {
                sleep(self.retry_delay).await;
            }

            match self.attempt(&request).await {
                Ok(body) => return Ok(body),
                Err(e) => {
                    warn!(attempt, error = %e, "client request failed");
                    if let Some(max) = self.max_attempts {
                        if attempt >= max {
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    /// One full lifecycle under one client id
    async fn attempt(&self, request: &HttpTunnelRequest) -> Result<Vec<u8>> {
        let client_id = ClientId::new(Uuid::new_v4().to_string());

        info!(client_id = %client_id, "requesting onion ring");
        let ring_response = coord::get_onion_ring(
            &self.coord_addr,
            OnionRingRequest {
                client_id: client_id.clone(),
                token: TraceToken::generate(),
            },
        )
        .await?;

        let ring = ring_response.onion_ring;
        if ring.len() != RING_LEN {
            return Err(VeilNetError::protocol(format!(
                "coordinator returned a ring of {} routers",
                ring.len()
            )));
        }

        let ids: Vec<_> = ring.iter().map(|r| r.router_id).collect();
        info!(client_id = %client_id, routers = ?ids, "new onion ring");

        let keys: Vec<SymKey> = (0..RING_LEN).map(|_| SymKey::generate()).collect();
        let guard_addr = ring[0].addr.clone();

        self.construct_circuit(&client_id, &ring, &keys, &guard_addr)
            .await?;

        let body = self
            .tunnel_request(&client_id, request, &ring, &keys, &guard_addr)
            .await?;

        // The request already succeeded; a teardown failure is not retried
        info!(client_id = %client_id, "circuit teardown");
        match self.teardown(&client_id, &ring, &keys, &guard_addr).await {
            Ok(()) => info!(client_id = %client_id, "circuit teardown complete"),
            Err(e) => warn!(client_id = %client_id, error = %e, "circuit teardown failed"),
        }

        Ok(body)
    }

    /// Three `Init` calls to the guard, each one hop deeper
    async fn construct_circuit(
        &self,
        client_id: &ClientId,
        ring: &[RingRouter],
        keys: &[SymKey],
        guard_addr: &str,
    ) -> Result<()> {
        let packages = circuit_init_packages(client_id, ring, keys)
            .map_err(|e| VeilNetError::CircuitInitFailed(e.to_string()))?;

        for (hop, package) in packages.into_iter().enumerate() {
            info!(client_id = %client_id, hop, "circuit init");

            let reply = call_init(guard_addr, package)
                .await
                .map_err(|e| VeilNetError::CircuitInitFailed(e.to_string()))?;

            let sealed = reply
                .payload
                .ok_or_else(|| VeilNetError::CircuitInitFailed("empty init reply".to_string()))?;

            // The established prefix acknowledges layer by layer
            unwrap_acks(&sealed, keys)
                .map_err(|e| VeilNetError::CircuitInitFailed(e.to_string()))?;

            info!(client_id = %client_id, hop, "circuit init complete");
        }

        Ok(())
    }

    async fn tunnel_request(
        &self,
        client_id: &ClientId,
        request: &HttpTunnelRequest,
        ring: &[RingRouter],
        keys: &[SymKey],
        guard_addr: &str,
    ) -> Result<Vec<u8>> {
        let message = onionize_request(client_id, request, ring, keys)
            .map_err(|e| VeilNetError::RequestFailed(e.to_string()))?;

        info!(client_id = %client_id, onion_len = message.onion.len(), "client request");

        let response = call_send(guard_addr, message)
            .await
            .map_err(|e| VeilNetError::RequestFailed(e.to_string()))?;

        let body = deonionize_response(&response.response, keys)
            .map_err(|e| VeilNetError::RequestFailed(e.to_string()))?;

        info!(client_id = %client_id, bytes = body.len(), "response received");
        Ok(body)
    }

    async fn teardown(
        &self,
        client_id: &ClientId,
        ring: &[RingRouter],
        keys: &[SymKey],
        guard_addr: &str,
    ) -> Result<()> {
        let package = teardown_package(client_id, ring, keys)
            .map_err(|e| VeilNetError::TeardownFailed(e.to_string()))?;

        let reply = call_teardown(guard_addr, package)
            .await
            .map_err(|e| VeilNetError::TeardownFailed(e.to_string()))?;

        match reply.payload {
            Some(sealed) => {
                unwrap_acks(&sealed, keys).map_err(|e| VeilNetError::TeardownFailed(e.to_string()))
            }
            // Only a single-hop ring answers bare; harmless either way
            None => Ok(()),
        }
    }
}

async fn call_init(
    addr: &str,
    package: CircuitPackage,
) -> std::result::Result<CircuitPackageReply, RpcError> {
    match rpc::call(addr, &RouterRequest::Init(package)).await? {
        RouterResponse::Init(reply) => Ok(reply),
        RouterResponse::Error(msg) => Err(RpcError::Remote(msg)),
        _ => Err(RpcError::Remote("unexpected response to Init".to_string())),
    }
}

async fn call_send(
    addr: &str,
    message: OnionMessage,
) -> std::result::Result<RouterHttpResponse, RpcError> {
    match rpc::call(addr, &RouterRequest::Send(message)).await? {
        RouterResponse::Send(response) => Ok(response),
        RouterResponse::Error(msg) => Err(RpcError::Remote(msg)),
        _ => Err(RpcError::Remote("unexpected response to Send".to_string())),
    }
}

async fn call_teardown(
    addr: &str,
    package: CircuitPackage,
) -> std::result::Result<CircuitPackageReply, RpcError> {
    match rpc::call(addr, &RouterRequest::Teardown(package)).await? {
        RouterResponse::Teardown(reply) => Ok(reply),
        RouterResponse::Error(msg) => Err(RpcError::Remote(msg)),
        _ => Err(RpcError::Remote(
            "unexpected response to Teardown".to_string(),
        )),
    }
}
