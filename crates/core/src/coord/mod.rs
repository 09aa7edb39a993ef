/// Coordinator: router directory and circuit selection
///
/// Owns the registry, gates `GetOnionRing` on three registered routers, and
/// consumes the failure detector's event streams: failures evict routers,
/// circuit-count updates keep the load view current. No attempt is made to
/// rebuild circuits through an evicted router; clients retry.
pub mod registry;

pub use registry::{Registry, RegistryError, RouterEntry};

use crate::heartbeat::{DetectorConfig, DetectorEvents, FailureDetector, MonitorTarget};
use crate::protocol::{
    CoordRequest, CoordResponse, OnionRingRequest, OnionRingResponse, RouterJoinRequest,
    RouterJoinResponse,
};
use crate::rpc;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use veilnet_common::circuit::RING_LEN;
use veilnet_common::{CoordConfig, Result, TraceToken, VeilNetError};

pub struct Coordinator {
    registry: Mutex<Registry>,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
    detector: Arc<FailureDetector>,
}

/// A running coordinator: bound addresses plus its background tasks
pub struct CoordinatorHandle {
    pub client_addr: SocketAddr,
    pub router_addr: SocketAddr,
    coordinator: Arc<Coordinator>,
    tasks: Vec<JoinHandle<()>>,
}

impl Coordinator {
    /// Bind listeners, start the failure detector and event consumers, and
    /// serve RPCs until stopped
    pub async fn start(config: CoordConfig) -> Result<CoordinatorHandle> {
        let (detector, events) = FailureDetector::start(DetectorConfig {
            ack_listen_addr: Some(config.ack_local_addr.clone()),
            monitor_bind_addr: config.hbeat_local_addr.clone(),
        })
        .await?;

        let (ready_tx, ready_rx) = watch::channel(false);
        let coordinator = Arc::new(Coordinator {
            registry: Mutex::new(Registry::new()),
            ready_tx,
            ready_rx,
            detector: Arc::new(detector),
        });

        let client_listener = TcpListener::bind(&config.client_listen_addr).await?;
        let router_listener = TcpListener::bind(&config.router_listen_addr).await?;
        let client_addr = client_listener.local_addr()?;
        let router_addr = router_listener.local_addr()?;

        info!(%client_addr, %router_addr, "coordinator started");

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(coordinator.clone().consume_events(events)));

        // Same dispatch on both listeners, as routers and clients share the
        // request surface
        for listener in [client_listener, router_listener] {
            let coordinator = coordinator.clone();
            tasks.push(tokio::spawn(async move {
                let handler = move |request: CoordRequest| {
                    let coordinator = coordinator.clone();
                    async move { coordinator.handle(request).await }
                };
                if let Err(e) = rpc::serve(listener, handler).await {
                    warn!(error = %e, "coordinator rpc listener failed");
                }
            }));
        }

        Ok(CoordinatorHandle {
            client_addr,
            router_addr,
            coordinator,
            tasks,
        })
    }

    async fn handle(self: Arc<Self>, request: CoordRequest) -> CoordResponse {
        match request {
            CoordRequest::RegisterRouter(join) => self.handle_register(join),
            CoordRequest::GetOnionRing(request) => self.handle_get_ring(request).await,
        }
    }

    fn handle_register(&self, join: RouterJoinRequest) -> CoordResponse {
        info!(router_id = %join.router_id, token = %join.token, "router join request received");

        let registered = {
            let mut registry = self.registry.lock().expect("registry lock poisoned");
            registry
                .register(RouterEntry {
                    router_id: join.router_id,
                    public_key: join.public_key,
                    client_listen_addr: join.client_listen_addr,
                    coord_listen_addr: join.coord_listen_addr,
                    ocheck_addr: join.ocheck_addr.clone(),
                    active_chain_count: 0,
                })
                .map(|_| (registry.len(), registry.router_ids()))
        };

        match registered {
            Ok((len, ids)) => {
                self.detector.monitor_router(MonitorTarget {
                    router_id: join.router_id,
                    addr: join.ocheck_addr,
                });

                info!(router_id = %join.router_id, routers = ?ids, "router registry updated");

                if len >= RING_LEN {
                    let _ = self.ready_tx.send(true);
                }

                CoordResponse::RegisterRouter(RouterJoinResponse {
                    token: TraceToken::generate(),
                })
            }
            Err(e) => {
                warn!(router_id = %join.router_id, "rejected join: {}", e);
                CoordResponse::Error(e.to_string())
            }
        }
    }

    async fn handle_get_ring(&self, request: OnionRingRequest) -> CoordResponse {
        // Block until three routers have joined; readiness is sticky, so
        // this gate only matters during startup
        let mut ready = self.ready_rx.clone();
        if ready.wait_for(|ready| *ready).await.is_err() {
            return CoordResponse::Error("coordinator shutting down".to_string());
        }

        info!(client_id = %request.client_id, token = %request.token, "onion ring request received");

        let ring = {
            let mut registry = self.registry.lock().expect("registry lock poisoned");
            debug!(counts = ?registry.counts(), "selecting onion ring");
            registry.select_ring()
        };

        match ring {
            Some(ring) => {
                let ids: Vec<_> = ring.iter().map(|r| r.router_id).collect();
                info!(client_id = %request.client_id, routers = ?ids, "onion ring created");

                CoordResponse::GetOnionRing(OnionRingResponse {
                    onion_ring: ring,
                    token: TraceToken::generate(),
                })
            }
            // Failures after startup can shrink the directory below a ring
            None => CoordResponse::Error("not enough routers for a ring".to_string()),
        }
    }

    async fn consume_events(self: Arc<Self>, mut events: DetectorEvents) {
        loop {
            tokio::select! {
                failure = events.failures.recv() => {
                    let Some(failure) = failure else { return };

                    let (removed, ids) = {
                        let mut registry = self.registry.lock().expect("registry lock poisoned");
                        (registry.remove(failure.router_id), registry.router_ids())
                    };

                    if removed {
                        info!(router_id = %failure.router_id, routers = ?ids, "router failure handled, registry updated");
                    }
                }
                update = events.counts.recv() => {
                    let Some(update) = update else { return };

                    let changed = {
                        let mut registry = self.registry.lock().expect("registry lock poisoned");
                        registry.update_count(update.router_id, update.active_count)
                    };

                    if let Some((old, new)) = changed {
                        debug!(router_id = %update.router_id, old, new, "active chain count updated");
                    }
                }
            }
        }
    }

    /// Snapshot of the directory's ids, oldest registration first
    pub fn router_ids(&self) -> Vec<veilnet_common::RouterId> {
        self.registry.lock().expect("registry lock poisoned").router_ids()
    }
}

impl CoordinatorHandle {
    pub fn coordinator(&self) -> Arc<Coordinator> {
        self.coordinator.clone()
    }

    /// Stop serving and join the failure detector's workers
    pub async fn stop(self) {
        for task in &self.tasks {
            task.abort();
        }
        self.coordinator.detector.stop().await;
    }
}

// Used by routers to register and by tests to drive the RPC surface without
// a full router process.
pub async fn register_router(
    coord_addr: &str,
    join: RouterJoinRequest,
) -> Result<RouterJoinResponse> {
    let response: CoordResponse = rpc::call(coord_addr, &CoordRequest::RegisterRouter(join))
        .await
        .map_err(|e| VeilNetError::network(e.to_string()))?;

    match response {
        CoordResponse::RegisterRouter(response) => Ok(response),
        CoordResponse::Error(msg) => Err(VeilNetError::Protocol(msg)),
        _ => Err(VeilNetError::protocol("unexpected response to RegisterRouter")),
    }
}

/// Fetch `[guard, middle, exit]` from the coordinator; blocks server-side
/// until the directory is ready
pub async fn get_onion_ring(coord_addr: &str, request: OnionRingRequest) -> Result<OnionRingResponse> {
    let response: CoordResponse = rpc::call(coord_addr, &CoordRequest::GetOnionRing(request))
        .await
        .map_err(|e| VeilNetError::network(e.to_string()))?;

    match response {
        CoordResponse::GetOnionRing(response) => Ok(response),
        CoordResponse::Error(msg) => Err(VeilNetError::Protocol(msg)),
        _ => Err(VeilNetError::protocol("unexpected response to GetOnionRing")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;
    use veilnet_common::{ClientId, RouterId};

    fn test_config() -> CoordConfig {
        CoordConfig {
            client_listen_addr: "127.0.0.1:0".to_string(),
            router_listen_addr: "127.0.0.1:0".to_string(),
            ack_local_addr: "127.0.0.1:0".to_string(),
            hbeat_local_addr: "127.0.0.1:0".to_string(),
            tracing_server_addr: None,
            tracing_identity: None,
        }
    }

    fn join_request(id: u32) -> RouterJoinRequest {
        RouterJoinRequest {
            router_id: RouterId::new(id),
            public_key: format!("pk-{}", id).into_bytes(),
            client_listen_addr: format!("127.0.0.1:7{:03}", id),
            coord_listen_addr: format!("127.0.0.1:8{:03}", id),
            // Nothing listens here; monitors just probe into the void
            ocheck_addr: "127.0.0.1:9".to_string(),
            token: TraceToken::generate(),
        }
    }

    #[tokio::test]
    async fn test_register_and_duplicate_rejection() {
        let handle = Coordinator::start(test_config()).await.unwrap();
        let router_addr = handle.router_addr.to_string();

        register_router(&router_addr, join_request(1)).await.unwrap();

        // Same public key, new claimed id
        let mut rejoin = join_request(5);
        rejoin.public_key = b"pk-1".to_vec();
        let err = register_router(&router_addr, rejoin).await.unwrap_err();
        assert!(err.to_string().contains("already exists"));

        assert_eq!(handle.coordinator().router_ids(), vec![RouterId::new(1)]);
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_get_ring_blocks_until_three_routers() {
        let handle = Coordinator::start(test_config()).await.unwrap();
        let client_addr = handle.client_addr.to_string();
        let router_addr = handle.router_addr.to_string();

        register_router(&router_addr, join_request(1)).await.unwrap();
        register_router(&router_addr, join_request(2)).await.unwrap();

        let ring_request = OnionRingRequest {
            client_id: ClientId::new("blocked-client"),
            token: TraceToken::generate(),
        };

        // With two routers the call must still be pending...
        let pending = get_onion_ring(&client_addr, ring_request.clone());
        tokio::pin!(pending);
        assert!(
            timeout(Duration::from_millis(300), &mut pending).await.is_err(),
            "ring request should block before the third router joins"
        );

        // ...and complete once the third joins
        register_router(&router_addr, join_request(3)).await.unwrap();
        let response = timeout(Duration::from_secs(5), pending)
            .await
            .expect("ring request did not unblock")
            .unwrap();

        assert_eq!(response.onion_ring.len(), 3);
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_ring_routers_carry_client_addrs() {
        let handle = Coordinator::start(test_config()).await.unwrap();
        let router_addr = handle.router_addr.to_string();

        for id in 1..=3 {
            register_router(&router_addr, join_request(id)).await.unwrap();
        }

        let response = get_onion_ring(
            &handle.client_addr.to_string(),
            OnionRingRequest {
                client_id: ClientId::new("c"),
                token: TraceToken::generate(),
            },
        )
        .await
        .unwrap();

        for router in &response.onion_ring {
            assert!(router.addr.starts_with("127.0.0.1:7"));
            assert!(!router.public_key.is_empty());
        }
        handle.stop().await;
    }
}
