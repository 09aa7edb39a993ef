/// Router: the relay engine of the overlay
///
/// Serves three RPCs. `Init` grows a circuit one hop at a time (the Asym
/// branch installs a client's shared key, the Sym branch peels a layer and
/// forwards). `Send` peels one layer of a request onion and either forwards
/// it or, at the exit, fetches the target URL. `Teardown` mirrors `Init` but
/// frees state. Per-client keys are TTL-bounded and swept once a minute.
use crate::coord;
use crate::crypto::{
    decode, encode_then_seal_sym, open_then_decode_asym, open_then_decode_sym, RsaKeyPair, SymKey,
};
use crate::heartbeat::{DetectorConfig, FailureDetector};
use crate::protocol::{
    CircuitPackage, CircuitPackageReply, HttpTunnelRequest, LayerRequest, OnionMessage,
    RelayReply, RouterHttpResponse, RouterJoinRequest, RouterRequest, RouterResponse, SealKind,
};
use crate::rpc::{self, RpcError};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use veilnet_common::circuit::{HOP_DELAY, SHARED_KEY_TTL, SWEEP_INTERVAL};
use veilnet_common::{ClientId, Result, RouterConfig, RouterId, TraceToken, VeilNetError};

/// Error strings that travel back through the onion, verbatim
const ERR_CONTACT_NEXT: &str = "Unable to contact next router.";
const ERR_SEND_NEXT: &str = "Unable to send to next router.";
const ERR_CONTACT_WEB: &str = "Unable to contact the web server.";
const ERR_READ_HTTP: &str = "Unable to read http response.";

/// A client's key at this hop, dead after `expires_at`
struct SharedKeyEntry {
    key: SymKey,
    expires_at: Instant,
}

/// Knobs the constants normally decide; tests shrink them
#[derive(Debug, Clone)]
pub struct RouterTuning {
    pub hop_delay: Duration,
    pub key_ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for RouterTuning {
    fn default() -> Self {
        Self {
            hop_delay: HOP_DELAY,
            key_ttl: SHARED_KEY_TTL,
            sweep_interval: SWEEP_INTERVAL,
        }
    }
}

pub struct Router {
    id: RouterId,
    keypair: RsaKeyPair,
    shared_keys: RwLock<HashMap<ClientId, SharedKeyEntry>>,
    active_circuits: Arc<AtomicU64>,
    tuning: RouterTuning,
}

/// A running router: bound addresses plus its background tasks
pub struct RouterHandle {
    pub client_addr: SocketAddr,
    pub coord_addr: SocketAddr,
    router: Arc<Router>,
    detector: Arc<FailureDetector>,
    tasks: Vec<JoinHandle<()>>,
}

impl Router {
    /// Generate keys, start the heartbeat responder, join the coordinator,
    /// and serve RPCs until stopped
    pub async fn start(config: RouterConfig) -> Result<RouterHandle> {
        Self::start_tuned(config, RouterTuning::default()).await
    }

    pub async fn start_tuned(config: RouterConfig, tuning: RouterTuning) -> Result<RouterHandle> {
        let id = RouterId::new(config.router_id);
        info!(router_id = %id, "router starting");

        let keypair = RsaKeyPair::generate().map_err(|e| VeilNetError::crypto(e.to_string()))?;

        let (detector, _events) =
            FailureDetector::start(DetectorConfig::responder(&config.ocheck_addr)).await?;
        let detector = Arc::new(detector);
        let ocheck_bound = detector
            .ack_addr()
            .expect("responder configured but not bound")
            .to_string();

        let router = Arc::new(Router {
            id,
            keypair,
            shared_keys: RwLock::new(HashMap::new()),
            active_circuits: detector.active_circuits(),
            tuning,
        });

        let client_listener = TcpListener::bind(&config.client_listen_addr).await?;
        let coord_listener = TcpListener::bind(&config.coord_listen_addr).await?;
        let client_addr = client_listener.local_addr()?;
        let coord_addr = coord_listener.local_addr()?;

        // Serve before joining, so the directory never lists an address
        // that is not yet accepting calls
        let mut tasks = Vec::new();
        for listener in [client_listener, coord_listener] {
            let router = router.clone();
            tasks.push(tokio::spawn(async move {
                let handler = move |request: RouterRequest| {
                    let router = router.clone();
                    async move { router.handle(request).await }
                };
                if let Err(e) = rpc::serve(listener, handler).await {
                    warn!(error = %e, "router rpc listener failed");
                }
            }));
        }

        tasks.push(tokio::spawn(router.clone().sweep_expired_keys()));

        let join = RouterJoinRequest {
            router_id: id,
            public_key: router.keypair.public_der().to_vec(),
            client_listen_addr: config.public_address_for(&client_addr.to_string()),
            coord_listen_addr: config.public_address_for(&coord_addr.to_string()),
            ocheck_addr: config.public_address_for(&ocheck_bound),
            token: TraceToken::generate(),
        };

        info!(router_id = %id, "router joining coordinator");
        match coord::register_router(&config.coord_addr, join).await {
            Ok(_) => info!(router_id = %id, "router joined"),
            // A rejected join (e.g. re-registering with a cached key) leaves
            // the node up but outside the directory
            Err(e) => warn!(router_id = %id, error = %e, "join rejected, serving idle"),
        }

        Ok(RouterHandle {
            client_addr,
            coord_addr,
            router,
            detector,
            tasks,
        })
    }

    #[cfg(test)]
    fn new_for_tests(id: u32, tuning: RouterTuning) -> Arc<Self> {
        Arc::new(Self {
            id: RouterId::new(id),
            keypair: RsaKeyPair::generate().expect("keygen"),
            shared_keys: RwLock::new(HashMap::new()),
            active_circuits: Arc::new(AtomicU64::new(0)),
            tuning,
        })
    }

    pub fn id(&self) -> RouterId {
        self.id
    }

    pub fn public_der(&self) -> &[u8] {
        self.keypair.public_der()
    }

    pub fn active_circuits(&self) -> u64 {
        self.active_circuits.load(Ordering::Relaxed)
    }

    pub async fn shared_key_count(&self) -> usize {
        self.shared_keys.read().await.len()
    }

    async fn handle(self: Arc<Self>, request: RouterRequest) -> RouterResponse {
        match request {
            RouterRequest::Init(package) => self.handle_init(package).await,
            RouterRequest::Send(message) => self.handle_send(message).await,
            RouterRequest::Teardown(package) => self.handle_teardown(package).await,
        }
    }

    // ======================== Init ========================

    async fn handle_init(&self, package: CircuitPackage) -> RouterResponse {
        info!(router_id = %self.id, client_id = %package.client_id, token = %package.token,
              "circuit init received");
        sleep(self.tuning.hop_delay).await;

        match package.seal {
            SealKind::Asym => self.install_shared_key(&package).await,
            SealKind::Sym => self.forward_init(&package).await,
        }
    }

    /// Asym branch: the sealed payload grants this hop its circuit key
    async fn install_shared_key(&self, package: &CircuitPackage) -> RouterResponse {
        let layer: LayerRequest =
            match open_then_decode_asym(self.keypair.private_key(), &package.payload) {
                Ok(layer) => layer,
                Err(e) => {
                    warn!(router_id = %self.id, error = %e, "failed to open init payload");
                    return RouterResponse::Error("malformed init payload".to_string());
                }
            };

        let key = match SymKey::from_slice(&layer.payload) {
            Ok(key) => key,
            Err(e) => {
                warn!(router_id = %self.id, error = %e, "init payload is not a circuit key");
                return RouterResponse::Error("malformed circuit key".to_string());
            }
        };

        let fresh = {
            let mut keys = self.shared_keys.write().await;
            let fresh = !keys.contains_key(&package.client_id);
            keys.insert(
                package.client_id.clone(),
                SharedKeyEntry {
                    key: key.clone(),
                    expires_at: Instant::now() + self.tuning.key_ttl,
                },
            );
            fresh
        };

        // A repeated key grant for the same client replaces the key and
        // refreshes the TTL without inflating the circuit count
        if fresh {
            self.active_circuits.fetch_add(1, Ordering::Relaxed);
        }

        debug!(router_id = %self.id, client_id = %package.client_id, fresh, "shared key installed");

        match encode_then_seal_sym(&key, &RelayReply::ok(None)) {
            Ok(sealed) => RouterResponse::Init(CircuitPackageReply {
                payload: Some(sealed),
                token: TraceToken::generate(),
            }),
            Err(e) => {
                warn!(router_id = %self.id, error = %e, "failed to seal init reply");
                RouterResponse::Error("internal seal failure".to_string())
            }
        }
    }

    /// Sym branch: peel one layer and relay the grant to the next hop
    async fn forward_init(&self, package: &CircuitPackage) -> RouterResponse {
        let Some(key) = self.shared_key(&package.client_id).await else {
            return RouterResponse::Error("shared key does not exist in map".to_string());
        };

        let layer: LayerRequest = match open_then_decode_sym(&key, &package.payload) {
            Ok(layer) => layer,
            Err(e) => {
                warn!(router_id = %self.id, error = %e, "failed to peel init layer");
                return RouterResponse::Error("malformed init layer".to_string());
            }
        };

        let Some(next) = layer.next else {
            return RouterResponse::Error("forwarded init without a next hop".to_string());
        };

        let next_package = CircuitPackage {
            client_id: layer.client_id,
            payload: layer.payload,
            seal: next.seal,
            token: TraceToken::generate(),
        };

        info!(router_id = %self.id, client_id = %package.client_id, "circuit init forwarded");

        let reply = match call_router(&next.addr, RouterRequest::Init(next_package)).await {
            Ok(RouterResponse::Init(reply)) => RelayReply::ok(reply.payload),
            Ok(_) | Err(RpcError::Remote(_)) => RelayReply::failed(ERR_SEND_NEXT),
            Err(e) if e.is_connect() => RelayReply::failed(ERR_CONTACT_NEXT),
            Err(_) => RelayReply::failed(ERR_SEND_NEXT),
        };

        self.sealed_init_reply(&key, &reply)
    }

    fn sealed_init_reply(&self, key: &SymKey, reply: &RelayReply) -> RouterResponse {
        match encode_then_seal_sym(key, reply) {
            Ok(sealed) => RouterResponse::Init(CircuitPackageReply {
                payload: Some(sealed),
                token: TraceToken::generate(),
            }),
            Err(e) => {
                warn!(router_id = %self.id, error = %e, "failed to seal init reply");
                RouterResponse::Error("internal seal failure".to_string())
            }
        }
    }

    // ======================== Send ========================

    async fn handle_send(&self, message: OnionMessage) -> RouterResponse {
        info!(router_id = %self.id, client_id = %message.client_id, token = %message.token,
              onion_len = message.onion.len(), "request onion received");

        // A send with no established key is a protocol violation, not a
        // sealed error: there is no key to seal an error with
        let Some(key) = self.shared_key(&message.client_id).await else {
            return RouterResponse::Error("shared key does not exist in map".to_string());
        };

        sleep(self.tuning.hop_delay).await;

        let layer: LayerRequest = match open_then_decode_sym(&key, &message.onion) {
            Ok(layer) => layer,
            Err(e) => {
                warn!(router_id = %self.id, error = %e, "failed to peel request onion");
                return RouterResponse::Error("malformed request onion".to_string());
            }
        };

        let reply = match layer.next {
            Some(next) => self.relay_request(&message.client_id, &next.addr, layer.payload).await,
            None => self.exit_fetch(&message.client_id, &layer.payload).await,
        };

        match encode_then_seal_sym(&key, &reply) {
            Ok(sealed) => {
                debug!(router_id = %self.id, client_id = %message.client_id,
                       response_len = sealed.len(), "response relayed");
                RouterResponse::Send(RouterHttpResponse {
                    response: sealed,
                    token: TraceToken::generate(),
                })
            }
            Err(e) => {
                warn!(router_id = %self.id, error = %e, "failed to seal response onion");
                RouterResponse::Error("internal seal failure".to_string())
            }
        }
    }

    /// Middle of the chain: hand the peeled onion to the next hop
    async fn relay_request(
        &self,
        client_id: &ClientId,
        next_addr: &str,
        peeled_onion: Vec<u8>,
    ) -> RelayReply {
        let onion_message = OnionMessage {
            client_id: client_id.clone(),
            onion: peeled_onion,
            token: TraceToken::generate(),
        };

        info!(router_id = %self.id, client_id = %client_id, "request onion forwarded");

        match call_router(next_addr, RouterRequest::Send(onion_message)).await {
            Ok(RouterResponse::Send(response)) => RelayReply {
                payload: Some(response.response),
                did_succeed: true,
                is_web_server: false,
                err_msg: None,
            },
            Ok(_) | Err(RpcError::Remote(_)) => RelayReply::failed(ERR_SEND_NEXT),
            Err(e) if e.is_connect() => RelayReply::failed(ERR_CONTACT_NEXT),
            Err(_) => RelayReply::failed(ERR_SEND_NEXT),
        }
    }

    /// Exit hop: the innermost payload is the plaintext HTTP tunnel request
    async fn exit_fetch(&self, client_id: &ClientId, payload: &[u8]) -> RelayReply {
        let tunnel: HttpTunnelRequest = match decode(payload) {
            Ok(tunnel) => tunnel,
            Err(e) => {
                warn!(router_id = %self.id, error = %e, "exit payload is not a tunnel request");
                return RelayReply::failed(ERR_CONTACT_WEB);
            }
        };

        info!(router_id = %self.id, client_id = %client_id, url = %tunnel.url, "exit request");

        // GET only; anything else the tunnel carries is ignored
        let response = match reqwest::get(&tunnel.url).await {
            Ok(response) => response,
            Err(e) => {
                warn!(router_id = %self.id, url = %tunnel.url, error = %e, "web server unreachable");
                return RelayReply::failed(ERR_CONTACT_WEB);
            }
        };

        match response.bytes().await {
            Ok(body) => RelayReply::web_server(body.to_vec()),
            Err(e) => {
                warn!(router_id = %self.id, url = %tunnel.url, error = %e, "failed to read body");
                RelayReply::failed(ERR_READ_HTTP)
            }
        }
    }

    // ======================== Teardown ========================

    async fn handle_teardown(&self, package: CircuitPackage) -> RouterResponse {
        info!(router_id = %self.id, client_id = %package.client_id, token = %package.token,
              "circuit teardown received");

        if package.seal != SealKind::Sym {
            return RouterResponse::Error("teardown must use an established key".to_string());
        }

        let Some(key) = self.shared_key(&package.client_id).await else {
            return RouterResponse::Error("shared key does not exist in map".to_string());
        };

        sleep(self.tuning.hop_delay).await;

        let layer: LayerRequest = match open_then_decode_sym(&key, &package.payload) {
            Ok(layer) => layer,
            Err(e) => {
                warn!(router_id = %self.id, error = %e, "failed to peel teardown layer");
                return RouterResponse::Error("malformed teardown layer".to_string());
            }
        };

        let Some(next) = layer.next else {
            // Innermost hop: free state, nothing to seal back
            self.remove_shared_key(&package.client_id).await;
            info!(router_id = %self.id, client_id = %package.client_id, "circuit teardown complete");
            return RouterResponse::Teardown(CircuitPackageReply {
                payload: None,
                token: TraceToken::generate(),
            });
        };

        let next_package = CircuitPackage {
            client_id: layer.client_id,
            payload: layer.payload,
            seal: next.seal,
            token: TraceToken::generate(),
        };

        info!(router_id = %self.id, client_id = %package.client_id, "circuit teardown forwarded");
        let downstream = call_router(&next.addr, RouterRequest::Teardown(next_package)).await;

        // The local entry dies even if the next hop was unreachable; a
        // partition must not leak keys here
        self.remove_shared_key(&package.client_id).await;

        let reply = match downstream {
            Ok(RouterResponse::Teardown(reply)) => RelayReply::ok(reply.payload),
            Ok(_) | Err(RpcError::Remote(_)) => RelayReply::failed(ERR_SEND_NEXT),
            Err(e) if e.is_connect() => RelayReply::failed(ERR_CONTACT_NEXT),
            Err(_) => RelayReply::failed(ERR_SEND_NEXT),
        };

        match encode_then_seal_sym(&key, &reply) {
            Ok(sealed) => RouterResponse::Teardown(CircuitPackageReply {
                payload: Some(sealed),
                token: TraceToken::generate(),
            }),
            Err(e) => {
                warn!(router_id = %self.id, error = %e, "failed to seal teardown reply");
                RouterResponse::Error("internal seal failure".to_string())
            }
        }
    }

    // ======================== Shared-key table ========================

    async fn shared_key(&self, client_id: &ClientId) -> Option<SymKey> {
        self.shared_keys
            .read()
            .await
            .get(client_id)
            .map(|entry| entry.key.clone())
    }

    /// Delete a client's entry; the circuit counter follows the entry
    async fn remove_shared_key(&self, client_id: &ClientId) -> bool {
        let removed = self.shared_keys.write().await.remove(client_id).is_some();
        if removed {
            self.active_circuits.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Delete entries whose TTL has passed, at least once a minute
    async fn sweep_expired_keys(self: Arc<Self>) {
        loop {
            sleep(self.tuning.sweep_interval).await;

            let now = Instant::now();
            let swept = {
                let mut keys = self.shared_keys.write().await;
                let expired: Vec<ClientId> = keys
                    .iter()
                    .filter(|(_, entry)| entry.expires_at <= now)
                    .map(|(client_id, _)| client_id.clone())
                    .collect();

                for client_id in &expired {
                    keys.remove(client_id);
                }
                expired
            };

            if !swept.is_empty() {
                self.active_circuits
                    .fetch_sub(swept.len() as u64, Ordering::Relaxed);
                info!(router_id = %self.id, count = swept.len(), "expired shared keys swept");
            }
        }
    }
}

impl RouterHandle {
    pub fn router(&self) -> Arc<Router> {
        self.router.clone()
    }

    /// Stop serving and join the heartbeat responder
    pub async fn stop(self) {
        for task in &self.tasks {
            task.abort();
        }
        self.detector.stop().await;
    }
}

/// One framed call to another router
async fn call_router(addr: &str, request: RouterRequest) -> std::result::Result<RouterResponse, RpcError> {
    let response: RouterResponse = rpc::call(addr, &request).await?;
    if let RouterResponse::Error(msg) = response {
        return Err(RpcError::Remote(msg));
    }
    Ok(response)
}
