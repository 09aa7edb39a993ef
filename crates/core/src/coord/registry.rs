use crate::protocol::RingRouter;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use veilnet_common::circuit::RING_LEN;
use veilnet_common::RouterId;

/// One registered router as the coordinator sees it
#[derive(Debug, Clone)]
pub struct RouterEntry {
    pub router_id: RouterId,

    /// PKCS#1 DER public key; the identity registration is keyed on
    pub public_key: Vec<u8>,

    pub client_listen_addr: String,
    pub coord_listen_addr: String,
    pub ocheck_addr: String,

    /// Last count reported over the heartbeat channel
    pub active_chain_count: u64,
}

/// Registry errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("router already exists in directory")]
    DuplicateKey,
}

/// The coordinator's router directory.
///
/// Mutations and ring selection both happen under the owner's lock; the RNG
/// lives here so selection randomness is seeded once per process, not per
/// call.
pub struct Registry {
    routers: Vec<RouterEntry>,
    rng: StdRng,
}

impl Registry {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    pub fn with_rng(rng: StdRng) -> Self {
        Self {
            routers: Vec::new(),
            rng,
        }
    }

    /// Add a router; identity is the public key, so a re-join with a cached
    /// key is rejected no matter what id it claims
    pub fn register(&mut self, entry: RouterEntry) -> Result<(), RegistryError> {
        if self
            .routers
            .iter()
            .any(|existing| existing.public_key == entry.public_key)
        {
            return Err(RegistryError::DuplicateKey);
        }

        self.routers.push(entry);
        Ok(())
    }

    /// Drop a router after a failure; true if it was present
    pub fn remove(&mut self, router_id: RouterId) -> bool {
        let before = self.routers.len();
        self.routers.retain(|entry| entry.router_id != router_id);
        self.routers.len() != before
    }

    /// Apply a reported count; `Some((old, new))` when it actually changed
    pub fn update_count(&mut self, router_id: RouterId, count: u64) -> Option<(u64, u64)> {
        let entry = self
            .routers
            .iter_mut()
            .find(|entry| entry.router_id == router_id)?;

        if entry.active_chain_count == count {
            return None;
        }

        let old = entry.active_chain_count;
        entry.active_chain_count = count;
        Some((old, count))
    }

    pub fn len(&self) -> usize {
        self.routers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routers.is_empty()
    }

    pub fn router_ids(&self) -> Vec<RouterId> {
        self.routers.iter().map(|entry| entry.router_id).collect()
    }

    pub fn counts(&self) -> Vec<(RouterId, u64)> {
        self.routers
            .iter()
            .map(|entry| (entry.router_id, entry.active_chain_count))
            .collect()
    }

    /// Pick `[guard, middle, exit]` for a new circuit.
    ///
    /// Shuffle first so routers with equal load are equally likely, then a
    /// stable sort by active chain count keeps the shuffle's order among
    /// ties. The three least-busy routers win.
    pub fn select_ring(&mut self) -> Option<Vec<RingRouter>> {
        if self.routers.len() < RING_LEN {
            return None;
        }

        self.routers.shuffle(&mut self.rng);
        self.routers
            .sort_by_key(|entry| entry.active_chain_count);

        Some(
            self.routers[..RING_LEN]
                .iter()
                .map(|entry| RingRouter {
                    router_id: entry.router_id,
                    public_key: entry.public_key.clone(),
                    addr: entry.client_listen_addr.clone(),
                })
                .collect(),
        )
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
