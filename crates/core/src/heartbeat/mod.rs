/// Heartbeat-based failure detection over UDP
///
/// Two cooperating roles:
/// - a responder that answers every well-formed heartbeat with an ack
///   carrying the node's active-circuit count
/// - one monitor task per watched router, adapting its send window to the
///   measured round trip and declaring failure after three silent windows
///
/// Failures and circuit-count updates flow back over bounded channels.
mod monitor;
mod responder;
pub mod wire;

pub use wire::{HeartbeatAck, HeartbeatPing};

use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;
use veilnet_common::{Result, RouterId, VeilNetError};

const EVENT_CHANNEL_CAPACITY: usize = 512;

/// Emitted when a monitored router misses three consecutive acks
#[derive(Debug, Clone)]
pub struct FailureDetected {
    pub router_id: RouterId,
    pub detected_at: SystemTime,
}

/// Emitted for every matching ack; the router's own count is authoritative
#[derive(Debug, Clone, Copy)]
pub struct CircuitCountUpdate {
    pub router_id: RouterId,
    pub active_count: u64,
}

/// A router to watch
#[derive(Debug, Clone)]
pub struct MonitorTarget {
    pub router_id: RouterId,
    pub addr: String,
}

/// Detector configuration
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// UDP address to answer heartbeats on; `None` runs monitors only
    pub ack_listen_addr: Option<String>,

    /// Local address monitor sockets bind to before dialing their target
    pub monitor_bind_addr: String,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            ack_listen_addr: None,
            monitor_bind_addr: "0.0.0.0:0".to_string(),
        }
    }
}

impl DetectorConfig {
    pub fn responder(ack_listen_addr: impl Into<String>) -> Self {
        Self {
            ack_listen_addr: Some(ack_listen_addr.into()),
            ..Self::default()
        }
    }
}

/// Receiving ends of the detector's event streams
pub struct DetectorEvents {
    pub failures: mpsc::Receiver<FailureDetected>,
    pub counts: mpsc::Receiver<CircuitCountUpdate>,
}

/// Heartbeat failure detector
///
/// Owns the responder task (if configured) and one task per monitored
/// router. `stop` signals every worker and joins them.
pub struct FailureDetector {
    active_circuits: Arc<AtomicU64>,
    ack_addr: Option<SocketAddr>,
    monitor_bind_addr: String,
    failure_tx: mpsc::Sender<FailureDetected>,
    count_tx: mpsc::Sender<CircuitCountUpdate>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl FailureDetector {
    /// Start the detector, binding the responder if one is configured
    pub async fn start(config: DetectorConfig) -> Result<(Self, DetectorEvents)> {
        let (failure_tx, failure_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (count_tx, count_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let active_circuits = Arc::new(AtomicU64::new(0));
        let mut tasks = Vec::new();

        let ack_addr = match &config.ack_listen_addr {
            Some(addr) => {
                let socket = UdpSocket::bind(addr).await.map_err(|e| {
                    VeilNetError::network(format!("failed to bind ack socket {}: {}", addr, e))
                })?;
                let bound = socket.local_addr()?;
                debug!(%bound, "heartbeat responder listening");

                tasks.push(tokio::spawn(responder::run_responder(
                    socket,
                    active_circuits.clone(),
                    shutdown_rx.clone(),
                )));

                Some(bound)
            }
            None => None,
        };

        let detector = Self {
            active_circuits,
            ack_addr,
            monitor_bind_addr: config.monitor_bind_addr,
            failure_tx,
            count_tx,
            shutdown_tx,
            shutdown_rx,
            tasks: Mutex::new(tasks),
        };

        Ok((
            detector,
            DetectorEvents {
                failures: failure_rx,
                counts: count_rx,
            },
        ))
    }

    /// Address the responder actually bound, if one was started
    pub fn ack_addr(&self) -> Option<SocketAddr> {
        self.ack_addr
    }

    /// Counter the responder piggybacks on acks; the owning router keeps it
    /// equal to its shared-key table size
    pub fn active_circuits(&self) -> Arc<AtomicU64> {
        self.active_circuits.clone()
    }

    /// Start monitoring a router's heartbeat address
    pub fn monitor_router(&self, target: MonitorTarget) {
        let handle = tokio::spawn(monitor::run_monitor(
            target,
            self.monitor_bind_addr.clone(),
            self.failure_tx.clone(),
            self.count_tx.clone(),
            self.shutdown_rx.clone(),
        ));

        self.tasks.lock().expect("detector task list poisoned").push(handle);
    }

    /// Signal every worker loop and join them
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);

        let handles = {
            let mut tasks = self.tasks.lock().expect("detector task list poisoned");
            std::mem::take(&mut *tasks)
        };

        for handle in handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_detector_end_to_end() {
        // One detector plays the router (responder), another the coordinator
        let (router_side, _router_events) =
            FailureDetector::start(DetectorConfig::responder("127.0.0.1:0"))
                .await
                .unwrap();
        router_side.active_circuits().store(3, Ordering::Relaxed);
        let ack_addr = router_side.ack_addr().unwrap();

        let (coord_side, mut events) = FailureDetector::start(DetectorConfig {
            ack_listen_addr: None,
            monitor_bind_addr: "127.0.0.1:0".to_string(),
        })
        .await
        .unwrap();

        coord_side.monitor_router(MonitorTarget {
            router_id: RouterId::new(2),
            addr: ack_addr.to_string(),
        });

        let update = timeout(Duration::from_secs(10), events.counts.recv())
            .await
            .expect("no count update")
            .unwrap();
        assert_eq!(update.router_id, RouterId::new(2));
        assert_eq!(update.active_count, 3);

        coord_side.stop().await;
        router_side.stop().await;
    }

    #[tokio::test]
    async fn test_stop_joins_workers() {
        let (detector, _events) =
            FailureDetector::start(DetectorConfig::responder("127.0.0.1:0"))
                .await
                .unwrap();

        // Returns promptly even with the responder mid-read
        timeout(Duration::from_secs(5), detector.stop())
            .await
            .expect("stop did not join workers");
    }
}
