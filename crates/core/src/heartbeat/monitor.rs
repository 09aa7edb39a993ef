use super::wire::{HeartbeatAck, HeartbeatPing};
use super::{CircuitCountUpdate, FailureDetected, MonitorTarget};
use crate::crypto::{decode, encode};
use rand::Rng;
use std::collections::HashMap;
use std::time::{Instant, SystemTime};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use veilnet_common::heartbeat::{INITIAL_RTT, LOSS_THRESHOLD, MIN_RTT};

const MAX_DATAGRAM: usize = 1024;

/// Monitor one target until it fails or the detector shuts down.
///
/// One task per target; state is plain locals. The send window adapts to the
/// measured round trip with a 300 ms floor, and three consecutive silent
/// windows declare the target dead.
pub(super) async fn run_monitor(
    target: MonitorTarget,
    local_bind: String,
    failure_tx: mpsc::Sender<FailureDetected>,
    count_tx: mpsc::Sender<CircuitCountUpdate>,
    mut shutdown: watch::Receiver<bool>,
) {
    let socket = match UdpSocket::bind(&local_bind).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!(target = %target.addr, error = %e, "monitor failed to bind");
            return;
        }
    };
    if let Err(e) = socket.connect(&target.addr).await {
        warn!(target = %target.addr, error = %e, "monitor failed to connect");
        return;
    }

    let epoch_nonce: u64 = rand::thread_rng().gen();
    let mut seq: u64 = 0;
    let mut rtt = INITIAL_RTT;
    let mut failed: u32 = 0;
    let mut in_flight: HashMap<u64, Instant> = HashMap::new();
    let mut buf = [0u8; MAX_DATAGRAM];

    debug!(router_id = %target.router_id, target = %target.addr, epoch_nonce, "monitor started");

    loop {
        if *shutdown.borrow() {
            return;
        }

        let ping = HeartbeatPing {
            epoch_nonce,
            seq_num: seq,
        };
        let current_seq = seq;
        seq += 1;

        let start = Instant::now();
        in_flight.insert(current_seq, start);

        // The scheduling window is the estimate as of this send; the ack that
        // arrives inside it may tighten `rtt` for the next round.
        let window = rtt;
        let deadline = start + window;

        let sent = match encode(&ping) {
            Ok(bytes) => socket.send(&bytes).await.map(|_| ()),
            Err(e) => {
                warn!(error = %e, "failed to encode heartbeat");
                return;
            }
        };

        if let Err(e) = sent {
            // Not a timeout: sleep out the window so we don't hot-loop
            warn!(target = %target.addr, error = %e, "heartbeat send failed");
            sleep_until_deadline(deadline).await;
            failed += 1;
            if missed(&target, failed, &failure_tx).await {
                return;
            }
            continue;
        }

        'await_ack: loop {
            let remaining = deadline.saturating_duration_since(Instant::now());

            let received = tokio::select! {
                _ = shutdown.changed() => return,
                received = timeout(remaining, socket.recv(&mut buf)) => received,
            };

            match received {
                // Window elapsed with no matching ack
                Err(_) => {
                    failed += 1;
                    if missed(&target, failed, &failure_tx).await {
                        return;
                    }
                    break 'await_ack;
                }
                Ok(Err(e)) => {
                    warn!(target = %target.addr, error = %e, "heartbeat read failed");
                    sleep_until_deadline(deadline).await;
                    failed += 1;
                    if missed(&target, failed, &failure_tx).await {
                        return;
                    }
                    break 'await_ack;
                }
                Ok(Ok(len)) => {
                    let ack: HeartbeatAck = match decode(&buf[..len]) {
                        Ok(ack) => ack,
                        Err(_) => continue 'await_ack,
                    };

                    // Stale epoch or unknown/duplicate seq: drop without
                    // touching state
                    if ack.epoch_nonce != epoch_nonce {
                        continue 'await_ack;
                    }
                    let Some(sent_at) = in_flight.remove(&ack.seq_num) else {
                        continue 'await_ack;
                    };

                    failed = 0;
                    rtt = ((rtt + sent_at.elapsed()) / 2).max(MIN_RTT);

                    let _ = count_tx
                        .send(CircuitCountUpdate {
                            router_id: target.router_id,
                            active_count: ack.active_count,
                        })
                        .await;

                    if ack.seq_num == current_seq {
                        break 'await_ack;
                    }
                    // A late ack for an earlier probe; keep waiting for ours
                }
            }
        }

        // Next heartbeat fires one window after the previous send
        let wait = window.saturating_sub(start.elapsed());
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = sleep(wait) => {}
        }
    }
}

async fn sleep_until_deadline(deadline: Instant) {
    sleep(deadline.saturating_duration_since(Instant::now())).await;
}

/// Record a missed window; true once the loss threshold is reached
async fn missed(
    target: &MonitorTarget,
    failed: u32,
    failure_tx: &mpsc::Sender<FailureDetected>,
) -> bool {
    debug!(router_id = %target.router_id, failed, "heartbeat missed");

    if failed >= LOSS_THRESHOLD {
        info!(router_id = %target.router_id, target = %target.addr, "router failure detected");
        let _ = failure_tx
            .send(FailureDetected {
                router_id: target.router_id,
                detected_at: SystemTime::now(),
            })
            .await;
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;
    use std::time::Duration;
    use veilnet_common::RouterId;

    /// Generous ceiling: three 1-second windows plus scheduling slack
    const TEST_EVENT_WAIT: Duration = Duration::from_secs(10);

    async fn spawn_detector_pair(
        active: u64,
    ) -> (
        mpsc::Receiver<FailureDetected>,
        mpsc::Receiver<CircuitCountUpdate>,
        watch::Sender<bool>,
        String,
    ) {
        let responder_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let responder_addr = responder_socket.local_addr().unwrap().to_string();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(super::super::responder::run_responder(
            responder_socket,
            Arc::new(AtomicU64::new(active)),
            shutdown_rx.clone(),
        ));

        let (failure_tx, failure_rx) = mpsc::channel(16);
        let (count_tx, count_rx) = mpsc::channel(16);

        tokio::spawn(run_monitor(
            MonitorTarget {
                router_id: RouterId::new(1),
                addr: responder_addr.clone(),
            },
            "127.0.0.1:0".to_string(),
            failure_tx,
            count_tx,
            shutdown_rx,
        ));

        (failure_rx, count_rx, shutdown_tx, responder_addr)
    }

    #[tokio::test]
    async fn test_monitor_reports_circuit_counts() {
        let (_failures, mut counts, shutdown_tx, _) = spawn_detector_pair(7).await;

        let update = timeout(TEST_EVENT_WAIT, counts.recv())
            .await
            .expect("no count update before deadline")
            .unwrap();

        assert_eq!(update.router_id, RouterId::new(1));
        assert_eq!(update.active_count, 7);

        shutdown_tx.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_monitor_detects_silent_target() {
        // Bind a socket that never answers, then drop to guarantee silence
        let dead = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap().to_string();
        drop(dead);

        let (failure_tx, mut failure_rx) = mpsc::channel(16);
        let (count_tx, _count_rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(run_monitor(
            MonitorTarget {
                router_id: RouterId::new(9),
                addr: dead_addr,
            },
            "127.0.0.1:0".to_string(),
            failure_tx,
            count_tx,
            shutdown_rx,
        ));

        // Three 1s windows (RTT never adapts without acks) plus slack
        let failure = timeout(TEST_EVENT_WAIT, failure_rx.recv())
            .await
            .expect("no failure before deadline")
            .unwrap();

        assert_eq!(failure.router_id, RouterId::new(9));
    }

    #[tokio::test]
    async fn test_healthy_target_never_reported_failed() {
        let (mut failures, mut counts, shutdown_tx, _) = spawn_detector_pair(0).await;

        // Healthy target keeps producing counts and never a failure
        for _ in 0..3 {
            timeout(TEST_EVENT_WAIT, counts.recv())
                .await
                .expect("count stream dried up")
                .unwrap();
        }
        assert!(failures.try_recv().is_err());

        shutdown_tx.send(true).unwrap();
    }
}
