use super::wire::{HeartbeatAck, HeartbeatPing};
use crate::crypto::{decode, encode};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, warn};
use veilnet_common::heartbeat::RESPONDER_READ_TIMEOUT;

const MAX_DATAGRAM: usize = 1024;

/// Answer heartbeats until shutdown.
///
/// Blocks on the socket with a 1-second deadline per iteration so the
/// shutdown flag is observed promptly. Malformed datagrams are dropped.
pub(super) async fn run_responder(
    socket: UdpSocket,
    active_circuits: Arc<AtomicU64>,
    shutdown: watch::Receiver<bool>,
) {
    let mut buf = [0u8; MAX_DATAGRAM];

    loop {
        if *shutdown.borrow() {
            debug!("heartbeat responder stopping");
            return;
        }

        let (len, peer) = match timeout(RESPONDER_READ_TIMEOUT, socket.recv_from(&mut buf)).await {
            Err(_) => continue,
            Ok(Err(e)) => {
                warn!(error = %e, "heartbeat responder read failed");
                continue;
            }
            Ok(Ok(received)) => received,
        };

        let ping: HeartbeatPing = match decode(&buf[..len]) {
            Ok(ping) => ping,
            Err(_) => continue,
        };

        let ack = HeartbeatAck {
            epoch_nonce: ping.epoch_nonce,
            seq_num: ping.seq_num,
            active_count: active_circuits.load(Ordering::Relaxed),
        };

        match encode(&ack) {
            Ok(bytes) => {
                if let Err(e) = socket.send_to(&bytes, peer).await {
                    warn!(%peer, error = %e, "failed to send heartbeat ack");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode heartbeat ack"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_responder_answers_with_active_count() {
        let responder_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let responder_addr = responder_socket.local_addr().unwrap();

        let active = Arc::new(AtomicU64::new(4));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(run_responder(responder_socket, active, shutdown_rx));

        let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        probe.connect(responder_addr).await.unwrap();

        let ping = HeartbeatPing {
            epoch_nonce: 42,
            seq_num: 0,
        };
        probe.send(&encode(&ping).unwrap()).await.unwrap();

        let mut buf = [0u8; MAX_DATAGRAM];
        let len = timeout(Duration::from_secs(2), probe.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();

        let ack: HeartbeatAck = decode(&buf[..len]).unwrap();
        assert_eq!(ack.epoch_nonce, 42);
        assert_eq!(ack.seq_num, 0);
        assert_eq!(ack.active_count, 4);
    }

    #[tokio::test]
    async fn test_responder_ignores_garbage() {
        let responder_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let responder_addr = responder_socket.local_addr().unwrap();

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(run_responder(
            responder_socket,
            Arc::new(AtomicU64::new(0)),
            shutdown_rx,
        ));

        let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        probe.connect(responder_addr).await.unwrap();
        probe.send(b"not a heartbeat").await.unwrap();

        // A well-formed ping afterwards is still answered
        let ping = HeartbeatPing {
            epoch_nonce: 1,
            seq_num: 9,
        };
        probe.send(&encode(&ping).unwrap()).await.unwrap();

        let mut buf = [0u8; MAX_DATAGRAM];
        let len = timeout(Duration::from_secs(2), probe.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let ack: HeartbeatAck = decode(&buf[..len]).unwrap();
        assert_eq!(ack.seq_num, 9);
    }
}
