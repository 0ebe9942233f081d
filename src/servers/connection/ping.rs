//! UDP echo service backing the client's latency display.

use tokio::net::UdpSocket;
use tokio::sync::watch;

const PING_BUFFER_SIZE: usize = 512;

/// Echo every datagram back to its sender until shutdown.
pub async fn run_ping_server(socket: UdpSocket, mut shutdown: watch::Receiver<bool>) {
    if let Ok(addr) = socket.local_addr() {
        tracing::info!("[connection] [ping_listening] addr={}", addr);
    }

    let mut buf = [0u8; PING_BUFFER_SIZE];
    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => match result {
                Ok((len, peer)) => {
                    if let Err(e) = socket.send_to(&buf[..len], peer).await {
                        tracing::debug!("[connection] [ping_send_failed] peer={} error={}", peer, e);
                    }
                }
                Err(e) => tracing::debug!("[connection] [ping_recv_error] error={}", e),
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_ping_echo() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_ping_server(server, shutdown_rx));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"\x01\x02\x03\x04", server_addr).await.unwrap();

        let mut buf = [0u8; 16];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"\x01\x02\x03\x04");

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
