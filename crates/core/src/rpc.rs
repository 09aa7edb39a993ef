/// Framed RPC transport
///
/// Every call is one length-prefixed frame each way over a fresh TCP
/// connection: a 4-byte little-endian length followed by the codec bytes of
/// the request or response. Servers accept connections in a loop and answer
/// frames until the peer hangs up, so a caller may also hold a connection
/// open and pipeline calls.
use crate::crypto::{decode, encode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};
use veilnet_common::rpc::MAX_FRAME_SIZE;

/// RPC transport errors
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Connection closed before a response arrived")]
    ConnectionClosed,

    #[error("Remote error: {0}")]
    Remote(String),
}

impl RpcError {
    /// True when the peer could not even be dialed, as opposed to a failure
    /// after the connection was up
    pub fn is_connect(&self) -> bool {
        matches!(self, Self::Connect { .. })
    }
}

/// Write one framed value to a stream
pub async fn send_frame<T: Serialize>(stream: &mut TcpStream, value: &T) -> Result<(), RpcError> {
    let bytes = encode(value).map_err(|e| RpcError::Codec(e.to_string()))?;

    if bytes.len() > MAX_FRAME_SIZE {
        return Err(RpcError::FrameTooLarge(bytes.len()));
    }

    let len = bytes.len() as u32;
    stream.write_all(&len.to_le_bytes()).await?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;

    Ok(())
}

/// Read one framed value from a stream; `Ok(None)` on clean EOF
pub async fn recv_frame<T: DeserializeOwned>(
    stream: &mut TcpStream,
) -> Result<Option<T>, RpcError> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(RpcError::FrameTooLarge(len));
    }

    let mut bytes = vec![0u8; len];
    stream.read_exact(&mut bytes).await?;

    let value = decode(&bytes).map_err(|e| RpcError::Codec(e.to_string()))?;
    Ok(Some(value))
}

/// Dial `addr`, send one request, and wait for the response
pub async fn call<Req, Resp>(addr: &str, request: &Req) -> Result<Resp, RpcError>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    let mut stream = TcpStream::connect(addr).await.map_err(|e| RpcError::Connect {
        addr: addr.to_string(),
        source: e,
    })?;

    send_frame(&mut stream, request).await?;

    recv_frame(&mut stream).await?.ok_or(RpcError::ConnectionClosed)
}

/// Serve framed requests on a listener.
///
/// One task per connection; each connection answers requests until EOF. The
/// handler runs per request, so a slow handler (e.g. one blocked on the
/// coordinator's readiness gate) only stalls its own connection.
pub async fn serve<Req, Resp, H, Fut>(listener: TcpListener, handler: H) -> Result<(), RpcError>
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + Sync + 'static,
    H: Fn(Req) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Resp> + Send,
{
    loop {
        let (mut stream, peer) = listener.accept().await?;
        let handler = handler.clone();

        tokio::spawn(async move {
            debug!(%peer, "accepted rpc connection");

            loop {
                let request: Req = match recv_frame(&mut stream).await {
                    Ok(Some(request)) => request,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(%peer, error = %e, "failed to read rpc frame");
                        break;
                    }
                };

                let response = handler(request).await;

                if let Err(e) = send_frame(&mut stream, &response).await {
                    warn!(%peer, error = %e, "failed to write rpc response");
                    break;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct EchoRequest {
        text: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct EchoResponse {
        text: String,
        length: usize,
    }

    async fn spawn_echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(serve(listener, |request: EchoRequest| async move {
            EchoResponse {
                length: request.text.len(),
                text: request.text,
            }
        }));

        addr
    }

    #[tokio::test]
    async fn test_call_roundtrip() {
        let addr = spawn_echo_server().await;

        let response: EchoResponse = call(
            &addr,
            &EchoRequest {
                text: "hello".to_string(),
            },
        )
        .await
        .unwrap();

        assert_eq!(response.text, "hello");
        assert_eq!(response.length, 5);
    }

    #[tokio::test]
    async fn test_sequential_calls_on_one_server() {
        let addr = spawn_echo_server().await;

        for i in 0..3 {
            let text = format!("msg-{}", i);
            let response: EchoResponse = call(&addr, &EchoRequest { text: text.clone() })
                .await
                .unwrap();
            assert_eq!(response.text, text);
        }
    }

    #[tokio::test]
    async fn test_connect_error_is_distinguishable() {
        // Port 1 on loopback should refuse immediately
        let err = call::<_, EchoResponse>(
            "127.0.0.1:1",
            &EchoRequest {
                text: String::new(),
            },
        )
        .await
        .unwrap_err();

        assert!(err.is_connect());
    }

    #[tokio::test]
    async fn test_pipelined_frames_on_one_connection() {
        let addr = spawn_echo_server().await;
        let mut stream = TcpStream::connect(&addr).await.unwrap();

        for i in 0..2 {
            let request = EchoRequest {
                text: format!("frame-{}", i),
            };
            send_frame(&mut stream, &request).await.unwrap();
            let response: EchoResponse = recv_frame(&mut stream).await.unwrap().unwrap();
            assert_eq!(response.text, request.text);
        }
    }
}
