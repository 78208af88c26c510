//! Framed request/response transport for replication.
//!
//! Every message is `{u32 big-endian length}{payload}`. The client holds one
//! connection and issues one exchange at a time; each exchange is bounded by
//! the idle timeout.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use fq_core::error::{Error, Result};

pub async fn write_message(stream: &mut TcpStream, payload: &[u8], max_size: usize) -> Result<()> {
    if payload.len() > max_size {
        return Err(Error::MessageTooLarge {
            size: payload.len(),
            max: max_size,
        });
    }

    stream.write_u32(payload.len() as u32).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn read_message(stream: &mut TcpStream, max_size: usize) -> Result<Vec<u8>> {
    let length = stream.read_u32().await? as usize;
    if length > max_size {
        return Err(Error::Network {
            message: format!("frame of {length} bytes exceeds maximum {max_size}"),
        });
    }

    let mut payload = vec![0u8; length];
    stream.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Replication client side: one framed exchange per call.
pub struct ReplicaClient {
    stream: Mutex<TcpStream>,
    max_message_size: usize,
    idle_timeout: Duration,
}

impl ReplicaClient {
    pub async fn connect(
        address: &str,
        max_message_size: usize,
        idle_timeout: Duration,
    ) -> Result<Self> {
        let stream = tokio::time::timeout(idle_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| Error::Network {
                message: format!("connect to {address} timed out"),
            })??;

        Ok(Self {
            stream: Mutex::new(stream),
            max_message_size,
            idle_timeout,
        })
    }

    pub async fn send(&self, request: &[u8]) -> Result<Vec<u8>> {
        let mut stream = self.stream.lock().await;

        tokio::time::timeout(self.idle_timeout, async {
            write_message(&mut stream, request, self.max_message_size).await?;
            read_message(&mut stream, self.max_message_size).await
        })
        .await
        .map_err(|_| Error::Network {
            message: "replication exchange timed out".to_string(),
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn framed_exchange_round_trips() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request = read_message(&mut stream, 1 << 20).await.unwrap();
            let mut reply = request.clone();
            reply.reverse();
            write_message(&mut stream, &reply, 1 << 20).await.unwrap();
        });

        let client = ReplicaClient::connect(&address, 1 << 20, Duration::from_secs(5))
            .await
            .unwrap();
        let response = client.send(&[1, 2, 3]).await.unwrap();
        assert_eq!(response, vec![3, 2, 1]);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            // Hold the connection open; the client fails before reading.
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let client = ReplicaClient::connect(&address, 4, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(client.send(&[0u8; 16]).await.is_err());
    }
}
