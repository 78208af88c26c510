//! Client side of the text protocol.
//!
//! `TcpClient` does newline-framed request/response exchanges with a
//! deadline; `FqClient` layers the command vocabulary and `ok|`/`err|`
//! parsing on top. The interactive CLI uses both.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use fq_core::command::{
    DEL_COMMAND, GET_COMMAND, INCR_COMMAND, MDEL_COMMAND, MSG_SIZE_COMMAND, WATCH_COMMAND,
};
use fq_core::error::{Error, Result};

pub struct TcpClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    max_message_size: usize,
    idle_timeout: Duration,
}

impl TcpClient {
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

        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            max_message_size,
            idle_timeout,
        })
    }

    /// One request/response exchange. The request must be a single line.
    pub async fn send(&mut self, request: &str) -> Result<String> {
        if request.len() > self.max_message_size {
            return Err(Error::MessageTooLarge {
                size: request.len(),
                max: self.max_message_size,
            });
        }

        tokio::time::timeout(self.idle_timeout, self.exchange(request))
            .await
            .map_err(|_| Error::Network {
                message: "request timed out".to_string(),
            })?
    }

    async fn exchange(&mut self, request: &str) -> Result<String> {
        self.writer.write_all(request.as_bytes()).await?;
        if !request.ends_with('\n') {
            self.writer.write_all(b"\n").await?;
        }
        self.writer.flush().await?;

        let mut response = String::new();
        let read = self.reader.read_line(&mut response).await?;
        if read == 0 {
            return Err(Error::Network {
                message: "connection closed by server".to_string(),
            });
        }

        Ok(response.trim_end_matches(['\r', '\n']).to_string())
    }
}

/// Parsed `status|payload` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok(String),
    Err(String),
}

pub fn parse_response(raw: &str) -> Result<Response> {
    let Some((status, payload)) = raw.split_once('|') else {
        return Err(Error::Network {
            message: format!("malformed response {raw:?}"),
        });
    };

    match status {
        "ok" => Ok(Response::Ok(payload.to_string())),
        "err" => Ok(Response::Err(payload.to_string())),
        other => Err(Error::Network {
            message: format!("unknown response status {other:?}"),
        }),
    }
}

/// High-level command client.
pub struct FqClient {
    client: TcpClient,
}

impl FqClient {
    pub async fn connect(
        address: &str,
        max_message_size: usize,
        idle_timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            client: TcpClient::connect(address, max_message_size, idle_timeout).await?,
        })
    }

    pub async fn incr(&mut self, key: &str, batch_size: u32) -> Result<u64> {
        let request = format!("{INCR_COMMAND} {key} {batch_size}");
        self.value_command(&request).await
    }

    pub async fn get(&mut self, key: &str, batch_size: u32) -> Result<u64> {
        let request = format!("{GET_COMMAND} {key} {batch_size}");
        self.value_command(&request).await
    }

    pub async fn watch(&mut self, key: &str, batch_size: u32) -> Result<u64> {
        let request = format!("{WATCH_COMMAND} {key} {batch_size}");
        self.value_command(&request).await
    }

    pub async fn msg_size(&mut self) -> Result<u64> {
        self.value_command(MSG_SIZE_COMMAND).await
    }

    pub async fn del(&mut self, key: &str, batch_size: u32) -> Result<bool> {
        let request = format!("{DEL_COMMAND} {key} {batch_size}");
        let value = self.value_command(&request).await?;
        Ok(value == 1)
    }

    pub async fn mdel(&mut self, keys: &[(String, u32)]) -> Result<Vec<bool>> {
        let mut request = String::from(MDEL_COMMAND);
        for (key, batch_size) in keys {
            request.push(' ');
            request.push_str(key);
            request.push(' ');
            request.push_str(&batch_size.to_string());
        }

        let raw = self.client.send(&request).await?;
        match parse_response(&raw)? {
            Response::Ok(payload) => Ok(payload
                .split(';')
                .filter(|s| !s.is_empty())
                .map(|s| s == "1")
                .collect()),
            Response::Err(message) => Err(Error::Network { message }),
        }
    }

    async fn value_command(&mut self, request: &str) -> Result<u64> {
        let raw = self.client.send(request).await?;
        match parse_response(&raw)? {
            Response::Ok(payload) => payload.parse().map_err(|_| Error::Network {
                message: format!("non-numeric payload {payload:?}"),
            }),
            Response::Err(message) => Err(Error::Network { message }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ok_and_err_responses() {
        assert_eq!(parse_response("ok|42").unwrap(), Response::Ok("42".into()));
        assert_eq!(
            parse_response("err|invalid command").unwrap(),
            Response::Err("invalid command".into())
        );
        assert!(parse_response("no separator").is_err());
        assert!(parse_response("warn|odd").is_err());
    }

    #[test]
    fn parses_payload_with_separators() {
        assert_eq!(
            parse_response("ok|1;0;1").unwrap(),
            Response::Ok("1;0;1".into())
        );
    }
}
