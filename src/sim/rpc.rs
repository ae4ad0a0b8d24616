//! Line-delimited JSON RPC to the simulator server.
//!
//! Every request gets exactly one response carrying the same id; requests are
//! issued strictly serially, which is what the synchronous stepping model
//! requires anyway. All round-trips are bounded by the session RPC timeout.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::error::HarnessError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct RpcTransport {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    timeout: Duration,
    next_id: u64,
}

impl RpcTransport {
    /// Opens a TCP connection, bounded by `timeout`.
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, HarnessError> {
        let addr = format!("{host}:{port}");
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| HarnessError::TimedOut {
                timeout,
                waiting_for: format!("tcp connect to {addr}"),
            })??;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read),
            writer: write,
            timeout,
            next_id: 1,
        })
    }

    /// One request/response round trip. Server-side failures come back as
    /// `ok: false` and map to [`HarnessError::Protocol`].
    pub async fn call(
        &mut self,
        kind: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, HarnessError> {
        let id = self.next_id;
        self.next_id += 1;

        let request = RpcRequest {
            id,
            kind: kind.to_string(),
            payload,
        };
        let mut line = serde_json::to_string(&request)
            .map_err(|e| HarnessError::Protocol(format!("encoding {kind}: {e}")))?;
        line.push('\n');

        let response = tokio::time::timeout(self.timeout, async {
            self.writer.write_all(line.as_bytes()).await?;
            self.writer.flush().await?;

            let mut buf = String::new();
            let n = self.reader.read_line(&mut buf).await?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "server closed the connection",
                ));
            }
            Ok(buf)
        })
        .await
        .map_err(|_| HarnessError::TimedOut {
            timeout: self.timeout,
            waiting_for: format!("response to '{kind}'"),
        })??;

        let response: RpcResponse = serde_json::from_str(response.trim_end())
            .map_err(|e| HarnessError::Protocol(format!("malformed response to {kind}: {e}")))?;

        if response.id != id {
            return Err(HarnessError::Protocol(format!(
                "response id {} does not match request id {id}",
                response.id
            )));
        }
        if !response.ok {
            return Err(HarnessError::Protocol(
                response
                    .error
                    .unwrap_or_else(|| format!("'{kind}' rejected without detail")),
            ));
        }
        Ok(response.payload.unwrap_or(serde_json::Value::Null))
    }
}
