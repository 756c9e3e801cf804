//! Line-delimited JSON over TCP: one UTF-8 JSON object per line, strict
//! one-to-one request/response, long-lived connections.

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::SupervisorMsg;

/// Requests above this size indicate a broken client; the buffer is dropped
/// and the connection reset without an answer.
pub const MAX_LINE_BYTES: usize = 20 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerRequest {
    pub identifier: String,
    pub token: String,
    pub action: String,

    #[serde(default)]
    pub payload: Value,
}

pub fn missing_fields_error() -> Value {
    json!({
        "error": "request is missing one or more fields: {token, identifier, action, payload}"
    })
}

/// Serve one connection until the peer hangs up, the line cap is exceeded,
/// or the supervisor goes away.
pub async fn handle_connection(mut stream: TcpStream, tx: mpsc::Sender<SupervisorMsg>) {
    let mut buffer: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 8 * 1024];

    loop {
        let read = match stream.read(&mut chunk).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(error) => {
                debug!(%error, "connection read failed");
                return;
            }
        };

        if buffer.len() + read > MAX_LINE_BYTES {
            warn!("request buffer too big, resetting connection");
            return;
        }

        buffer.extend_from_slice(&chunk[..read]);

        while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=newline).collect();

            let response = dispatch_line(&line[..newline], &tx).await;

            let Some(response) = response else {
                // supervisor is shutting down
                return;
            };

            let mut wire = match serde_json::to_vec(&response) {
                Ok(wire) => wire,
                Err(error) => {
                    warn!(%error, "failed to encode response");
                    return;
                }
            };
            wire.push(b'\n');

            if let Err(error) = stream.write_all(&wire).await {
                debug!(%error, "connection write failed");
                return;
            }
        }
    }
}

async fn dispatch_line(line: &[u8], tx: &mpsc::Sender<SupervisorMsg>) -> Option<Value> {
    let parsed: Result<BrokerRequest, _> = serde_json::from_slice(line);

    let request = match parsed {
        Ok(request) => request,
        Err(error) => {
            debug!(%error, "undecodable request");
            return Some(missing_fields_error());
        }
    };

    let (reply_tx, reply_rx) = oneshot::channel();

    tx.send(SupervisorMsg::Request {
        request,
        reply: reply_tx,
    })
    .await
    .ok()?;

    reply_rx.await.ok()
}
