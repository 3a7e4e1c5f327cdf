//! Stateless request/response client for the rendezvous directory: one
//! fresh TCP connection per call, one JSON line out, one JSON line back.

use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::RendezvousError;
use crate::table::DiscoveredPeer;

const RENDEZVOUS_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_REGISTER_TTL: u32 = 7200;

pub struct RendezvousClient {
    host: String,
    port: u16,
}

#[derive(Debug, Clone)]
pub struct RegisterResult {
    pub public_ip: String,
}

impl RendezvousClient {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        RendezvousClient {
            host: host.into(),
            port,
        }
    }

    pub async fn register(
        &self,
        namespace: &str,
        name: &str,
        port: u16,
    ) -> Result<RegisterResult, RendezvousError> {
        self.register_with_ttl(namespace, name, port, DEFAULT_REGISTER_TTL)
            .await
    }

    pub async fn register_with_ttl(
        &self,
        namespace: &str,
        name: &str,
        port: u16,
        ttl: u32,
    ) -> Result<RegisterResult, RendezvousError> {
        let request = json!({
            "type": "REGISTER",
            "namespace": namespace,
            "name": name,
            "port": port,
            "ttl": ttl,
        });
        let response = self.send_command(&request).await?;
        if response.get("status").and_then(|v| v.as_str()) == Some("OK") {
            let public_ip = response
                .get("ip")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string();
            Ok(RegisterResult { public_ip })
        } else {
            Err(RendezvousError::ErrorStatus(response.to_string()))
        }
    }

    pub async fn discover(
        &self,
        namespace: Option<&str>,
    ) -> Result<Vec<DiscoveredPeer>, RendezvousError> {
        let mut request = json!({"type": "DISCOVER"});
        if let Some(ns) = namespace {
            request["namespace"] = json!(ns);
        }

        let response = self.send_command(&request).await?;
        if response.get("status").and_then(|v| v.as_str()) != Some("OK") {
            return Err(RendezvousError::ErrorStatus(response.to_string()));
        }

        let peers = response
            .get("peers")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let mut out = Vec::with_capacity(peers.len());
        for p in peers {
            out.push(DiscoveredPeer {
                name: p.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                namespace: p
                    .get("namespace")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                ip: p.get("ip").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                port: p.get("port").and_then(|v| v.as_u64()).unwrap_or(0) as u16,
            });
        }
        Ok(out)
    }

    pub async fn unregister(&self, namespace: &str, name: &str, port: u16) -> Result<(), RendezvousError> {
        let request = json!({
            "type": "UNREGISTER",
            "namespace": namespace,
            "name": name,
            "port": port,
        });
        let response = self.send_command(&request).await?;
        if response.get("status").and_then(|v| v.as_str()) == Some("OK") {
            Ok(())
        } else {
            Err(RendezvousError::ErrorStatus(response.to_string()))
        }
    }

    async fn send_command(&self, request: &serde_json::Value) -> Result<serde_json::Value, RendezvousError> {
        let fut = async {
            let mut stream = TcpStream::connect((self.host.as_str(), self.port))
                .await
                .map_err(RendezvousError::Connect)?;

            let line = format!("{}\n", serde_json::to_string(request).expect("request serializes"));
            stream.write_all(line.as_bytes()).await?;

            let mut reader = BufReader::new(stream);
            let mut response_line = String::new();
            reader.read_line(&mut response_line).await?;

            let trimmed = response_line.trim();
            if trimmed.is_empty() {
                return Err(RendezvousError::Malformed("empty response".to_string()));
            }
            serde_json::from_str(trimmed).map_err(|e| RendezvousError::Malformed(e.to_string()))
        };

        timeout(RENDEZVOUS_TIMEOUT, fut)
            .await
            .map_err(|_| RendezvousError::Timeout)?
    }
}
