/// IPFS blob store via the HTTP API.
///
/// Uses the Kubo HTTP API (typically localhost:5001). Adds are pinned
/// immediately so a GC pass on the node cannot drop artifacts the
/// gateway is still responsible for.
use async_trait::async_trait;
use reqwest::multipart;
use reqwest::Client;
use serde::Deserialize;

use super::BlobStore;
use crate::error::{GatewayError, Result};

#[derive(Debug, Clone)]
pub struct IpfsConfig {
    /// IPFS API endpoint (e.g., "http://localhost:5001").
    pub api_url: String,
}

pub struct IpfsStore {
    client: Client,
    config: IpfsConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IpfsAddResponse {
    hash: String,
    #[allow(dead_code)]
    size: String,
}

impl IpfsStore {
    pub fn new(config: IpfsConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }
}

#[async_trait]
impl BlobStore for IpfsStore {
    fn name(&self) -> &str {
        "IPFS"
    }

    async fn put(&self, file_name: &str, data: &[u8]) -> Result<String> {
        let part = multipart::Part::bytes(data.to_vec()).file_name(file_name.to_string());
        let form = multipart::Form::new().part("file", part);

        let resp = self
            .client
            .post(format!("{}/api/v0/add", self.config.api_url))
            .query(&[("pin", "true"), ("cid-version", "1")])
            .multipart(form)
            .send()
            .await
            .map_err(|e| GatewayError::Storage(format!("IPFS add: {e}")))?;

        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Storage(format!("IPFS add failed: {body}")));
        }

        let add_resp: IpfsAddResponse = resp
            .json()
            .await
            .map_err(|e| GatewayError::Serialization(format!("IPFS add response: {e}")))?;

        Ok(add_resp.hash)
    }

    async fn get(&self, cid: &str) -> Result<Vec<u8>> {
        let resp = self
            .client
            .post(format!("{}/api/v0/cat", self.config.api_url))
            .query(&[("arg", cid)])
            .send()
            .await
            .map_err(|e| GatewayError::Storage(format!("IPFS cat: {e}")))?;

        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Storage(format!("IPFS cat failed: {body}")));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| GatewayError::Storage(format!("IPFS cat body: {e}")))?;

        Ok(bytes.to_vec())
    }

    async fn pin(&self, cid: &str) -> Result<()> {
        let resp = self
            .client
            .post(format!("{}/api/v0/pin/add", self.config.api_url))
            .query(&[("arg", cid)])
            .send()
            .await
            .map_err(|e| GatewayError::Storage(format!("IPFS pin: {e}")))?;

        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Storage(format!("IPFS pin failed: {body}")));
        }

        Ok(())
    }

    async fn unpin(&self, cid: &str) -> Result<()> {
        // Don't error if not pinned
        let _ = self
            .client
            .post(format!("{}/api/v0/pin/rm", self.config.api_url))
            .query(&[("arg", cid)])
            .send()
            .await;

        Ok(())
    }
}
