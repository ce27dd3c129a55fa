/// Best-effort remote pinning.
///
/// Re-pins CIDs on a second IPFS-API-compatible node for redundancy.
/// Failures are logged and swallowed; the pipeline never blocks on the
/// pinner.
use reqwest::Client;
use tracing::warn;

pub struct RemotePinner {
    client: Client,
    api_url: Option<String>,
}

impl RemotePinner {
    pub fn new(api_url: Option<String>) -> Self {
        Self {
            client: Client::new(),
            api_url,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.api_url.is_some()
    }

    /// Ask the remote node to pin a CID. Never fails.
    pub async fn pin(&self, cid: &str) {
        let Some(url) = &self.api_url else {
            return;
        };

        let result = self
            .client
            .post(format!("{url}/api/v0/pin/add"))
            .query(&[("arg", cid)])
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => {
                warn!(cid, status = %resp.status(), "remote pin refused");
            }
            Err(e) => {
                warn!(cid, error = %e, "remote pin failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unconfigured_pinner_is_a_noop() {
        let pinner = RemotePinner::new(None);
        assert!(!pinner.is_configured());
        pinner.pin("bafy123").await;
    }
}
