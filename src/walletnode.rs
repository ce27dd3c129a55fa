/// WalletNode REST client.
///
/// WalletNode fronts the supernode network. Each ticket family lives under
/// its own path prefix and the upload response names its fields slightly
/// differently per family, so both are captured on [`WnService`].
///
/// Downloads arrive as a JSON envelope with a base64 `file` field and are
/// authorized with the gateway PastelID passphrase.
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::multipart;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{GatewayError, Result};

/// Ticket family served by WalletNode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WnService {
    Cascade,
    Sense,
    Nft,
    Collection,
}

impl WnService {
    /// URL path prefix for this family.
    pub fn path_prefix(&self) -> &'static str {
        match self {
            WnService::Cascade => "openapi/cascade",
            WnService::Sense => "openapi/sense",
            WnService::Nft => "nfts",
            WnService::Collection => "collection",
        }
    }

    pub fn upload_cmd(&self) -> &'static str {
        match self {
            WnService::Cascade | WnService::Sense => "upload",
            WnService::Nft => "register/upload",
            WnService::Collection => "register",
        }
    }

    /// Name of the file-id field in the upload response.
    pub fn upload_id_field(&self) -> &'static str {
        match self {
            WnService::Cascade => "file_id",
            WnService::Sense | WnService::Nft => "image_id",
            WnService::Collection => "task_id",
        }
    }

    /// Name of the fee field in the upload response.
    pub fn upload_fee_field(&self) -> &'static str {
        match self {
            WnService::Cascade | WnService::Sense => "estimated_fee",
            WnService::Nft => "estimated_fee",
            WnService::Collection => "",
        }
    }

    /// Start command for an uploaded file. NFT registration posts the
    /// whole form to `register`; cascade and sense reference the upload.
    pub fn start_cmd(&self, wn_file_id: &str) -> String {
        match self {
            WnService::Nft | WnService::Collection => "register".to_string(),
            WnService::Cascade | WnService::Sense => format!("start/{wn_file_id}"),
        }
    }

    /// Ticket verb used for `tickets find` activation lookups.
    pub fn act_ticket_verb(&self) -> &'static str {
        match self {
            WnService::Nft => "act",
            WnService::Cascade | WnService::Sense => "action-act",
            WnService::Collection => "collection-act",
        }
    }
}

/// One step of a WalletNode task history.
#[derive(Debug, Clone, Deserialize)]
pub struct WnHistoryEntry {
    pub status: String,
    #[serde(default)]
    pub details: Option<Value>,
}

/// Upload response: backend file id plus the quoted fee.
#[derive(Debug, Clone)]
pub struct WnUpload {
    pub wn_file_id: String,
    pub estimated_fee: i64,
}

#[derive(Clone)]
pub struct WalletNodeClient {
    client: Client,
    base_url: String,
}

/// Pull the id and fee fields out of an upload response.
fn parse_upload_response(service: WnService, body: &Value) -> Result<WnUpload> {
    let id_field = service.upload_id_field();
    let wn_file_id = body
        .get(id_field)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| GatewayError::WalletNode {
            status: 200,
            body: format!("field '{id_field}' not found"),
            retryable: false,
        })?;

    let fee_field = service.upload_fee_field();
    let estimated_fee = body
        .get(fee_field)
        .and_then(Value::as_i64)
        .or_else(|| body.get(fee_field).and_then(Value::as_f64).map(|f| f as i64))
        .ok_or_else(|| GatewayError::WalletNode {
            status: 200,
            body: format!("field '{fee_field}' not found"),
            retryable: false,
        })?;

    Ok(WnUpload {
        wn_file_id,
        estimated_fee,
    })
}

/// Decode the base64 `file` field of a download envelope.
fn decode_download_envelope(body: &Value) -> Result<Vec<u8>> {
    let encoded = body
        .get("file")
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::WalletNode {
            status: 200,
            body: "field 'file' not found".into(),
            retryable: false,
        })?;
    BASE64
        .decode(encoded)
        .map_err(|e| GatewayError::Serialization(format!("bad download payload: {e}")))
}

impl WalletNodeClient {
    pub fn new(base_url: String) -> Self {
        Self {
            client: Client::new(),
            base_url,
        }
    }

    fn url(&self, service: WnService, cmd: &str) -> String {
        format!("{}/{}/{}", self.base_url, service.path_prefix(), cmd)
    }

    async fn check(&self, resp: reqwest::Response, what: &str) -> Result<Value> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::WalletNode {
                status: status.as_u16(),
                body: format!("{what}: {body}"),
                retryable: status.is_server_error(),
            });
        }
        resp.json().await.map_err(|e| GatewayError::WalletNode {
            status: status.as_u16(),
            body: format!("{what}: bad json: {e}"),
            retryable: false,
        })
    }

    /// Upload a file, returning the backend id and the quoted fee.
    pub async fn upload(
        &self,
        service: WnService,
        file_name: &str,
        content_type: &str,
        data: Vec<u8>,
    ) -> Result<WnUpload> {
        let part = multipart::Part::bytes(data)
            .file_name(file_name.to_string())
            .mime_str(content_type)
            .map_err(|e| GatewayError::WalletNode {
                status: 0,
                body: format!("bad content type: {e}"),
                retryable: false,
            })?;
        let form = multipart::Form::new().part("file", part);

        debug!(service = service.path_prefix(), file_name, "wn upload");

        let resp = self
            .client
            .post(self.url(service, service.upload_cmd()))
            .multipart(form)
            .send()
            .await
            .map_err(|e| GatewayError::WalletNode {
                status: 0,
                body: e.to_string(),
                retryable: true,
            })?;

        let body = self.check(resp, "upload").await?;
        parse_upload_response(service, &body)
    }

    /// Start registration of an uploaded file. `form` is the family
    /// specific request body; the passphrase authorizes ticket signing.
    pub async fn start_task(
        &self,
        service: WnService,
        wn_file_id: &str,
        form: Value,
        passphrase: &str,
    ) -> Result<String> {
        let cmd = service.start_cmd(wn_file_id);

        debug!(service = service.path_prefix(), cmd, "wn start");

        let resp = self
            .client
            .post(self.url(service, &cmd))
            .header("Authorization", passphrase)
            .json(&form)
            .send()
            .await
            .map_err(|e| GatewayError::WalletNode {
                status: 0,
                body: e.to_string(),
                retryable: true,
            })?;

        let body = self.check(resp, "start").await?;
        body.get("task_id")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| GatewayError::WalletNode {
                status: 200,
                body: "field 'task_id' not found".into(),
                retryable: false,
            })
    }

    /// Status history of a running WalletNode task.
    pub async fn history(
        &self,
        service: WnService,
        wn_task_id: &str,
    ) -> Result<Vec<WnHistoryEntry>> {
        let resp = self
            .client
            .get(self.url(service, &format!("{wn_task_id}/history")))
            .send()
            .await
            .map_err(|e| GatewayError::WalletNode {
                status: 0,
                body: e.to_string(),
                retryable: true,
            })?;

        let body = self.check(resp, "history").await?;
        serde_json::from_value(body)
            .map_err(|e| GatewayError::Serialization(format!("bad history payload: {e}")))
    }

    /// Download a registered artifact by its registration txid.
    ///
    /// Returns None when WalletNode cannot serve the file; the caller
    /// decides whether that is fatal.
    pub async fn download(
        &self,
        service: WnService,
        reg_ticket_txid: &str,
        pastel_id: &str,
        passphrase: &str,
    ) -> Result<Option<Vec<u8>>> {
        let cmd = format!("download?pid={pastel_id}&txid={reg_ticket_txid}");
        let resp = self
            .client
            .get(self.url(service, &cmd))
            .header("Authorization", passphrase)
            .send()
            .await
            .map_err(|e| GatewayError::WalletNode {
                status: 0,
                body: e.to_string(),
                retryable: true,
            })?;

        if !resp.status().is_success() {
            debug!(reg_ticket_txid, status = %resp.status(), "wn download miss");
            return Ok(None);
        }

        let body: Value = resp.json().await.map_err(|e| GatewayError::WalletNode {
            status: 200,
            body: format!("download: bad json: {e}"),
            retryable: false,
        })?;

        Ok(Some(decode_download_envelope(&body)?))
    }

    /// Fetch the duplicate-detection result file for a registered sense
    /// or NFT ticket.
    pub async fn dd_result(
        &self,
        service: WnService,
        reg_ticket_txid: &str,
        pastel_id: &str,
        passphrase: &str,
    ) -> Result<Option<Vec<u8>>> {
        let cmd = format!("get_dd_result_file?pid={pastel_id}&txid={reg_ticket_txid}");
        let resp = self
            .client
            .get(self.url(service, &cmd))
            .header("Authorization", passphrase)
            .send()
            .await
            .map_err(|e| GatewayError::WalletNode {
                status: 0,
                body: e.to_string(),
                retryable: true,
            })?;

        if !resp.status().is_success() {
            return Ok(None);
        }

        let body: Value = resp.json().await.map_err(|e| GatewayError::WalletNode {
            status: 200,
            body: format!("dd_result: bad json: {e}"),
            retryable: false,
        })?;

        Ok(Some(decode_download_envelope(&body)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_service_paths() {
        assert_eq!(WnService::Cascade.path_prefix(), "openapi/cascade");
        assert_eq!(WnService::Sense.path_prefix(), "openapi/sense");
        assert_eq!(WnService::Nft.path_prefix(), "nfts");
        assert_eq!(WnService::Collection.path_prefix(), "collection");
    }

    #[test]
    fn test_start_cmd_per_service() {
        assert_eq!(WnService::Cascade.start_cmd("abc"), "start/abc");
        assert_eq!(WnService::Sense.start_cmd("abc"), "start/abc");
        assert_eq!(WnService::Nft.start_cmd("abc"), "register");
        assert_eq!(WnService::Collection.start_cmd(""), "register");
    }

    #[test]
    fn test_parse_upload_response_cascade() {
        let body = json!({"file_id": "f1", "estimated_fee": 500});
        let upload = parse_upload_response(WnService::Cascade, &body).unwrap();
        assert_eq!(upload.wn_file_id, "f1");
        assert_eq!(upload.estimated_fee, 500);
    }

    #[test]
    fn test_parse_upload_response_nft_field_names() {
        let body = json!({"image_id": "img9", "estimated_fee": 120});
        let upload = parse_upload_response(WnService::Nft, &body).unwrap();
        assert_eq!(upload.wn_file_id, "img9");
        assert_eq!(upload.estimated_fee, 120);
    }

    #[test]
    fn test_parse_upload_response_missing_field() {
        let body = json!({"estimated_fee": 500});
        let err = parse_upload_response(WnService::Cascade, &body).unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("file_id"));
    }

    #[test]
    fn test_parse_upload_fee_given_as_float() {
        let body = json!({"file_id": "f1", "estimated_fee": 500.0});
        let upload = parse_upload_response(WnService::Cascade, &body).unwrap();
        assert_eq!(upload.estimated_fee, 500);
    }

    #[test]
    fn test_decode_download_envelope() {
        let body = json!({"file": BASE64.encode(b"artifact bytes")});
        let bytes = decode_download_envelope(&body).unwrap();
        assert_eq!(bytes, b"artifact bytes");
    }

    #[test]
    fn test_decode_download_envelope_missing_file() {
        assert!(decode_download_envelope(&json!({})).is_err());
    }

    #[test]
    fn test_history_entry_tolerates_details() {
        let raw = json!([
            {"status": "Task Started"},
            {"status": "Task Rejected", "details": {"fields": {"error": "boom"}}}
        ]);
        let entries: Vec<WnHistoryEntry> = serde_json::from_value(raw).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].status, "Task Rejected");
        assert!(entries[1].details.is_some());
    }
}
