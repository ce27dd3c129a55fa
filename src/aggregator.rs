/// Client-facing command and query surface.
///
/// The aggregator turns submissions into task rows and pipeline jobs,
/// and projects task state back into client-facing results. It is the
/// only module that creates tasks; everything downstream works off the
/// rows it writes.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{GatewayError, Result};
use crate::pipeline::collection::CollectionParams;
use crate::pipeline::nft::NftProperties;
use crate::pipeline::queue::{Job, PipelineQueue};
use crate::pipeline::PipelineCtx;
use crate::state::models::{Task, TaskKind, TaskStatus};
use crate::state::repository::{self, NewTask};

/// One file in a submission.
pub struct SubmitFile {
    pub file_name: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// Per-request options shared by every file in a submission.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub make_publicly_accessible: bool,
    pub collection_act_txid: Option<String>,
    pub open_api_group_id: Option<String>,
    /// PastelID to offer the finished ticket to.
    pub intended_recipient_pastel_id: Option<String>,
}

/// Client-facing view of one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultStatus {
    pub result_id: String,
    pub status: TaskStatus,
    pub status_message: Option<String>,
    pub reg_ticket_txid: Option<String>,
    pub act_ticket_txid: Option<String>,
    pub offer_ticket_txid: Option<String>,
    pub stored_file_ipfs_cid: Option<String>,
    pub original_file_name: Option<String>,
}

/// Client-facing view of a whole submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestStatus {
    pub request_id: String,
    pub results: Vec<ResultStatus>,
}

/// Offer details for a finished registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferInfo {
    pub result_id: String,
    pub act_ticket_txid: Option<String>,
    pub offer_ticket_txid: Option<String>,
    pub intended_recipient_pastel_id: Option<String>,
}

/// Strip raw WalletNode error text from a status message unless the
/// operator opted into detailed errors.
fn project_message(
    status: TaskStatus,
    message: Option<&str>,
    detailed: bool,
) -> Option<String> {
    let message = message?;
    if detailed || status != TaskStatus::Error {
        return Some(message.to_string());
    }
    if message.starts_with("Task Rejected") || message.starts_with("stage failed") {
        return Some("Registration failed, will be retried".to_string());
    }
    Some(message.to_string())
}

/// Reject lookups for tasks the caller does not own. Answers with the
/// same NotFound as a missing row, so result ids cannot be probed
/// across accounts.
fn ensure_owned(task: Task, owner_id: Uuid) -> Result<Task> {
    if task.owner_id != owner_id {
        return Err(GatewayError::NotFound(format!(
            "result {}",
            task.result_id
        )));
    }
    Ok(task)
}

/// Activation txid an offer ticket can be written against. Only a
/// finished registration has one.
fn transferable_act_txid(task: &Task) -> Result<&str> {
    if task.process_status != TaskStatus::Done {
        return Err(GatewayError::Policy(format!(
            "registration is not finished, status is {:?}",
            task.process_status
        )));
    }
    task.act_ticket_txid
        .as_deref()
        .ok_or_else(|| GatewayError::Policy("registration has no activation ticket".into()))
}

fn project_task(task: &Task, detailed: bool) -> ResultStatus {
    ResultStatus {
        result_id: task.result_id.clone(),
        status: task.process_status,
        status_message: project_message(
            task.process_status,
            task.process_status_message.as_deref(),
            detailed,
        ),
        reg_ticket_txid: task.reg_ticket_txid.clone(),
        act_ticket_txid: task.act_ticket_txid.clone(),
        offer_ticket_txid: task.offer_ticket_txid.clone(),
        stored_file_ipfs_cid: task.stored_file_ipfs_cid.clone(),
        original_file_name: task.original_file_name.clone(),
    }
}

pub struct WorkAggregator {
    ctx: PipelineCtx,
    queue: PipelineQueue,
}

impl WorkAggregator {
    pub fn new(ctx: PipelineCtx, queue: PipelineQueue) -> Self {
        Self { ctx, queue }
    }

    /// Submit a batch of files for registration under one request.
    ///
    /// Each file gets its own task and pipeline job. Files whose bytes
    /// were already registered through this gateway come back EXISTING
    /// with the known ticket txid instead of being registered twice.
    pub async fn submit_files(
        &self,
        owner_id: Uuid,
        pastel_id: &str,
        kind: TaskKind,
        files: Vec<SubmitFile>,
        options: SubmitOptions,
        nft_properties: Option<NftProperties>,
    ) -> Result<RequestStatus> {
        if kind == TaskKind::Collection {
            return Err(GatewayError::Policy(
                "collections are submitted through submit_collection".into(),
            ));
        }
        if files.is_empty() {
            return Err(GatewayError::Policy("no files in submission".into()));
        }
        if kind == TaskKind::Nft && nft_properties.is_none() {
            return Err(GatewayError::Policy(
                "nft submissions require nft properties".into(),
            ));
        }

        let request_id = Uuid::new_v4().to_string();
        let height = self.ctx.rpc.get_block_count().await?;
        let nft_properties: Option<Value> = nft_properties
            .map(|p| serde_json::to_value(p))
            .transpose()
            .map_err(|e| GatewayError::Serialization(e.to_string()))?;

        let mut results = Vec::with_capacity(files.len());
        for file in files {
            let task = self
                .submit_one(
                    owner_id,
                    pastel_id,
                    kind,
                    &request_id,
                    file,
                    &options,
                    nft_properties.clone(),
                    height,
                )
                .await?;
            results.push(project_task(&task, self.ctx.config.return_detailed_wn_error));
        }

        info!(request_id, count = results.len(), ?kind, "submission accepted");
        Ok(RequestStatus { request_id, results })
    }

    #[allow(clippy::too_many_arguments)]
    async fn submit_one(
        &self,
        owner_id: Uuid,
        pastel_id: &str,
        kind: TaskKind,
        request_id: &str,
        file: SubmitFile,
        options: &SubmitOptions,
        nft_properties: Option<Value>,
        height: i64,
    ) -> Result<Task> {
        if file.data.is_empty() {
            return Err(GatewayError::Policy(format!(
                "file '{}' is empty",
                file.file_name
            )));
        }

        let data_hash = Sha256::digest(&file.data).to_vec();
        let result_id = Uuid::new_v4().to_string();

        // Same bytes, same family: point the client at the existing ticket.
        if let Some(known) =
            repository::find_reg_ticket(self.ctx.db.pool(), &data_hash, kind).await?
        {
            warn!(
                file_name = file.file_name,
                data_hash = hex::encode(&data_hash),
                txid = known.reg_ticket_txid,
                "submission matches an already registered artifact"
            );
            let task = repository::create_task(
                self.ctx.db.pool(),
                NewTask {
                    kind,
                    owner_id,
                    request_id: request_id.to_string(),
                    result_id,
                    pastel_id: pastel_id.to_string(),
                    original_file_name: Some(file.file_name),
                    original_file_content_type: Some(file.content_type),
                    original_file_local_path: None,
                    original_file_ipfs_cid: None,
                    original_file_hash: Some(data_hash),
                    make_publicly_accessible: options.make_publicly_accessible,
                    open_api_group_id: options.open_api_group_id.clone(),
                    offer_ticket_intended_rcpt_pastel_id: None,
                    collection_act_txid: None,
                    height,
                    nft_properties: None,
                    collection_params: None,
                },
            )
            .await?;
            repository::set_reg_ticket_txid(self.ctx.db.pool(), task.id, &known.reg_ticket_txid)
                .await?;
            repository::mark_failed(
                self.ctx.db.pool(),
                task.id,
                TaskStatus::Existing,
                "Artifact already registered on the network",
                false,
            )
            .await?;
            return self.ctx.load_task(task.id).await;
        }

        let task = repository::create_task(
            self.ctx.db.pool(),
            NewTask {
                kind,
                owner_id,
                request_id: request_id.to_string(),
                result_id,
                pastel_id: pastel_id.to_string(),
                original_file_name: Some(file.file_name.clone()),
                original_file_content_type: Some(file.content_type),
                original_file_local_path: None,
                original_file_ipfs_cid: None,
                original_file_hash: Some(data_hash),
                make_publicly_accessible: options.make_publicly_accessible,
                open_api_group_id: options.open_api_group_id.clone(),
                offer_ticket_intended_rcpt_pastel_id: options
                    .intended_recipient_pastel_id
                    .clone(),
                collection_act_txid: options.collection_act_txid.clone(),
                height,
                nft_properties,
                collection_params: None,
            },
        )
        .await?;

        let path = self
            .ctx
            .cache
            .store_original(task.id, &file.file_name, &file.data)
            .await?;
        repository::set_original_file_path(
            self.ctx.db.pool(),
            task.id,
            path.to_string_lossy().as_ref(),
        )
        .await?;

        self.queue
            .enqueue(Job {
                task_id: task.id,
                restart: false,
            })
            .await?;

        self.ctx.load_task(task.id).await
    }

    /// Submit a collection registration.
    pub async fn submit_collection(
        &self,
        owner_id: Uuid,
        pastel_id: &str,
        params: CollectionParams,
    ) -> Result<RequestStatus> {
        params.validate()?;

        let request_id = Uuid::new_v4().to_string();
        let result_id = Uuid::new_v4().to_string();
        let height = self.ctx.rpc.get_block_count().await?;
        let collection_params = serde_json::to_value(&params)
            .map_err(|e| GatewayError::Serialization(e.to_string()))?;

        let task = repository::create_task(
            self.ctx.db.pool(),
            NewTask {
                kind: TaskKind::Collection,
                owner_id,
                request_id: request_id.clone(),
                result_id,
                pastel_id: pastel_id.to_string(),
                original_file_name: None,
                original_file_content_type: None,
                original_file_local_path: None,
                original_file_ipfs_cid: None,
                original_file_hash: None,
                make_publicly_accessible: false,
                open_api_group_id: None,
                offer_ticket_intended_rcpt_pastel_id: None,
                collection_act_txid: None,
                height,
                nft_properties: None,
                collection_params: Some(collection_params),
            },
        )
        .await?;

        self.queue
            .enqueue(Job {
                task_id: task.id,
                restart: false,
            })
            .await?;

        info!(request_id, collection_name = params.collection_name, "collection submission accepted");
        Ok(RequestStatus {
            request_id,
            results: vec![project_task(&task, self.ctx.config.return_detailed_wn_error)],
        })
    }

    /// Project a task, preferring the last logged WalletNode status over
    /// the coarse stage message while the registration is in flight.
    async fn project(&self, task: &Task) -> ResultStatus {
        let mut projected = project_task(task, self.ctx.config.return_detailed_wn_error);

        if matches!(
            task.process_status,
            TaskStatus::Started | TaskStatus::Registered
        ) {
            if let Ok(Some(entry)) = repository::latest_history(self.ctx.db.pool(), task.id).await
            {
                let last_status = entry
                    .status_messages
                    .as_array()
                    .and_then(|steps| steps.last())
                    .and_then(|step| step.get("status"))
                    .and_then(Value::as_str);
                if let Some(status) = last_status {
                    projected.status_message = Some(status.to_string());
                }
            }
        }
        projected
    }

    /// Load a task by result id, scoped to its owner.
    async fn load_owned(&self, result_id: &str, owner_id: Uuid) -> Result<Task> {
        let task = repository::get_task_by_result_id(self.ctx.db.pool(), result_id)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("result {result_id}")))?;
        ensure_owned(task, owner_id)
    }

    /// Status of one task by its client-visible result id.
    pub async fn status_result(&self, owner_id: Uuid, result_id: &str) -> Result<ResultStatus> {
        let task = self.load_owned(result_id, owner_id).await?;
        Ok(self.project(&task).await)
    }

    /// Status of every task in a submission.
    pub async fn status_request(&self, owner_id: Uuid, request_id: &str) -> Result<RequestStatus> {
        let tasks =
            repository::list_tasks_by_request(self.ctx.db.pool(), request_id, owner_id).await?;
        if tasks.is_empty() {
            return Err(GatewayError::NotFound(format!("request {request_id}")));
        }
        let mut results = Vec::with_capacity(tasks.len());
        for task in &tasks {
            results.push(self.project(task).await);
        }
        Ok(RequestStatus {
            request_id: request_id.to_string(),
            results,
        })
    }

    /// Retrieve the registered artifact bytes: local cache first, then
    /// the IPFS archive, then a WalletNode download as a last resort.
    pub async fn get_artifact_bytes(&self, owner_id: Uuid, result_id: &str) -> Result<Vec<u8>> {
        let task = self.load_owned(result_id, owner_id).await?;

        let reg_txid = task
            .reg_ticket_txid
            .as_deref()
            .ok_or_else(|| GatewayError::Policy("registration is not finished".into()))?;

        if let Some(bytes) = self.ctx.cache.read_result(reg_txid).await? {
            return Ok(bytes);
        }

        if let Some(cid) = task.stored_file_ipfs_cid.as_deref() {
            match self.ctx.blobs.get(cid).await {
                Ok(bytes) => {
                    self.ctx.cache.store_result(reg_txid, &bytes).await?;
                    return Ok(bytes);
                }
                Err(e) => warn!(result_id, cid, error = %e, "archive fetch failed, falling back"),
            }
        }

        let passphrase = self.ctx.secrets.passphrase(&task.pastel_id).await?;
        let bytes = self
            .ctx
            .wn
            .download(task.kind.wn_service(), reg_txid, &task.pastel_id, &passphrase)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("artifact for result {result_id}")))?;
        self.ctx.cache.store_result(reg_txid, &bytes).await?;
        Ok(bytes)
    }

    /// Offer-ticket details for a finished registration.
    pub async fn transfer_info(&self, owner_id: Uuid, result_id: &str) -> Result<TransferInfo> {
        let task = self.load_owned(result_id, owner_id).await?;

        Ok(TransferInfo {
            result_id: task.result_id,
            act_ticket_txid: task.act_ticket_txid,
            offer_ticket_txid: task.offer_ticket_txid,
            intended_recipient_pastel_id: task.offer_ticket_intended_rcpt_pastel_id,
        })
    }

    /// Offer a finished registration to another PastelID.
    ///
    /// Idempotent: once an offer ticket exists, further calls return
    /// its txid instead of writing a second ticket.
    pub async fn transfer(
        &self,
        owner_id: Uuid,
        result_id: &str,
        to_pastel_id: &str,
    ) -> Result<String> {
        let task = self.load_owned(result_id, owner_id).await?;

        if let Some(existing) = task.offer_ticket_txid.clone() {
            return Ok(existing);
        }

        let act_txid = transferable_act_txid(&task)?.to_string();
        let passphrase = self.ctx.secrets.passphrase(&task.pastel_id).await?;
        let offer_txid = self
            .ctx
            .rpc
            .create_offer_ticket(&act_txid, &task.pastel_id, &passphrase, to_pastel_id)
            .await?;
        info!(result_id, offer_txid, to_pastel_id, "offer ticket registered");
        repository::set_offer_ticket(self.ctx.db.pool(), task.id, &offer_txid).await?;
        Ok(offer_txid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_task(owner_id: Uuid) -> Task {
        Task {
            id: Uuid::new_v4(),
            kind: TaskKind::Cascade,
            owner_id,
            request_id: "req-1".into(),
            result_id: "res-1".into(),
            pastel_id: "jXowner".into(),
            original_file_name: Some("art.png".into()),
            original_file_content_type: Some("image/png".into()),
            original_file_local_path: None,
            original_file_ipfs_cid: None,
            original_file_hash: None,
            wn_file_id: None,
            wn_task_id: None,
            wn_fee: 0,
            burn_txid: None,
            reg_ticket_txid: None,
            act_ticket_txid: None,
            stored_file_ipfs_cid: None,
            nft_dd_ipfs_cid: None,
            make_publicly_accessible: false,
            collection_act_txid: None,
            open_api_group_id: None,
            offer_ticket_intended_rcpt_pastel_id: None,
            offer_ticket_txid: None,
            height: 100,
            process_status: TaskStatus::New,
            process_status_message: None,
            retry_num: 0,
            nft_properties: None,
            collection_params: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_lookups_are_scoped_to_the_owner() {
        let owner = Uuid::new_v4();
        let task = sample_task(owner);
        assert!(ensure_owned(task, owner).is_ok());
    }

    #[test]
    fn test_other_owners_results_read_as_missing() {
        let task = sample_task(Uuid::new_v4());
        let err = ensure_owned(task, Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)), "{err}");
    }

    #[test]
    fn test_transfer_requires_a_finished_registration() {
        let mut task = sample_task(Uuid::new_v4());
        task.act_ticket_txid = Some("act123".into());
        assert!(transferable_act_txid(&task).is_err());

        task.process_status = TaskStatus::Done;
        assert_eq!(transferable_act_txid(&task).unwrap(), "act123");

        task.act_ticket_txid = None;
        assert!(transferable_act_txid(&task).is_err());
    }

    #[test]
    fn test_error_messages_are_redacted_by_default() {
        let message = project_message(
            TaskStatus::Error,
            Some("Task Rejected: duplicate burnTXID in ticket abc123"),
            false,
        );
        assert_eq!(
            message.as_deref(),
            Some("Registration failed, will be retried")
        );
    }

    #[test]
    fn test_detailed_errors_pass_through() {
        let raw = "Task Rejected: duplicate burnTXID in ticket abc123";
        let message = project_message(TaskStatus::Error, Some(raw), true);
        assert_eq!(message.as_deref(), Some(raw));
    }

    #[test]
    fn test_non_error_messages_are_never_redacted() {
        let message = project_message(TaskStatus::Started, Some("Registration started"), false);
        assert_eq!(message.as_deref(), Some("Registration started"));
    }

    #[test]
    fn test_operational_error_messages_survive_redaction() {
        // messages the gateway wrote itself carry no WalletNode internals
        let message = project_message(
            TaskStatus::Error,
            Some("No WalletNode result for the task"),
            false,
        );
        assert_eq!(message.as_deref(), Some("No WalletNode result for the task"));
    }
}
