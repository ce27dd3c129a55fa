/// Shared stage implementations for cascade, sense and NFT tasks.
///
/// Every stage reloads the task and inspects its status first, so a
/// stage that runs twice (worker crash, duplicate enqueue) is harmless.
use std::collections::HashMap;
use std::path::Path;

use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::burnpool::burn_amount_for_fee;
use crate::error::{GatewayError, Result};
use crate::state::models::{Task, TaskKind, TaskStatus};
use crate::state::repository;

use super::{nft, PipelineCtx};

/// First wallet address whose balance exceeds the needed amount.
pub fn find_spendable_address(balances: &HashMap<String, f64>, needed: i64) -> Option<String> {
    balances
        .iter()
        .find(|(_, value)| **value > needed as f64)
        .map(|(address, _)| address.clone())
}

/// Start-request body for cascade and sense registrations.
pub fn action_start_form(task: &Task, spendable_address: &str) -> Value {
    let mut form = json!({
        "burn_txid": task.burn_txid,
        "app_pastelid": task.pastel_id,
        "collection_act_txid": task.collection_act_txid,
        "open_api_group_id": task.open_api_group_id,
        "spendable_address": spendable_address,
    });
    if task.kind == TaskKind::Cascade {
        form["make_publicly_accessible"] = json!(task.make_publicly_accessible);
    }
    form
}

/// Verify the owner can pay the quoted fee. A short balance is a policy
/// failure, not a transient one.
async fn check_owner_balance(ctx: &PipelineCtx, task: &Task, fee: i64) -> Result<()> {
    let account = repository::get_account(ctx.db.pool(), task.owner_id)
        .await?
        .ok_or_else(|| GatewayError::NotFound(format!("account {}", task.owner_id)))?;

    if account.balance < fee {
        return Err(GatewayError::Policy(format!(
            "balance {} cannot cover the {fee} registration fee",
            account.balance
        )));
    }
    Ok(())
}

async fn upload_original(ctx: &PipelineCtx, task: &Task, data: Vec<u8>) -> Result<(String, i64)> {
    let file_name = task
        .original_file_name
        .as_deref()
        .ok_or_else(|| GatewayError::Invariant("task has no original file name".into()))?;
    let content_type = task
        .original_file_content_type
        .as_deref()
        .unwrap_or("application/octet-stream");

    let upload = ctx
        .wn
        .upload(task.kind.wn_service(), file_name, content_type, data)
        .await?;

    if upload.wn_file_id.is_empty() {
        return Err(GatewayError::WalletNode {
            status: 200,
            body: "upload returned an empty file id".into(),
            retryable: true,
        });
    }
    if upload.estimated_fee <= 0 {
        return Err(GatewayError::WalletNode {
            status: 200,
            body: format!("upload returned fee {}", upload.estimated_fee),
            retryable: true,
        });
    }

    Ok((upload.wn_file_id, upload.estimated_fee))
}

/// Upload the original file to WalletNode and record the fee quote.
pub async fn register_file(ctx: &PipelineCtx, task_id: Uuid) -> Result<()> {
    let task = ctx.load_task(task_id).await?;

    if task.process_status != TaskStatus::New {
        info!(%task_id, status = ?task.process_status, "register_file: already past NEW, skipping");
        return Ok(());
    }

    let path = task
        .original_file_local_path
        .as_deref()
        .ok_or_else(|| GatewayError::Invariant("task has no cached upload".into()))?;
    let data = ctx.cache.read_original(Path::new(path)).await?;

    let (wn_file_id, fee) = upload_original(ctx, &task, data).await?;

    check_owner_balance(ctx, &task, fee).await?;

    info!(%task_id, wn_file_id, fee, "file uploaded to WalletNode");
    repository::mark_uploaded(ctx.db.pool(), task_id, &wn_file_id, fee).await?;
    Ok(())
}

/// Secure a confirmed preburn transaction for the task.
pub async fn preburn_fee(ctx: &PipelineCtx, task_id: Uuid) -> Result<()> {
    let task = ctx.load_task(task_id).await?;

    if !task.kind.uses_preburn() {
        return Ok(());
    }
    if task.process_status != TaskStatus::Uploaded {
        warn!(%task_id, status = ?task.process_status, "preburn_fee: wrong task state, skipping");
        return Ok(());
    }
    if task.burn_txid.is_some() {
        info!(%task_id, "preburn_fee: burn already associated, skipping");
        return Ok(());
    }

    let burn_amount = burn_amount_for_fee(task.wn_fee);
    let tip_height = ctx.rpc.get_block_count().await?;

    let burn = ctx.burn_pool.acquire(task_id, burn_amount, tip_height).await?;

    if !ctx.burn_pool.confirmed(&burn, tip_height) {
        repository::set_status_message(
            ctx.db.pool(),
            task_id,
            &format!("Pre-burn tx [{}] not confirmed yet. Retrying", burn.txid),
        )
        .await?;
        return Err(GatewayError::BurnNotConfirmed(burn.txid));
    }

    info!(%task_id, txid = %burn.txid, "confirmed pre-burn bound to task");
    repository::mark_preburned(ctx.db.pool(), task_id, &burn.txid).await?;
    Ok(())
}

/// Start the registration on WalletNode and archive the original to IPFS.
pub async fn process(ctx: &PipelineCtx, task_id: Uuid) -> Result<()> {
    let task = ctx.load_task(task_id).await?;

    if task.wn_fee == 0 {
        return Err(GatewayError::Invariant(format!(
            "task {task_id} has no fee quote"
        )));
    }
    let Some(wn_file_id) = task.wn_file_id.clone() else {
        return Err(GatewayError::Invariant(format!(
            "task {task_id} has no WalletNode file id"
        )));
    };

    let expected = if task.kind.uses_preburn() {
        TaskStatus::PreburnFee
    } else {
        TaskStatus::Uploaded
    };
    if task.process_status != expected {
        warn!(%task_id, status = ?task.process_status, "process: wrong task state, skipping");
        return Ok(());
    }
    if task.kind.uses_preburn() && task.burn_txid.is_none() {
        return Err(GatewayError::Invariant(format!(
            "task {task_id} reached process without a burn"
        )));
    }

    if task.wn_task_id.is_none() {
        let balances = ctx.rpc.list_address_amounts().await?;
        let spendable = match find_spendable_address(&balances, task.wn_fee) {
            Some(address) => address,
            None => {
                ctx.alerts
                    .raise(
                        "no spendable address",
                        &format!("no wallet address can cover a {} fee", task.wn_fee),
                    )
                    .await;
                return Err(GatewayError::Policy(format!(
                    "no spendable address found for amount > {}",
                    task.wn_fee
                )));
            }
        };

        let form = match task.kind {
            TaskKind::Cascade | TaskKind::Sense => action_start_form(&task, &spendable),
            TaskKind::Nft => nft::register_form(ctx, &task, &spendable).await?,
            TaskKind::Collection => {
                return Err(GatewayError::Invariant(
                    "collection tasks do not run the process stage".into(),
                ))
            }
        };

        let passphrase = ctx.secrets.passphrase(&task.pastel_id).await?;
        let wn_task_id = ctx
            .wn
            .start_task(task.kind.wn_service(), &wn_file_id, form, &passphrase)
            .await?;

        info!(%task_id, wn_task_id, "WalletNode registration started");
        repository::mark_started(ctx.db.pool(), task_id, &wn_task_id).await?;
    } else {
        info!(%task_id, "process: registration already started");
    }

    if task.original_file_ipfs_cid.is_none() {
        if let Some(path) = task.original_file_local_path.as_deref() {
            let data = ctx.cache.read_original(Path::new(path)).await?;
            let file_name = task.original_file_name.as_deref().unwrap_or("original");
            let cid = ctx.blobs.put(file_name, &data).await?;
            ctx.pinner.pin(&cid).await;
            info!(%task_id, cid, "original archived to IPFS");
            repository::set_original_file_cid(ctx.db.pool(), task_id, &cid).await?;
        }
    }

    Ok(())
}

/// Re-upload the artifact of a RESTARTED task.
///
/// The bytes come from the local cache, falling back to the IPFS
/// archive. A task whose bytes are gone from both is DEAD.
pub async fn re_register_file(ctx: &PipelineCtx, task_id: Uuid) -> Result<()> {
    let task = ctx.load_task(task_id).await?;

    if task.process_status != TaskStatus::Restarted {
        warn!(%task_id, status = ?task.process_status, "re_register_file: wrong task state, skipping");
        return Ok(());
    }

    let mut data: Option<Vec<u8>> = None;
    if let Some(path) = task.original_file_local_path.as_deref() {
        data = ctx.cache.read_original(Path::new(path)).await.ok();
    }
    if data.is_none() {
        if let Some(cid) = task.original_file_ipfs_cid.as_deref() {
            data = ctx.blobs.get(cid).await.ok();
        }
    }

    let Some(data) = data else {
        warn!(%task_id, "artifact bytes lost, marking task DEAD");
        repository::update_status(
            ctx.db.pool(),
            task_id,
            TaskStatus::Dead,
            Some("File not found locally or in IPFS"),
        )
        .await?;
        return Ok(());
    };

    let (wn_file_id, fee) = upload_original(ctx, &task, data).await?;
    check_owner_balance(ctx, &task, fee).await?;

    info!(%task_id, wn_file_id, fee, "file re-uploaded to WalletNode");
    repository::mark_uploaded(ctx.db.pool(), task_id, &wn_file_id, fee).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_task(kind: TaskKind) -> Task {
        Task {
            id: Uuid::new_v4(),
            kind,
            owner_id: Uuid::new_v4(),
            request_id: "req-1".into(),
            result_id: "res-1".into(),
            pastel_id: "jXgateway".into(),
            original_file_name: Some("art.png".into()),
            original_file_content_type: Some("image/png".into()),
            original_file_local_path: None,
            original_file_ipfs_cid: None,
            original_file_hash: None,
            wn_file_id: Some("file-1".into()),
            wn_task_id: None,
            wn_fee: 500,
            burn_txid: Some("burn-1".into()),
            reg_ticket_txid: None,
            act_ticket_txid: None,
            stored_file_ipfs_cid: None,
            nft_dd_ipfs_cid: None,
            make_publicly_accessible: true,
            collection_act_txid: None,
            open_api_group_id: Some("group-1".into()),
            offer_ticket_intended_rcpt_pastel_id: None,
            offer_ticket_txid: None,
            height: 100,
            process_status: TaskStatus::PreburnFee,
            process_status_message: None,
            retry_num: 0,
            nft_properties: None,
            collection_params: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_find_spendable_address_needs_strictly_more() {
        let mut balances = HashMap::new();
        balances.insert("addr1".to_string(), 100.0);
        balances.insert("addr2".to_string(), 600.0);

        assert_eq!(find_spendable_address(&balances, 500).unwrap(), "addr2");
        assert!(find_spendable_address(&balances, 600).is_none());
    }

    #[test]
    fn test_cascade_form_carries_public_flag() {
        let task = sample_task(TaskKind::Cascade);
        let form = action_start_form(&task, "addrX");
        assert_eq!(form["burn_txid"], "burn-1");
        assert_eq!(form["app_pastelid"], "jXgateway");
        assert_eq!(form["spendable_address"], "addrX");
        assert_eq!(form["make_publicly_accessible"], true);
        assert_eq!(form["open_api_group_id"], "group-1");
    }

    #[test]
    fn test_sense_form_has_no_public_flag() {
        let task = sample_task(TaskKind::Sense);
        let form = action_start_form(&task, "addrX");
        assert!(form.get("make_publicly_accessible").is_none());
    }
}
