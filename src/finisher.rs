/// Registration finisher.
///
/// WalletNode does not push events; the finisher polls the task history
/// of every STARTED or REGISTERED task, extracts ticket txids from the
/// status lines, reacts to rejections and drives finished registrations
/// to DONE (download, archive, credit, offer).
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::error::{GatewayError, Result};
use crate::pipeline::PipelineCtx;
use crate::state::models::{Task, TaskKind, TaskStatus};
use crate::state::repository;
use crate::walletnode::WnHistoryEntry;

/// Display name WalletNode uses for a family in history lines.
fn service_display_name(kind: TaskKind) -> &'static str {
    match kind {
        TaskKind::Cascade => "Cascade",
        TaskKind::Sense => "Sense",
        TaskKind::Nft => "NFT",
        TaskKind::Collection => "Collection",
    }
}

/// Extract a txid from a status line, given its announcement prefix.
/// The txid is the first whitespace-delimited token after the prefix.
fn txid_after_prefix<'a>(status: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = status.split_once(prefix)?.1.trim();
    let token = rest.split_whitespace().next()?;
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

/// Registration txid announced in a validation step, if any.
fn parse_reg_txid(status: &str, display_name: &str) -> Option<String> {
    let validating = format!("Validating {display_name} Reg TXID: ");
    let validated = format!("Validated {display_name} Reg TXID: ");
    txid_after_prefix(status, &validating)
        .or_else(|| txid_after_prefix(status, &validated))
        .map(str::to_owned)
}

/// Activation txid announced in an activation step, if any. The wording
/// differs between families ("Registration Ticket" vs "Action Ticket").
fn parse_act_txid(status: &str, display_name: &str) -> Option<String> {
    let registration = format!("Activated {display_name} Registration Ticket TXID: ");
    let action = format!("Activated {display_name} Action Ticket TXID: ");
    txid_after_prefix(status, &registration)
        .or_else(|| txid_after_prefix(status, &action))
        .map(str::to_owned)
}

/// Why WalletNode rejected a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RejectionKind {
    /// The burn txid was already consumed by another ticket.
    DuplicateBurn,
    /// The burn txid failed validation.
    BadBurn,
    /// The artifact is already registered on the network.
    AlreadyRegistered,
    Other,
}

fn classify_rejection(error_detail: &str) -> RejectionKind {
    if error_detail.contains("image already registered") {
        RejectionKind::AlreadyRegistered
    } else if error_detail.contains("duplicate burnTXID") {
        RejectionKind::DuplicateBurn
    } else if error_detail.contains("pre-burn txid is bad") {
        RejectionKind::BadBurn
    } else {
        RejectionKind::Other
    }
}

/// Whether a failed history call means WalletNode does not know the
/// task (404), as opposed to not being reachable. Only the former may
/// take the missing-history path; an outage must not age tasks into
/// ERROR.
fn history_says_task_unknown(err: &GatewayError) -> bool {
    matches!(err, GatewayError::WalletNode { status: 404, .. })
}

/// Error detail buried in a rejection step, if present.
fn extract_error_detail(step: &WnHistoryEntry) -> Option<&str> {
    step.details
        .as_ref()?
        .get("fields")?
        .get("error_detail")?
        .as_str()
}

pub struct Finisher {
    ctx: PipelineCtx,
}

impl Finisher {
    pub fn new(ctx: PipelineCtx) -> Self {
        Self { ctx }
    }

    /// Poll forever at the configured interval.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.ctx.config.finisher_interval());
        loop {
            ticker.tick().await;
            if let Err(e) = self.sweep().await {
                error!(error = %e, "finisher sweep failed");
            }
        }
    }

    /// One pass over every unfinished task of every family.
    pub async fn sweep(&self) -> Result<()> {
        for kind in [
            TaskKind::Cascade,
            TaskKind::Sense,
            TaskKind::Nft,
            TaskKind::Collection,
        ] {
            if let Err(e) = self.sweep_kind(kind).await {
                error!(?kind, error = %e, "finisher pass failed for family");
            }
        }
        Ok(())
    }

    async fn sweep_kind(&self, kind: TaskKind) -> Result<()> {
        let tasks = repository::list_awaiting_finish(self.ctx.db.pool(), kind).await?;
        if tasks.is_empty() {
            return Ok(());
        }
        info!(?kind, count = tasks.len(), "checking unfinished tasks");

        for task in tasks {
            if let Err(e) = self.check_task(&task).await {
                error!(task_id = %task.id, error = %e, "finisher check failed for task");
            }
        }
        Ok(())
    }

    async fn check_task(&self, task: &Task) -> Result<()> {
        let Some(wn_task_id) = task.wn_task_id.as_deref() else {
            return Ok(());
        };

        let history = match self.ctx.wn.history(task.kind.wn_service(), wn_task_id).await {
            Ok(history) => history,
            Err(e) if history_says_task_unknown(&e) => {
                warn!(task_id = %task.id, "WalletNode does not know the task");
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        if history.is_empty() {
            return self.handle_missing_history(task).await;
        }

        let raw: Value = json!(history
            .iter()
            .map(|step| {
                json!({"status": step.status, "details": step.details})
            })
            .collect::<Vec<_>>());
        repository::upsert_history(
            self.ctx.db.pool(),
            task.id,
            task.wn_file_id.as_deref(),
            wn_task_id,
            &raw,
        )
        .await?;

        self.walk_history(task, &history).await
    }

    /// The registration may have finished even though WalletNode lost
    /// the task: the burn txid doubles as a lookup key for action
    /// tickets. Tasks past the age limit with no trace are errored out.
    async fn handle_missing_history(&self, task: &Task) -> Result<()> {
        if task.kind.uses_preburn() {
            if let Some(burn_txid) = task.burn_txid.as_deref() {
                if let Some(ticket) = self.ctx.rpc.tickets_find("action", burn_txid).await? {
                    if let Some(txid) = ticket.get("txid").and_then(Value::as_str) {
                        info!(task_id = %task.id, txid, "recovered reg ticket via burn txid");
                        repository::mark_registered(self.ctx.db.pool(), task.id, txid).await?;
                        return Ok(());
                    }
                }
            }
        }

        let tip = self.ctx.rpc.get_block_count().await?;
        let age = tip - task.height;
        if age > self.ctx.config.finisher_age_limit_blocks {
            warn!(task_id = %task.id, age, "no history and task is past the age limit");
            self.mark_failed(task, TaskStatus::Error, "No WalletNode result for the task", false)
                .await?;
        }
        Ok(())
    }

    async fn walk_history(&self, task: &Task, history: &[WnHistoryEntry]) -> Result<()> {
        let display_name = service_display_name(task.kind);
        let mut reg_ticket_txid = task.reg_ticket_txid.clone();

        for step in history {
            if step.status == "Task Rejected" {
                return self.handle_rejection(task, step).await;
            }

            if reg_ticket_txid.is_none() {
                if let Some(txid) = parse_reg_txid(&step.status, display_name) {
                    info!(task_id = %task.id, txid, "found reg ticket txid");
                    repository::set_reg_ticket_txid(self.ctx.db.pool(), task.id, &txid).await?;
                    reg_ticket_txid = Some(txid);
                    continue;
                }
            }

            if task.act_ticket_txid.is_none() {
                if let Some(reg_txid) = reg_ticket_txid.as_deref() {
                    let verb = task.kind.wn_service().act_ticket_verb();
                    let act = self.ctx.rpc.tickets_find(verb, reg_txid).await?;
                    if let Some(txid) =
                        act.as_ref().and_then(|t| t.get("txid")).and_then(Value::as_str)
                    {
                        info!(task_id = %task.id, txid, "found act ticket on chain");
                        return self.finalize(task, reg_txid, txid).await;
                    }

                    info!(task_id = %task.id, reg_txid, "reg ticket written, activation pending");
                    repository::update_status(
                        self.ctx.db.pool(),
                        task.id,
                        TaskStatus::Registered,
                        None,
                    )
                    .await?;
                    return Ok(());
                }

                if let Some(act_txid) = parse_act_txid(&step.status, display_name) {
                    let reg = reg_ticket_txid.clone().unwrap_or_default();
                    return self.finalize(task, &reg, &act_txid).await;
                }
            }
        }
        Ok(())
    }

    async fn handle_rejection(&self, task: &Task, step: &WnHistoryEntry) -> Result<()> {
        let detail = extract_error_detail(step).unwrap_or("");
        warn!(task_id = %task.id, detail, "registration rejected by WalletNode");

        let mut clear_burn = false;
        if task.kind.uses_preburn() {
            match classify_rejection(detail) {
                RejectionKind::DuplicateBurn => {
                    if let Some(burn_txid) = task.burn_txid.as_deref() {
                        self.ctx.burn_pool.mark_used(burn_txid).await?;
                    }
                    clear_burn = true;
                }
                RejectionKind::BadBurn => {
                    if let Some(burn_txid) = task.burn_txid.as_deref() {
                        if self.ctx.burn_pool.check_tx(burn_txid).await?
                            == crate::burnpool::ChainCheck::Missing
                        {
                            self.ctx.burn_pool.mark_bad(burn_txid).await?;
                        }
                    }
                    clear_burn = true;
                }
                RejectionKind::AlreadyRegistered => {
                    return self
                        .mark_failed(
                            task,
                            TaskStatus::Existing,
                            "Artifact already registered on the network",
                            true,
                        )
                        .await;
                }
                RejectionKind::Other => {}
            }
        }

        let message = if detail.is_empty() {
            "Task Rejected".to_string()
        } else {
            format!("Task Rejected: {detail}")
        };
        self.mark_failed(task, TaskStatus::Error, &message, clear_burn)
            .await
    }

    /// Fail the task and release its burn back to the pool when nothing
    /// else holds it. Burns detached because they were consumed or bad
    /// stay in the state the rejection handler gave them.
    async fn mark_failed(
        &self,
        task: &Task,
        status: TaskStatus,
        message: &str,
        clear_burn: bool,
    ) -> Result<()> {
        repository::mark_failed(self.ctx.db.pool(), task.id, status, message, clear_burn).await?;

        if task.kind.uses_preburn() && !clear_burn {
            if let Some(burn_txid) = task.burn_txid.as_deref() {
                let live =
                    repository::count_tasks_using_burn_txid(self.ctx.db.pool(), burn_txid).await?;
                if live == 0 {
                    self.ctx.burn_pool.release(burn_txid).await?;
                }
            }
        }
        Ok(())
    }

    /// Drive an activated registration to DONE.
    ///
    /// Collections only need the activation txid recorded. File tasks
    /// also archive the registered artifact (and the duplicate-detection
    /// report for NFTs); archive failures are logged, not fatal.
    async fn finalize(&self, task: &Task, reg_txid: &str, act_txid: &str) -> Result<()> {
        info!(task_id = %task.id, act_txid, "finalizing registration");

        if task.kind == TaskKind::Collection {
            repository::mark_done(self.ctx.db.pool(), task.id, act_txid, None, None).await?;
            repository::adjust_balance(
                self.ctx.db.pool(),
                task.owner_id,
                self.ctx.config.collection_reg_fee,
            )
            .await?;
            return Ok(());
        }

        let mut stored_cid: Option<String> = task.stored_file_ipfs_cid.clone();
        let mut dd_cid: Option<String> = task.nft_dd_ipfs_cid.clone();

        match self.archive_artifacts(task, reg_txid).await {
            Ok((file_cid, nft_cid)) => {
                stored_cid = stored_cid.or(file_cid);
                dd_cid = dd_cid.or(nft_cid);
            }
            Err(e) => {
                error!(task_id = %task.id, error = %e, "failed to archive registered artifact");
            }
        }

        repository::mark_done(
            self.ctx.db.pool(),
            task.id,
            act_txid,
            stored_cid.as_deref(),
            dd_cid.as_deref(),
        )
        .await?;
        repository::adjust_balance(self.ctx.db.pool(), task.owner_id, task.wn_fee).await?;

        if task.kind.uses_preburn() {
            if let Some(burn_txid) = task.burn_txid.as_deref() {
                self.ctx.burn_pool.mark_used(burn_txid).await?;
            }
        }

        if let Some(data_hash) = task.original_file_hash.as_deref() {
            repository::upsert_reg_ticket(self.ctx.db.pool(), data_hash, task.kind, reg_txid)
                .await?;
        }

        self.ctx.cache.remove_original(task.id).await.ok();

        if let Some(recipient) = task.offer_ticket_intended_rcpt_pastel_id.as_deref() {
            if task.offer_ticket_txid.is_some() {
                warn!(task_id = %task.id, "offer ticket already exists");
                return Ok(());
            }
            let passphrase = self.ctx.secrets.passphrase(&task.pastel_id).await?;
            let offer_txid = self
                .ctx
                .rpc
                .create_offer_ticket(act_txid, &task.pastel_id, &passphrase, recipient)
                .await?;
            info!(task_id = %task.id, offer_txid, recipient, "offer ticket registered");
            repository::set_offer_ticket(self.ctx.db.pool(), task.id, &offer_txid).await?;
        }

        Ok(())
    }

    async fn archive_artifacts(
        &self,
        task: &Task,
        reg_txid: &str,
    ) -> Result<(Option<String>, Option<String>)> {
        let passphrase = self.ctx.secrets.passphrase(&task.pastel_id).await?;

        let mut stored_cid = None;
        if let Some(bytes) = self
            .ctx
            .wn
            .download(task.kind.wn_service(), reg_txid, &task.pastel_id, &passphrase)
            .await?
        {
            self.ctx.cache.store_result(reg_txid, &bytes).await?;
            if task.stored_file_ipfs_cid.is_none() {
                let file_name = task.original_file_name.as_deref().unwrap_or("artifact");
                let cid = self.ctx.blobs.put(file_name, &bytes).await?;
                self.ctx.pinner.pin(&cid).await;
                stored_cid = Some(cid);
            }
        }

        let mut dd_cid = None;
        if task.kind == TaskKind::Nft {
            if let Some(dd_bytes) = self
                .ctx
                .wn
                .dd_result(task.kind.wn_service(), reg_txid, &task.pastel_id, &passphrase)
                .await?
            {
                self.ctx
                    .cache
                    .store_result(&format!("{reg_txid}.dd"), &dd_bytes)
                    .await?;
                if task.nft_dd_ipfs_cid.is_none() {
                    let cid = self.ctx.blobs.put("dd_result.json", &dd_bytes).await?;
                    self.ctx.pinner.pin(&cid).await;
                    dd_cid = Some(cid);
                }
            }
        }

        Ok((stored_cid, dd_cid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_reg_txid_validating() {
        let status = "Validating Cascade Reg TXID: abc123def";
        assert_eq!(parse_reg_txid(status, "Cascade").unwrap(), "abc123def");
    }

    #[test]
    fn test_parse_reg_txid_validated() {
        let status = "Validated Sense Reg TXID: ff00aa11";
        assert_eq!(parse_reg_txid(status, "Sense").unwrap(), "ff00aa11");
    }

    #[test]
    fn test_parse_reg_txid_takes_first_token() {
        let status = "Validating NFT Reg TXID: abc123 (attempt 2)";
        assert_eq!(parse_reg_txid(status, "NFT").unwrap(), "abc123");
    }

    #[test]
    fn test_parse_reg_txid_wrong_family() {
        let status = "Validating Cascade Reg TXID: abc123";
        assert!(parse_reg_txid(status, "Sense").is_none());
    }

    #[test]
    fn test_parse_reg_txid_unrelated_line() {
        assert!(parse_reg_txid("Task Started", "Cascade").is_none());
        assert!(parse_reg_txid("Validating Cascade Reg TXID: ", "Cascade").is_none());
    }

    #[test]
    fn test_parse_act_txid() {
        let status = "Activated NFT Registration Ticket TXID: deadbeef";
        assert_eq!(parse_act_txid(status, "NFT").unwrap(), "deadbeef");
        assert!(parse_act_txid(status, "Cascade").is_none());
    }

    #[test]
    fn test_parse_act_txid_action_wording() {
        let status = "Activated Sense Action Ticket TXID: cafe01";
        assert_eq!(parse_act_txid(status, "Sense").unwrap(), "cafe01");
    }

    #[test]
    fn test_classify_rejection_substrings() {
        assert_eq!(
            classify_rejection("ticket validation failed: duplicate burnTXID in ticket"),
            RejectionKind::DuplicateBurn
        );
        assert_eq!(
            classify_rejection("the pre-burn txid is bad: not found"),
            RejectionKind::BadBurn
        );
        assert_eq!(
            classify_rejection("this image already registered as txid 123"),
            RejectionKind::AlreadyRegistered
        );
        assert_eq!(
            classify_rejection("supernode quorum not reached"),
            RejectionKind::Other
        );
    }

    #[test]
    fn test_already_registered_wins_over_other_matches() {
        // a detail mentioning both conditions must terminate the task
        let detail = "image already registered, duplicate burnTXID";
        assert_eq!(classify_rejection(detail), RejectionKind::AlreadyRegistered);
    }

    #[test]
    fn test_only_a_missing_task_counts_as_no_history() {
        let unknown = GatewayError::WalletNode {
            status: 404,
            body: "history: task not found".into(),
            retryable: false,
        };
        assert!(history_says_task_unknown(&unknown));

        // an outage must surface as an error, not as an empty history
        let outage = GatewayError::WalletNode {
            status: 503,
            body: "history: unavailable".into(),
            retryable: true,
        };
        assert!(!history_says_task_unknown(&outage));
        let transport = GatewayError::WalletNode {
            status: 0,
            body: "connection refused".into(),
            retryable: true,
        };
        assert!(!history_says_task_unknown(&transport));
    }

    #[test]
    fn test_extract_error_detail() {
        let step = WnHistoryEntry {
            status: "Task Rejected".into(),
            details: Some(json!({"fields": {"error_detail": "duplicate burnTXID"}})),
        };
        assert_eq!(extract_error_detail(&step).unwrap(), "duplicate burnTXID");

        let bare = WnHistoryEntry {
            status: "Task Rejected".into(),
            details: None,
        };
        assert!(extract_error_detail(&bare).is_none());
    }
}
