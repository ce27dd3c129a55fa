/// Failed-task re-processor.
///
/// Sweeps errored tasks and tasks that never got a status message,
/// decides per task whether to promote, restart or bury it, and feeds
/// restarts back into the pipeline queue. Restarts back off linearly
/// with the retry count so a flapping dependency is not hammered.
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{error, info, warn};

use crate::error::Result;
use crate::pipeline::queue::{Job, PipelineQueue};
use crate::pipeline::PipelineCtx;
use crate::state::models::{Task, TaskKind, TaskStatus};
use crate::state::repository;

/// What to do with a failed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    /// Retry cap reached.
    Bury,
    /// The registration is actually running; hand it back to the finisher.
    PromoteStarted,
    /// A ticket txid survived; the finisher can finalize from there.
    PromoteRegistered,
    /// Clear the registration handles and run the pipeline again.
    Restart,
    /// Still inside the cooldown window.
    Wait,
}

/// Cooldown before a task may be retried again: the sweep interval
/// scaled by how often it has already been retried.
fn cooldown_elapsed(
    retry_num: i32,
    interval_secs: u64,
    updated_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> bool {
    let factor = i64::from(retry_num.max(1));
    let cooldown = ChronoDuration::seconds(interval_secs as i64 * factor);
    now - updated_at >= cooldown
}

fn decide(task: &Task, retry_cap: i32, interval_secs: u64, now: DateTime<Utc>) -> Decision {
    if task.retry_num >= retry_cap {
        return Decision::Bury;
    }
    if !cooldown_elapsed(task.retry_num, interval_secs, task.updated_at, now) {
        return Decision::Wait;
    }

    // A task with no status message never made it through a stage; if
    // its WalletNode handles survived the crash it is likely running.
    if task.process_status_message.as_deref().unwrap_or("").is_empty() {
        if task.has_live_identifiers() {
            return Decision::PromoteStarted;
        }
        return Decision::Restart;
    }

    if task.reg_ticket_txid.is_some() || task.act_ticket_txid.is_some() {
        return Decision::PromoteRegistered;
    }

    Decision::Restart
}

pub struct ReProcessor {
    ctx: PipelineCtx,
    queue: PipelineQueue,
}

impl ReProcessor {
    pub fn new(ctx: PipelineCtx, queue: PipelineQueue) -> Self {
        Self { ctx, queue }
    }

    /// Poll forever at the configured interval.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.ctx.config.re_processor_interval());
        loop {
            ticker.tick().await;
            if let Err(e) = self.sweep().await {
                error!(error = %e, "re-processor sweep failed");
            }
        }
    }

    /// One pass over failed tasks, oldest first.
    pub async fn sweep(&self) -> Result<()> {
        let tasks =
            repository::list_for_reprocessing(self.ctx.db.pool(), self.ctx.config.re_processor_limit)
                .await?;
        if tasks.is_empty() {
            return Ok(());
        }
        info!(count = tasks.len(), "re-processor picked up failed tasks");

        for task in tasks {
            if let Err(e) = self.handle(&task).await {
                error!(task_id = %task.id, error = %e, "re-processing failed for task");
            }
        }

        self.requeue_stuck_restarts().await
    }

    /// RESTARTED rows older than one sweep interval lost their queue slot
    /// (a crash between the clear and the enqueue). Put them back.
    async fn requeue_stuck_restarts(&self) -> Result<()> {
        let tasks =
            repository::list_restarted(self.ctx.db.pool(), self.ctx.config.re_processor_limit)
                .await?;
        let cutoff = ChronoDuration::seconds(self.ctx.config.re_processor_interval_secs as i64);

        for task in tasks {
            if Utc::now() - task.updated_at < cutoff {
                continue;
            }
            warn!(task_id = %task.id, "restarted task was never queued, requeueing");
            self.queue
                .enqueue(Job {
                    task_id: task.id,
                    restart: true,
                })
                .await?;
        }
        Ok(())
    }

    async fn handle(&self, task: &Task) -> Result<()> {
        let decision = decide(
            task,
            self.ctx.config.re_processor_retry_cap,
            self.ctx.config.re_processor_interval_secs,
            Utc::now(),
        );

        match decision {
            Decision::Wait => Ok(()),
            Decision::Bury => {
                warn!(task_id = %task.id, retries = task.retry_num, "retry cap reached, burying task");
                self.release_burn(task).await?;
                repository::mark_failed(
                    self.ctx.db.pool(),
                    task.id,
                    TaskStatus::Dead,
                    "Gave up after repeated registration failures",
                    true,
                )
                .await
            }
            Decision::PromoteStarted => {
                info!(task_id = %task.id, "registration handles intact, promoting to STARTED");
                repository::update_status(
                    self.ctx.db.pool(),
                    task.id,
                    TaskStatus::Started,
                    Some("Registration started"),
                )
                .await
            }
            Decision::PromoteRegistered => {
                info!(task_id = %task.id, "ticket txid survived, promoting to REGISTERED");
                match task.reg_ticket_txid.as_deref() {
                    Some(txid) => {
                        repository::mark_registered(self.ctx.db.pool(), task.id, txid).await
                    }
                    None => {
                        repository::update_status(
                            self.ctx.db.pool(),
                            task.id,
                            TaskStatus::Registered,
                            Some("Registration ticket accepted"),
                        )
                        .await
                    }
                }
            }
            Decision::Restart => self.restart(task).await,
        }
    }

    /// Wipe the registration handles and push the task back through the
    /// pipeline. Collections keep their upload handle and fee since
    /// there is no file to re-upload.
    async fn restart(&self, task: &Task) -> Result<()> {
        let retry_num = repository::increment_retry(self.ctx.db.pool(), task.id).await?;
        self.release_burn(task).await?;

        let keep_upload = task.kind == TaskKind::Collection;
        repository::clear_registration_handles(self.ctx.db.pool(), task.id, keep_upload).await?;

        info!(task_id = %task.id, retry_num, "task queued for re-registration");
        self.queue
            .enqueue(Job {
                task_id: task.id,
                restart: true,
            })
            .await
    }

    /// Put the task's burn row back in the pool unless some other live
    /// task still references it.
    async fn release_burn(&self, task: &Task) -> Result<()> {
        if !task.kind.uses_preburn() {
            return Ok(());
        }
        let Some(burn_txid) = task.burn_txid.as_deref() else {
            return Ok(());
        };

        let live = repository::count_tasks_using_burn_txid(self.ctx.db.pool(), burn_txid).await?;
        if live == 0 {
            self.ctx.burn_pool.release(burn_txid).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn failed_task() -> Task {
        let now = Utc::now();
        Task {
            id: Uuid::now_v7(),
            kind: TaskKind::Cascade,
            owner_id: Uuid::now_v7(),
            request_id: "req-1".into(),
            result_id: "res-1".into(),
            pastel_id: "jXowner".into(),
            original_file_name: Some("photo.png".into()),
            original_file_content_type: Some("image/png".into()),
            original_file_local_path: Some("/cache/uploads/x/photo.png".into()),
            original_file_ipfs_cid: None,
            original_file_hash: None,
            wn_file_id: None,
            wn_task_id: None,
            wn_fee: 100,
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
            height: 1000,
            process_status: TaskStatus::Error,
            process_status_message: Some("stage failed: upload".into()),
            retry_num: 1,
            nft_properties: None,
            collection_params: None,
            created_at: now - ChronoDuration::hours(2),
            updated_at: now - ChronoDuration::hours(1),
        }
    }

    #[test]
    fn test_retry_cap_buries() {
        let mut task = failed_task();
        task.retry_num = 10;
        assert_eq!(decide(&task, 10, 700, Utc::now()), Decision::Bury);
    }

    #[test]
    fn test_cooldown_scales_with_retries() {
        let now = Utc::now();
        let mut task = failed_task();
        task.retry_num = 5;
        // 5 retries at a 700s interval means 3500s of cooldown
        task.updated_at = now - ChronoDuration::seconds(3000);
        assert_eq!(decide(&task, 10, 700, now), Decision::Wait);
        task.updated_at = now - ChronoDuration::seconds(3600);
        assert_eq!(decide(&task, 10, 700, now), Decision::Restart);
    }

    #[test]
    fn test_empty_status_with_live_handles_promotes() {
        let mut task = failed_task();
        task.process_status_message = None;
        task.wn_task_id = Some("wn-task".into());
        task.wn_file_id = Some("wn-file".into());
        assert_eq!(decide(&task, 10, 700, Utc::now()), Decision::PromoteStarted);
    }

    #[test]
    fn test_empty_status_without_handles_restarts() {
        let mut task = failed_task();
        task.process_status_message = Some(String::new());
        assert_eq!(decide(&task, 10, 700, Utc::now()), Decision::Restart);
    }

    #[test]
    fn test_surviving_ticket_txid_promotes_registered() {
        let mut task = failed_task();
        task.reg_ticket_txid = Some("regtx".into());
        assert_eq!(
            decide(&task, 10, 700, Utc::now()),
            Decision::PromoteRegistered
        );
    }

    #[test]
    fn test_errored_collection_keeps_upload_handle() {
        let mut task = failed_task();
        task.kind = TaskKind::Collection;
        task.collection_params = Some(json!({"item_type": "nft"}));
        assert_eq!(decide(&task, 10, 700, Utc::now()), Decision::Restart);
    }
}
