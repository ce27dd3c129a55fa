/// Registration pipeline.
///
/// Each task runs a chain of stages. The chain shape depends on the
/// ticket family:
///
/// ```text
/// cascade/sense:  register_file -> preburn_fee -> process
/// nft:            register_file -> process
/// collection:     collection_register
/// restart:        re_register_file -> (preburn_fee ->) process
/// ```
///
/// Stages are idempotent: a stage re-entered after a crash inspects the
/// task status and skips work already done. Failures are retried with
/// exponential backoff per the stage family's policy; a stage that
/// exhausts its retries (or fails non-retryably) marks the task ERROR
/// and leaves it for the re-processor.
pub mod collection;
pub mod nft;
pub mod queue;
pub mod stages;

use std::sync::Arc;

use tokio::time::{timeout, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::alert::AlertSink;
use crate::burnpool::BurnPool;
use crate::config::{GatewayConfig, StagePolicy};
use crate::error::{GatewayError, Result};
use crate::rpc::PastelRpc;
use crate::secrets::SecretStore;
use crate::state::models::{Task, TaskKind, TaskStatus};
use crate::state::repository;
use crate::state::Database;
use crate::storage::local::LocalCache;
use crate::storage::pinner::RemotePinner;
use crate::storage::BlobStore;
use crate::walletnode::WalletNodeClient;

/// Everything a stage needs to talk to the outside world.
#[derive(Clone)]
pub struct PipelineCtx {
    pub db: Database,
    pub rpc: PastelRpc,
    pub wn: WalletNodeClient,
    pub blobs: Arc<dyn BlobStore>,
    pub cache: LocalCache,
    pub pinner: Arc<RemotePinner>,
    pub burn_pool: Arc<BurnPool>,
    pub secrets: Arc<dyn SecretStore>,
    pub alerts: Arc<dyn AlertSink>,
    pub config: Arc<GatewayConfig>,
}

/// One step of a registration chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    RegisterFile,
    PreburnFee,
    Process,
    ReRegisterFile,
    CollectionRegister,
}

impl StageKind {
    pub fn name(&self) -> &'static str {
        match self {
            StageKind::RegisterFile => "register_file",
            StageKind::PreburnFee => "preburn_fee",
            StageKind::Process => "process",
            StageKind::ReRegisterFile => "re_register_file",
            StageKind::CollectionRegister => "collection_register",
        }
    }

    fn policy<'a>(&self, config: &'a GatewayConfig) -> &'a StagePolicy {
        let policies = &config.stage_policies;
        match self {
            StageKind::RegisterFile => &policies.register_file,
            StageKind::PreburnFee => &policies.preburn_fee,
            StageKind::Process => &policies.process,
            StageKind::ReRegisterFile => &policies.re_register_file,
            StageKind::CollectionRegister => &policies.collection_register,
        }
    }
}

/// Stage chain for a task family.
pub fn chain_for(kind: TaskKind, restart: bool) -> &'static [StageKind] {
    use StageKind::*;
    match (kind, restart) {
        (TaskKind::Cascade | TaskKind::Sense, false) => &[RegisterFile, PreburnFee, Process],
        (TaskKind::Cascade | TaskKind::Sense, true) => &[ReRegisterFile, PreburnFee, Process],
        (TaskKind::Nft, false) => &[RegisterFile, Process],
        (TaskKind::Nft, true) => &[ReRegisterFile, Process],
        (TaskKind::Collection, _) => &[CollectionRegister],
    }
}

impl PipelineCtx {
    pub async fn load_task(&self, task_id: Uuid) -> Result<Task> {
        repository::get_task(self.db.pool(), task_id)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("task {task_id}")))
    }
}

async fn execute_stage(ctx: &PipelineCtx, task_id: Uuid, stage: StageKind) -> Result<()> {
    match stage {
        StageKind::RegisterFile => stages::register_file(ctx, task_id).await,
        StageKind::PreburnFee => stages::preburn_fee(ctx, task_id).await,
        StageKind::Process => stages::process(ctx, task_id).await,
        StageKind::ReRegisterFile => stages::re_register_file(ctx, task_id).await,
        StageKind::CollectionRegister => collection::register(ctx, task_id).await,
    }
}

/// Run one stage with the family's retry policy.
///
/// The hard time limit cancels the attempt; a timed-out attempt counts
/// as a retryable failure. The soft limit only logs.
pub async fn run_stage_with_retry(
    ctx: &PipelineCtx,
    task_id: Uuid,
    stage: StageKind,
) -> Result<()> {
    let policy = stage.policy(&ctx.config);

    let mut attempt: u32 = 1;
    loop {
        let started = Instant::now();
        let outcome = timeout(policy.time_limit(), execute_stage(ctx, task_id, stage)).await;
        let elapsed = started.elapsed();
        if elapsed > policy.soft_time_limit() {
            warn!(
                stage = stage.name(),
                %task_id,
                elapsed_secs = elapsed.as_secs(),
                "stage ran past its soft time limit"
            );
        }

        let err = match outcome {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => e,
            Err(_) => GatewayError::WalletNode {
                status: 0,
                body: format!("stage {} timed out", stage.name()),
                retryable: true,
            },
        };

        if !err.is_retryable() || attempt >= policy.max_retries {
            return Err(err);
        }

        let backoff = policy.backoff_for(attempt);
        warn!(
            stage = stage.name(),
            %task_id,
            attempt,
            backoff_secs = backoff.as_secs(),
            error = %err,
            "stage failed, backing off"
        );
        repository::set_status_message(
            ctx.db.pool(),
            task_id,
            &format!("{}. Retrying", err),
        )
        .await?;
        tokio::time::sleep(backoff).await;
        attempt += 1;
    }
}

/// Run the whole chain for a task. A failed stage marks the task ERROR
/// and stops the chain; the re-processor picks it up later.
pub async fn run_chain(ctx: &PipelineCtx, task_id: Uuid, restart: bool) {
    let task = match ctx.load_task(task_id).await {
        Ok(task) => task,
        Err(e) => {
            error!(%task_id, error = %e, "cannot load task for pipeline run");
            return;
        }
    };

    let chain = chain_for(task.kind, restart);
    info!(%task_id, kind = ?task.kind, restart, "pipeline chain starting");

    for stage in chain {
        if let Err(e) = run_stage_with_retry(ctx, task_id, *stage).await {
            error!(stage = stage.name(), %task_id, error = %e, "stage failed permanently");
            let message = format!("{} failed: {e}", stage.name());
            if let Err(db_err) =
                repository::update_status(ctx.db.pool(), task_id, TaskStatus::Error, Some(&message))
                    .await
            {
                error!(%task_id, error = %db_err, "failed to mark task as ERROR");
            }
            return;
        }
    }

    info!(%task_id, "pipeline chain finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_shapes() {
        use StageKind::*;
        assert_eq!(
            chain_for(TaskKind::Cascade, false),
            &[RegisterFile, PreburnFee, Process]
        );
        assert_eq!(
            chain_for(TaskKind::Sense, false),
            &[RegisterFile, PreburnFee, Process]
        );
        assert_eq!(chain_for(TaskKind::Nft, false), &[RegisterFile, Process]);
        assert_eq!(chain_for(TaskKind::Collection, false), &[CollectionRegister]);
    }

    #[test]
    fn test_restart_chains_reupload() {
        use StageKind::*;
        assert_eq!(
            chain_for(TaskKind::Cascade, true),
            &[ReRegisterFile, PreburnFee, Process]
        );
        assert_eq!(chain_for(TaskKind::Nft, true), &[ReRegisterFile, Process]);
        assert_eq!(chain_for(TaskKind::Collection, true), &[CollectionRegister]);
    }
}
