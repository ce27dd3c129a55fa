/// Preburn transaction pool.
///
/// Action registrations burn a fifth of the fee before the ticket is
/// submitted. Burns take blocks to confirm, so the pool keeps a stock of
/// pre-made burns per fee tier and hands confirmed ones to tasks.
///
/// Row states: NEW (spendable), PENDING (bound to a task), USED (backs a
/// registered ticket), BAD (vanished from the chain). Row selection uses
/// `FOR UPDATE SKIP LOCKED` so concurrent workers never fight over one
/// burn.
use std::collections::HashMap;

use sqlx::{PgPool, Postgres, Transaction};
use tracing::{info, warn};
use uuid::Uuid;

use crate::alert::AlertSink;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::rpc::PastelRpc;
use crate::state::models::{BurnTx, BurnTxStatus};
use crate::state::repository;
use crate::state::Database;

/// What the chain knows about a burn txid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainCheck {
    /// On chain and not referenced by any registration ticket.
    Spendable,
    /// A registration ticket already references this burn.
    UsedByTicket,
    /// The chain has no such transaction.
    Missing,
}

/// Classify a burn txid from the three chain lookups.
fn classify_chain_check(nft_ticket: bool, action_ticket: bool, raw_tx: bool) -> ChainCheck {
    if nft_ticket || action_ticket {
        ChainCheck::UsedByTicket
    } else if raw_tx {
        ChainCheck::Spendable
    } else {
        ChainCheck::Missing
    }
}

/// A burn is spendable only after it has aged past the confirmation depth.
fn is_confirmed(burn_height: i64, tip_height: i64, depth: i64) -> bool {
    burn_height + depth <= tip_height
}

/// Burn amount for a quoted registration fee. The network requires a
/// fifth of the fee, quantized down.
pub fn burn_amount_for_fee(wn_fee: i64) -> i64 {
    wn_fee / 5
}

/// Whole coins spendable across the wallet. Fractions are floored per
/// address; sub-coin dust cannot fund a burn anyway.
fn spendable_total(balances: &HashMap<String, f64>) -> i64 {
    balances.values().map(|v| v.floor() as i64).sum()
}

pub struct BurnPool {
    pool: PgPool,
    rpc: PastelRpc,
    burn_address: String,
    confirmation_blocks: i64,
    max_size_for_preburn_mb: u64,
    pool_target: i64,
}

impl BurnPool {
    pub fn new(db: &Database, rpc: PastelRpc, config: &GatewayConfig) -> Self {
        Self {
            pool: db.pool().clone(),
            rpc,
            burn_address: config.burn_address.clone(),
            confirmation_blocks: config.burn_confirmation_blocks,
            max_size_for_preburn_mb: config.max_size_for_preburn_mb,
            pool_target: config.preburn_pool_target,
        }
    }

    /// Check a burn txid against the chain.
    pub async fn check_tx(&self, txid: &str) -> Result<ChainCheck> {
        let nft = self.rpc.tickets_find("nft", txid).await?.is_some();
        let action = if nft {
            false
        } else {
            self.rpc.tickets_find("action", txid).await?.is_some()
        };
        let raw = if nft || action {
            true
        } else {
            self.rpc.get_raw_transaction(txid).await?.is_some()
        };
        Ok(classify_chain_check(nft, action, raw))
    }

    /// Acquire a burn transaction for a task.
    ///
    /// Returns the row bound to the task; the caller must still verify
    /// confirmation depth before submitting the registration. When the
    /// pool only holds unconfirmed rows of this tier the call fails with
    /// a retryable [`GatewayError::BurnNotConfirmed`].
    pub async fn acquire(&self, task_id: Uuid, fee: i64, tip_height: i64) -> Result<BurnTx> {
        if let Some(existing) = self.get_bound(task_id).await? {
            info!(txid = %existing.txid, %task_id, "burn already bound to task");
            return Ok(existing);
        }

        let mut txn = self.pool.begin().await?;

        let candidates = sqlx::query_as::<_, BurnTx>(
            r#"
            SELECT * FROM burn_txs
            WHERE fee = $1 AND status = 'new'
            ORDER BY height
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(fee)
        .fetch_all(&mut *txn)
        .await?;

        let mut pending = 0usize;
        for candidate in candidates {
            if !is_confirmed(candidate.height, tip_height, self.confirmation_blocks) {
                pending += 1;
                continue;
            }
            match self.check_tx(&candidate.txid).await? {
                ChainCheck::Spendable => {
                    let bound = bind_to_task(&mut txn, candidate.id, task_id).await?;
                    txn.commit().await?;
                    info!(txid = %bound.txid, %task_id, "bound pooled burn to task");
                    return Ok(bound);
                }
                ChainCheck::UsedByTicket => {
                    warn!(txid = %candidate.txid, "pooled burn already used, marking");
                    set_status(&mut txn, candidate.id, BurnTxStatus::Used).await?;
                }
                ChainCheck::Missing => {
                    warn!(txid = %candidate.txid, "pooled burn not on chain, marking bad");
                    set_status(&mut txn, candidate.id, BurnTxStatus::Bad).await?;
                }
            }
        }
        txn.commit().await?;

        if pending > 0 {
            return Err(GatewayError::BurnNotConfirmed(format!(
                "{pending} pooled burn(s) of fee {fee} not confirmed yet"
            )));
        }

        // Pool is empty for this tier, burn fresh
        info!(fee, %task_id, "no pooled burn available, sending a new one");
        let txid = self.rpc.send_to_address(&self.burn_address, fee).await?;
        let burn = self
            .insert(fee, tip_height, &txid, BurnTxStatus::Pending, Some(task_id))
            .await?;
        Ok(burn)
    }

    /// Whether a burn row has aged past the confirmation depth.
    pub fn confirmed(&self, burn: &BurnTx, tip_height: i64) -> bool {
        is_confirmed(burn.height, tip_height, self.confirmation_blocks)
    }

    pub async fn get_bound(&self, task_id: Uuid) -> Result<Option<BurnTx>> {
        Ok(
            sqlx::query_as::<_, BurnTx>("SELECT * FROM burn_txs WHERE task_id = $1")
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    /// Return a burn to the pool.
    pub async fn release(&self, txid: &str) -> Result<()> {
        sqlx::query(
            "UPDATE burn_txs SET status = 'new', task_id = NULL, updated_at = NOW() WHERE txid = $1",
        )
        .bind(txid)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_used(&self, txid: &str) -> Result<()> {
        sqlx::query("UPDATE burn_txs SET status = 'used', updated_at = NOW() WHERE txid = $1")
            .bind(txid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_bad(&self, txid: &str) -> Result<()> {
        sqlx::query("UPDATE burn_txs SET status = 'bad', updated_at = NOW() WHERE txid = $1")
            .bind(txid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert(
        &self,
        fee: i64,
        height: i64,
        txid: &str,
        status: BurnTxStatus,
        task_id: Option<Uuid>,
    ) -> Result<BurnTx> {
        Ok(sqlx::query_as::<_, BurnTx>(
            r#"
            INSERT INTO burn_txs (id, fee, height, txid, status, task_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW(), NOW())
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(fee)
        .bind(height)
        .bind(txid)
        .bind(status)
        .bind(task_id)
        .fetch_one(&self.pool)
        .await?)
    }

    /// Reconcile the pool against the chain and the task table.
    ///
    /// Bound and used rows whose ticket never materialized and whose task
    /// died are released back to the pool. NEW rows that vanished from
    /// the chain are marked BAD.
    pub async fn reconcile(&self) -> Result<()> {
        let held = sqlx::query_as::<_, BurnTx>(
            "SELECT * FROM burn_txs WHERE status IN ('used', 'pending')",
        )
        .fetch_all(&self.pool)
        .await?;

        for burn in held {
            match self.check_tx(&burn.txid).await? {
                ChainCheck::UsedByTicket => {
                    if burn.status == BurnTxStatus::Pending {
                        self.mark_used(&burn.txid).await?;
                    }
                }
                _ => {
                    let live = repository::count_tasks_using_burn_txid(&self.pool, &burn.txid)
                        .await?;
                    if live > 0 {
                        if burn.status == BurnTxStatus::Pending {
                            self.mark_used(&burn.txid).await?;
                        }
                    } else {
                        info!(txid = %burn.txid, "no ticket or live task holds burn, releasing");
                        self.release(&burn.txid).await?;
                    }
                }
            }
        }

        let fresh =
            sqlx::query_as::<_, BurnTx>("SELECT * FROM burn_txs WHERE status = 'new'")
                .fetch_all(&self.pool)
                .await?;

        for burn in fresh {
            match self.check_tx(&burn.txid).await? {
                ChainCheck::Missing => self.mark_bad(&burn.txid).await?,
                ChainCheck::UsedByTicket => self.mark_used(&burn.txid).await?,
                ChainCheck::Spendable => {}
            }
        }

        Ok(())
    }

    /// Top the pool up to its per-tier target.
    ///
    /// Quotes action fees for each file size up to the preburn cap and
    /// burns until every tier holds `pool_target` NEW rows. Stops early
    /// when the wallet cannot cover the next burn.
    pub async fn prewarm(&self, alerts: &dyn AlertSink) -> Result<()> {
        let mut wanted: Vec<i64> = Vec::new();
        for size_mb in 1..=self.max_size_for_preburn_mb {
            let (cascade_fee, sense_fee) = self.rpc.get_action_fees(size_mb).await?;
            for fee in [burn_amount_for_fee(cascade_fee), burn_amount_for_fee(sense_fee)] {
                let have = self.count_new_by_fee(fee).await?;
                for _ in have..self.pool_target {
                    wanted.push(fee);
                }
            }
        }

        if wanted.is_empty() {
            return Ok(());
        }

        let tip_height = self.rpc.get_block_count().await?;
        let balances = self.rpc.list_address_amounts().await?;
        let mut available = spendable_total(&balances);

        info!(burns = wanted.len(), "topping up preburn pool");
        for fee in wanted {
            if available < fee {
                warn!(fee, available, "wallet cannot cover next preburn");
                alerts
                    .raise(
                        "preburn pool top-up stopped",
                        &format!("wallet balance {available} cannot cover a {fee} burn"),
                    )
                    .await;
                return Ok(());
            }
            let txid = self.rpc.send_to_address(&self.burn_address, fee).await?;
            self.insert(fee, tip_height, &txid, BurnTxStatus::New, None)
                .await?;
            available -= fee;
        }

        Ok(())
    }

    async fn count_new_by_fee(&self, fee: i64) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM burn_txs WHERE fee = $1 AND status = 'new'",
        )
        .bind(fee)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

async fn bind_to_task(
    txn: &mut Transaction<'_, Postgres>,
    burn_id: Uuid,
    task_id: Uuid,
) -> Result<BurnTx> {
    Ok(sqlx::query_as::<_, BurnTx>(
        r#"
        UPDATE burn_txs SET status = 'pending', task_id = $2, updated_at = NOW()
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(burn_id)
    .bind(task_id)
    .fetch_one(&mut **txn)
    .await?)
}

async fn set_status(
    txn: &mut Transaction<'_, Postgres>,
    burn_id: Uuid,
    status: BurnTxStatus,
) -> Result<()> {
    sqlx::query("UPDATE burn_txs SET status = $2, updated_at = NOW() WHERE id = $1")
        .bind(burn_id)
        .bind(status)
        .execute(&mut **txn)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burn_amount_is_a_fifth_rounded_down() {
        assert_eq!(burn_amount_for_fee(500), 100);
        assert_eq!(burn_amount_for_fee(501), 100);
        assert_eq!(burn_amount_for_fee(504), 100);
        assert_eq!(burn_amount_for_fee(505), 101);
        assert_eq!(burn_amount_for_fee(4), 0);
    }

    #[test]
    fn test_confirmation_depth() {
        // burned at 100, depth 5: spendable from tip 105 onward
        assert!(!is_confirmed(100, 104, 5));
        assert!(is_confirmed(100, 105, 5));
        assert!(is_confirmed(100, 200, 5));
    }

    #[test]
    fn test_spendable_total_floors_each_address() {
        let mut balances = HashMap::new();
        balances.insert("addr1".to_string(), 10.9);
        balances.insert("addr2".to_string(), 0.9);
        balances.insert("addr3".to_string(), 3.0);
        // 10 + 0 + 3, not round(14.8)
        assert_eq!(spendable_total(&balances), 13);
        assert_eq!(spendable_total(&HashMap::new()), 0);
    }

    #[test]
    fn test_chain_check_classification() {
        assert_eq!(classify_chain_check(true, false, true), ChainCheck::UsedByTicket);
        assert_eq!(classify_chain_check(false, true, true), ChainCheck::UsedByTicket);
        assert_eq!(classify_chain_check(false, false, true), ChainCheck::Spendable);
        assert_eq!(classify_chain_check(false, false, false), ChainCheck::Missing);
    }
}
