/// Repository layer: typed database queries for the gateway.
///
/// All queries use sqlx runtime-checked queries (not compile-time checked)
/// to avoid requiring a live database during development builds.
use chrono::Utc;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use super::models::*;
use crate::error::Result;

/// Fields known at task creation time.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub kind: TaskKind,
    pub owner_id: Uuid,
    pub request_id: String,
    pub result_id: String,
    pub pastel_id: String,
    pub original_file_name: Option<String>,
    pub original_file_content_type: Option<String>,
    pub original_file_local_path: Option<String>,
    pub original_file_ipfs_cid: Option<String>,
    pub original_file_hash: Option<Vec<u8>>,
    pub make_publicly_accessible: bool,
    pub open_api_group_id: Option<String>,
    pub offer_ticket_intended_rcpt_pastel_id: Option<String>,
    pub collection_act_txid: Option<String>,
    pub height: i64,
    pub nft_properties: Option<Value>,
    pub collection_params: Option<Value>,
}

// ── Tasks ──

pub async fn create_task(pool: &PgPool, new: NewTask) -> Result<Task> {
    let id = Uuid::now_v7();
    let now = Utc::now();

    let task = sqlx::query_as::<_, Task>(
        r#"
        INSERT INTO tasks
        (id, kind, owner_id, request_id, result_id, pastel_id,
         original_file_name, original_file_content_type, original_file_local_path,
         original_file_ipfs_cid, original_file_hash,
         wn_fee, make_publicly_accessible, open_api_group_id,
         offer_ticket_intended_rcpt_pastel_id, collection_act_txid,
         height, process_status, retry_num, nft_properties, collection_params,
         created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
                0, $12, $13, $14, $15, $16, 'NEW', 0, $17, $18, $19, $19)
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(new.kind)
    .bind(new.owner_id)
    .bind(&new.request_id)
    .bind(&new.result_id)
    .bind(&new.pastel_id)
    .bind(&new.original_file_name)
    .bind(&new.original_file_content_type)
    .bind(&new.original_file_local_path)
    .bind(&new.original_file_ipfs_cid)
    .bind(&new.original_file_hash)
    .bind(new.make_publicly_accessible)
    .bind(&new.open_api_group_id)
    .bind(&new.offer_ticket_intended_rcpt_pastel_id)
    .bind(&new.collection_act_txid)
    .bind(new.height)
    .bind(&new.nft_properties)
    .bind(&new.collection_params)
    .bind(now)
    .fetch_one(pool)
    .await?;

    Ok(task)
}

pub async fn get_task(pool: &PgPool, task_id: Uuid) -> Result<Option<Task>> {
    Ok(sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(task_id)
        .fetch_optional(pool)
        .await?)
}

pub async fn get_task_by_result_id(pool: &PgPool, result_id: &str) -> Result<Option<Task>> {
    Ok(
        sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE result_id = $1")
            .bind(result_id)
            .fetch_optional(pool)
            .await?,
    )
}

pub async fn list_tasks_by_request(
    pool: &PgPool,
    request_id: &str,
    owner_id: Uuid,
) -> Result<Vec<Task>> {
    Ok(sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE request_id = $1 AND owner_id = $2 ORDER BY created_at",
    )
    .bind(request_id)
    .bind(owner_id)
    .fetch_all(pool)
    .await?)
}

pub async fn update_status(
    pool: &PgPool,
    task_id: Uuid,
    status: TaskStatus,
    message: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE tasks
        SET process_status = $2,
            process_status_message = COALESCE($3, process_status_message),
            updated_at = $4
        WHERE id = $1
        "#,
    )
    .bind(task_id)
    .bind(status)
    .bind(message)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn set_status_message(pool: &PgPool, task_id: Uuid, message: &str) -> Result<()> {
    sqlx::query("UPDATE tasks SET process_status_message = $2, updated_at = $3 WHERE id = $1")
        .bind(task_id)
        .bind(message)
        .bind(Utc::now())
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn mark_uploaded(
    pool: &PgPool,
    task_id: Uuid,
    wn_file_id: &str,
    wn_fee: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE tasks
        SET process_status = 'UPLOADED',
            process_status_message = 'File was uploaded',
            wn_file_id = $2, wn_fee = $3, updated_at = $4
        WHERE id = $1
        "#,
    )
    .bind(task_id)
    .bind(wn_file_id)
    .bind(wn_fee)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn mark_preburned(pool: &PgPool, task_id: Uuid, burn_txid: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE tasks
        SET process_status = 'PREBURN_FEE',
            process_status_message = 'Found valid and confirmed pre-burn transaction',
            burn_txid = $2, updated_at = $3
        WHERE id = $1
        "#,
    )
    .bind(task_id)
    .bind(burn_txid)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn mark_started(pool: &PgPool, task_id: Uuid, wn_task_id: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE tasks
        SET process_status = 'STARTED',
            process_status_message = 'Registration started',
            wn_task_id = $2, updated_at = $3
        WHERE id = $1
        "#,
    )
    .bind(task_id)
    .bind(wn_task_id)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(())
}

/// Record the registration txid without touching the status. The
/// finisher promotes to REGISTERED separately once activation is still
/// pending.
pub async fn set_reg_ticket_txid(pool: &PgPool, task_id: Uuid, reg_ticket_txid: &str) -> Result<()> {
    sqlx::query("UPDATE tasks SET reg_ticket_txid = $2, updated_at = $3 WHERE id = $1")
        .bind(task_id)
        .bind(reg_ticket_txid)
        .bind(Utc::now())
        .execute(pool)
        .await?;

    Ok(())
}

/// Mark a task failed (ERROR) or registered elsewhere (EXISTING),
/// optionally detaching its burn.
pub async fn mark_failed(
    pool: &PgPool,
    task_id: Uuid,
    status: TaskStatus,
    message: &str,
    clear_burn: bool,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE tasks
        SET process_status = $2,
            process_status_message = $3,
            burn_txid = CASE WHEN $4 THEN NULL ELSE burn_txid END,
            updated_at = $5
        WHERE id = $1
        "#,
    )
    .bind(task_id)
    .bind(status)
    .bind(message)
    .bind(clear_burn)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn mark_registered(pool: &PgPool, task_id: Uuid, reg_ticket_txid: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE tasks
        SET process_status = 'REGISTERED',
            process_status_message = 'Registration ticket accepted',
            reg_ticket_txid = $2, updated_at = $3
        WHERE id = $1
        "#,
    )
    .bind(task_id)
    .bind(reg_ticket_txid)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn mark_done(
    pool: &PgPool,
    task_id: Uuid,
    act_ticket_txid: &str,
    stored_file_ipfs_cid: Option<&str>,
    nft_dd_ipfs_cid: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE tasks
        SET process_status = 'DONE',
            process_status_message = 'Registration activated',
            act_ticket_txid = $2,
            stored_file_ipfs_cid = COALESCE($3, stored_file_ipfs_cid),
            nft_dd_ipfs_cid = COALESCE($4, nft_dd_ipfs_cid),
            updated_at = $5
        WHERE id = $1
        "#,
    )
    .bind(task_id)
    .bind(act_ticket_txid)
    .bind(stored_file_ipfs_cid)
    .bind(nft_dd_ipfs_cid)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn set_offer_ticket(pool: &PgPool, task_id: Uuid, offer_txid: &str) -> Result<()> {
    sqlx::query("UPDATE tasks SET offer_ticket_txid = $2, updated_at = $3 WHERE id = $1")
        .bind(task_id)
        .bind(offer_txid)
        .bind(Utc::now())
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn set_original_file_path(pool: &PgPool, task_id: Uuid, path: &str) -> Result<()> {
    sqlx::query("UPDATE tasks SET original_file_local_path = $2, updated_at = $3 WHERE id = $1")
        .bind(task_id)
        .bind(path)
        .bind(Utc::now())
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn set_original_file_cid(pool: &PgPool, task_id: Uuid, cid: &str) -> Result<()> {
    sqlx::query("UPDATE tasks SET original_file_ipfs_cid = $2, updated_at = $3 WHERE id = $1")
        .bind(task_id)
        .bind(cid)
        .bind(Utc::now())
        .execute(pool)
        .await?;

    Ok(())
}

/// Bump the retry counter, returning the new value.
pub async fn increment_retry(pool: &PgPool, task_id: Uuid) -> Result<i32> {
    let (retry_num,): (i32,) = sqlx::query_as(
        "UPDATE tasks SET retry_num = retry_num + 1, updated_at = $2 WHERE id = $1 RETURNING retry_num",
    )
    .bind(task_id)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;

    Ok(retry_num)
}

/// Reset registration handles so a task can go through the pipeline again.
///
/// Stale ticket txids must go too, or the finisher would treat the next
/// run as already registered. Collections keep their fee and WalletNode
/// file id; for file tasks the upload must be redone so both are cleared.
const RESTART_CLEAR_SQL: &str = r#"
    UPDATE tasks
    SET process_status = 'RESTARTED',
        process_status_message = 'Scheduled for re-registration',
        wn_task_id = NULL,
        burn_txid = NULL,
        reg_ticket_txid = NULL,
        act_ticket_txid = NULL,
        wn_file_id = CASE WHEN $2 THEN wn_file_id ELSE NULL END,
        wn_fee = CASE WHEN $2 THEN wn_fee ELSE 0 END,
        updated_at = $3
    WHERE id = $1
"#;

pub async fn clear_registration_handles(pool: &PgPool, task_id: Uuid, keep_upload: bool) -> Result<()> {
    sqlx::query(RESTART_CLEAR_SQL)
        .bind(task_id)
        .bind(keep_upload)
        .bind(Utc::now())
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn list_by_status(pool: &PgPool, status: TaskStatus) -> Result<Vec<Task>> {
    Ok(sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE process_status = $1 ORDER BY updated_at",
    )
    .bind(status)
    .fetch_all(pool)
    .await?)
}

/// Tasks the finisher watches: registration started or ticket written
/// but not yet activated.
pub async fn list_awaiting_finish(pool: &PgPool, kind: TaskKind) -> Result<Vec<Task>> {
    Ok(sqlx::query_as::<_, Task>(
        r#"
        SELECT * FROM tasks
        WHERE kind = $1 AND process_status IN ('STARTED', 'REGISTERED')
        ORDER BY updated_at
        "#,
    )
    .bind(kind)
    .fetch_all(pool)
    .await?)
}

/// Failed tasks eligible for another attempt, oldest first.
pub async fn list_for_reprocessing(pool: &PgPool, limit: i64) -> Result<Vec<Task>> {
    Ok(sqlx::query_as::<_, Task>(
        r#"
        SELECT * FROM tasks
        WHERE process_status = 'ERROR'
           OR (process_status_message IS NULL AND process_status NOT IN
               ('DONE', 'DEAD', 'EXISTING', 'RESTARTED'))
        ORDER BY updated_at
        LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?)
}

pub async fn list_restarted(pool: &PgPool, limit: i64) -> Result<Vec<Task>> {
    Ok(sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE process_status = 'RESTARTED' ORDER BY updated_at LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?)
}

/// Number of live tasks referencing a burn txid. Used by the reconcile
/// pass before releasing a pool row.
pub async fn count_tasks_using_burn_txid(pool: &PgPool, burn_txid: &str) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*) FROM tasks
        WHERE burn_txid = $1 AND process_status NOT IN ('DONE', 'DEAD', 'ERROR')
        "#,
    )
    .bind(burn_txid)
    .fetch_one(pool)
    .await?;

    Ok(count)
}

// ── History log ──

pub async fn upsert_history(
    pool: &PgPool,
    task_id: Uuid,
    wn_file_id: Option<&str>,
    wn_task_id: &str,
    status_messages: &Value,
) -> Result<()> {
    let id = Uuid::now_v7();
    let now = Utc::now();

    sqlx::query(
        r#"
        INSERT INTO history_log (id, task_id, wn_file_id, wn_task_id, status_messages, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $6)
        ON CONFLICT (task_id, wn_task_id)
        DO UPDATE SET status_messages = $5, updated_at = $6
        "#,
    )
    .bind(id)
    .bind(task_id)
    .bind(wn_file_id)
    .bind(wn_task_id)
    .bind(status_messages)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn latest_history(pool: &PgPool, task_id: Uuid) -> Result<Option<HistoryLogEntry>> {
    Ok(sqlx::query_as::<_, HistoryLogEntry>(
        "SELECT * FROM history_log WHERE task_id = $1 ORDER BY updated_at DESC LIMIT 1",
    )
    .bind(task_id)
    .fetch_optional(pool)
    .await?)
}

// ── Registration ticket index ──

pub async fn upsert_reg_ticket(
    pool: &PgPool,
    data_hash: &[u8],
    kind: TaskKind,
    reg_ticket_txid: &str,
) -> Result<()> {
    let id = Uuid::now_v7();

    sqlx::query(
        r#"
        INSERT INTO reg_tickets (id, data_hash, kind, reg_ticket_txid, created_at)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (data_hash, kind)
        DO UPDATE SET reg_ticket_txid = $4
        "#,
    )
    .bind(id)
    .bind(data_hash)
    .bind(kind)
    .bind(reg_ticket_txid)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn find_reg_ticket(
    pool: &PgPool,
    data_hash: &[u8],
    kind: TaskKind,
) -> Result<Option<RegTicketEntry>> {
    Ok(sqlx::query_as::<_, RegTicketEntry>(
        "SELECT * FROM reg_tickets WHERE data_hash = $1 AND kind = $2",
    )
    .bind(data_hash)
    .bind(kind)
    .fetch_optional(pool)
    .await?)
}

// ── Accounts ──

pub async fn get_account(pool: &PgPool, account_id: Uuid) -> Result<Option<Account>> {
    Ok(
        sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE id = $1")
            .bind(account_id)
            .fetch_optional(pool)
            .await?,
    )
}

pub async fn create_account(pool: &PgPool, balance: i64) -> Result<Account> {
    let id = Uuid::now_v7();
    let now = Utc::now();

    Ok(sqlx::query_as::<_, Account>(
        r#"
        INSERT INTO accounts (id, balance, created_at, updated_at)
        VALUES ($1, $2, $3, $3)
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(balance)
    .bind(now)
    .fetch_one(pool)
    .await?)
}

/// Credit (positive) or debit (negative) an account balance.
pub async fn adjust_balance(pool: &PgPool, account_id: Uuid, delta: i64) -> Result<i64> {
    let (balance,): (i64,) = sqlx::query_as(
        "UPDATE accounts SET balance = balance + $2, updated_at = $3 WHERE id = $1 RETURNING balance",
    )
    .bind(account_id)
    .bind(delta)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;

    Ok(balance)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_wipes_every_registration_field() {
        // a revived task must re-derive all of these from scratch
        for field in [
            "wn_task_id = NULL",
            "burn_txid = NULL",
            "reg_ticket_txid = NULL",
            "act_ticket_txid = NULL",
        ] {
            assert!(RESTART_CLEAR_SQL.contains(field), "{field}");
        }
        // upload handles are cleared unless the caller keeps them
        assert!(RESTART_CLEAR_SQL.contains("wn_file_id = CASE WHEN $2"));
        assert!(RESTART_CLEAR_SQL.contains("wn_fee = CASE WHEN $2"));
        assert!(RESTART_CLEAR_SQL.contains("'RESTARTED'"));
    }
}
