/// Database models for the registration pipeline.
///
/// These structs map directly to PostgreSQL tables and are used for both
/// reading and writing via sqlx. Enum columns are native Postgres enum
/// types.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

use crate::walletnode::WnService;

/// Lifecycle status of a registration task.
///
/// ```text
/// NEW -> UPLOADED -> PREBURN_FEE -> STARTED -> REGISTERED -> DONE
///          (NFT skips PREBURN_FEE, collections start at STARTED)
///
/// any non-terminal -> ERROR -> RESTARTED -> back through the pipeline
///                          \-> STARTED    (identifiers survived)
///                          \-> DEAD       (retry cap reached)
/// ```
///
/// DONE, DEAD and EXISTING are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "process_status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    New,
    Uploaded,
    PreburnFee,
    Started,
    Registered,
    Done,
    Error,
    Restarted,
    Dead,
    Existing,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Dead | TaskStatus::Existing)
    }

    /// Whether the status transition is allowed by the lifecycle graph.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        if self.is_terminal() {
            return false;
        }
        if next == Error {
            return true;
        }
        matches!(
            (self, next),
            (New, Uploaded)
                | (New, Started)
                | (Uploaded, PreburnFee)
                | (Uploaded, Started)
                | (PreburnFee, Started)
                | (Started, Registered)
                | (Started, Existing)
                | (Registered, Done)
                | (Error, Restarted)
                | (Error, Started)
                | (Error, Dead)
                | (Restarted, New)
                | (Restarted, Uploaded)
                | (Restarted, Dead)
        )
    }
}

/// Ticket family of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "task_kind", rename_all = "snake_case")]
pub enum TaskKind {
    Cascade,
    Sense,
    Nft,
    Collection,
}

impl TaskKind {
    pub fn wn_service(&self) -> WnService {
        match self {
            TaskKind::Cascade => WnService::Cascade,
            TaskKind::Sense => WnService::Sense,
            TaskKind::Nft => WnService::Nft,
            TaskKind::Collection => WnService::Collection,
        }
    }

    /// NFT fees are paid inside the registration ticket, and collection
    /// registrations carry a fixed fee, so neither uses the preburn pool.
    pub fn uses_preburn(&self) -> bool {
        matches!(self, TaskKind::Cascade | TaskKind::Sense)
    }

    /// Ticket verb for `tickets find` registration lookups.
    pub fn reg_ticket_verb(&self) -> &'static str {
        match self {
            TaskKind::Nft => "nft",
            TaskKind::Cascade | TaskKind::Sense => "action",
            TaskKind::Collection => "collection",
        }
    }
}

/// Status of a preburn transaction in the pool.
///
/// NEW rows are spendable, PENDING rows are bound to a task, USED rows
/// back a registered ticket, BAD rows vanished from the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "burn_tx_status", rename_all = "snake_case")]
pub enum BurnTxStatus {
    New,
    Pending,
    Used,
    Bad,
}

/// A registration task.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub kind: TaskKind,
    pub owner_id: Uuid,
    /// Groups the tasks of one client submission.
    pub request_id: String,
    /// Client-visible id of this task within the request.
    pub result_id: String,
    /// PastelID the ticket is authored with.
    pub pastel_id: String,

    pub original_file_name: Option<String>,
    pub original_file_content_type: Option<String>,
    pub original_file_local_path: Option<String>,
    pub original_file_ipfs_cid: Option<String>,
    /// SHA-256 of the artifact bytes, for the registration index.
    pub original_file_hash: Option<Vec<u8>>,

    /// WalletNode upload handle.
    pub wn_file_id: Option<String>,
    /// WalletNode registration task handle.
    pub wn_task_id: Option<String>,
    /// Quoted registration fee.
    pub wn_fee: i64,
    pub burn_txid: Option<String>,

    pub reg_ticket_txid: Option<String>,
    pub act_ticket_txid: Option<String>,
    /// CID of the finished artifact copy the gateway archived.
    pub stored_file_ipfs_cid: Option<String>,
    /// CID of the duplicate-detection report, where the family has one.
    pub nft_dd_ipfs_cid: Option<String>,

    pub make_publicly_accessible: bool,
    pub collection_act_txid: Option<String>,
    pub open_api_group_id: Option<String>,
    pub offer_ticket_intended_rcpt_pastel_id: Option<String>,
    pub offer_ticket_txid: Option<String>,

    /// Chain height when the task was created.
    pub height: i64,
    pub process_status: TaskStatus,
    pub process_status_message: Option<String>,
    pub retry_num: i32,

    /// NFT metadata (name, description, royalty, green, ...).
    pub nft_properties: Option<Value>,
    /// Collection parameters for collection tasks.
    pub collection_params: Option<Value>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// A task can be promoted straight back to STARTED only when the
    /// WalletNode handles that identify the running registration survive.
    pub fn has_live_identifiers(&self) -> bool {
        self.wn_task_id.is_some() && (self.wn_file_id.is_some() || self.kind == TaskKind::Collection)
    }
}

/// A preburn transaction row.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct BurnTx {
    pub id: Uuid,
    /// Burned amount in whole coins.
    pub fee: i64,
    /// Height at which the burn was sent.
    pub height: i64,
    pub txid: String,
    pub status: BurnTxStatus,
    /// Task this row is bound to, if any.
    pub task_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Audit log of WalletNode status histories.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct HistoryLogEntry {
    pub id: Uuid,
    pub task_id: Uuid,
    pub wn_file_id: Option<String>,
    pub wn_task_id: String,
    /// Raw status messages as WalletNode reported them.
    pub status_messages: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Public index entry mapping artifact data hashes to tickets.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RegTicketEntry {
    pub id: Uuid,
    pub data_hash: Vec<u8>,
    pub kind: TaskKind,
    pub reg_ticket_txid: String,
    pub created_at: DateTime<Utc>,
}

/// A gateway account with a fee balance.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    /// Balance available for registration fees, in whole coins.
    pub balance: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        use TaskStatus::*;
        assert!(New.can_transition_to(Uploaded));
        assert!(Uploaded.can_transition_to(PreburnFee));
        assert!(PreburnFee.can_transition_to(Started));
        assert!(Started.can_transition_to(Registered));
        assert!(Registered.can_transition_to(Done));
    }

    #[test]
    fn test_nft_and_collection_shortcuts() {
        use TaskStatus::*;
        // NFT skips the preburn stage
        assert!(Uploaded.can_transition_to(Started));
        // collections are created and started without an upload
        assert!(New.can_transition_to(Started));
    }

    #[test]
    fn test_any_active_status_can_fail() {
        use TaskStatus::*;
        for status in [New, Uploaded, PreburnFee, Started, Registered, Restarted] {
            assert!(status.can_transition_to(Error), "{status:?}");
        }
    }

    #[test]
    fn test_terminal_statuses_are_final() {
        use TaskStatus::*;
        for status in [Done, Dead, Existing] {
            assert!(status.is_terminal());
            assert!(!status.can_transition_to(Error));
            assert!(!status.can_transition_to(Restarted));
        }
    }

    #[test]
    fn test_error_recovery_paths() {
        use TaskStatus::*;
        assert!(Error.can_transition_to(Restarted));
        assert!(Error.can_transition_to(Started));
        assert!(Error.can_transition_to(Dead));
        assert!(!Error.can_transition_to(Done));
    }

    #[test]
    fn test_no_skipping_forward() {
        use TaskStatus::*;
        assert!(!New.can_transition_to(Registered));
        assert!(!Uploaded.can_transition_to(Done));
        assert!(!PreburnFee.can_transition_to(Registered));
    }

    #[test]
    fn test_preburn_only_for_action_families() {
        assert!(TaskKind::Cascade.uses_preburn());
        assert!(TaskKind::Sense.uses_preburn());
        assert!(!TaskKind::Nft.uses_preburn());
        assert!(!TaskKind::Collection.uses_preburn());
    }
}
