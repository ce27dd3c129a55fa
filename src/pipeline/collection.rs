/// Collection registration.
///
/// Collections have no file: the row is created at submit time and the
/// single `collection_register` stage sends the ticket. The fee is a
/// fixed network constant rather than a size-based quote.
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{GatewayError, Result};
use crate::state::models::TaskStatus;
use crate::state::repository;

use super::stages::find_spendable_address;
use super::PipelineCtx;

/// Parameters of a collection ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionParams {
    /// "nft" or "sense".
    pub item_type: String,
    pub collection_name: String,
    pub max_collection_entries: i64,
    pub collection_item_copy_count: i64,
    pub authorized_pastel_ids: Vec<String>,
    pub max_permitted_open_nsfw_score: f64,
    pub minimum_similarity_score_to_first_entry_in_collection: f64,
    pub no_of_days_to_finalize_collection: i64,
    pub royalty: f64,
    pub green: bool,
}

impl CollectionParams {
    /// Boundary checks the network would reject anyway; failing early
    /// keeps a doomed ticket from burning a fee.
    pub fn validate(&self) -> Result<()> {
        if self.item_type != "nft" && self.item_type != "sense" {
            return Err(GatewayError::Policy(format!(
                "item_type must be 'nft' or 'sense', got '{}'",
                self.item_type
            )));
        }
        if self.collection_name.trim().is_empty() {
            return Err(GatewayError::Policy("collection_name is empty".into()));
        }
        if self.max_collection_entries < 1 {
            return Err(GatewayError::Policy(
                "max_collection_entries must be positive".into(),
            ));
        }
        if self.collection_item_copy_count < 1 {
            return Err(GatewayError::Policy(
                "collection_item_copy_count must be positive".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.max_permitted_open_nsfw_score) {
            return Err(GatewayError::Policy(format!(
                "max_permitted_open_nsfw_score {} out of range [0, 1)",
                self.max_permitted_open_nsfw_score
            )));
        }
        if !(0.0..1.0).contains(&self.minimum_similarity_score_to_first_entry_in_collection) {
            return Err(GatewayError::Policy(
                "minimum similarity score out of range [0, 1)".into(),
            ));
        }
        if self.no_of_days_to_finalize_collection < 1 || self.no_of_days_to_finalize_collection > 7
        {
            return Err(GatewayError::Policy(format!(
                "no_of_days_to_finalize_collection {} out of range 1..=7",
                self.no_of_days_to_finalize_collection
            )));
        }
        if !(0.0..100.0).contains(&self.royalty) {
            return Err(GatewayError::Policy(format!(
                "royalty {} out of range [0, 100)",
                self.royalty
            )));
        }
        Ok(())
    }
}

/// WalletNode collection register request.
fn register_form(params: &CollectionParams, app_pastelid: &str, spendable_address: &str) -> Value {
    json!({
        "app_pastelid": app_pastelid,
        "collection_item_copy_count": params.collection_item_copy_count,
        "collection_name": params.collection_name,
        "green": params.green,
        "item_type": params.item_type,
        "list_of_pastelids_of_authorized_contributors": params.authorized_pastel_ids,
        "max_collection_entries": params.max_collection_entries,
        "max_permitted_open_nsfw_score": params.max_permitted_open_nsfw_score,
        "minimum_similarity_score_to_first_entry_in_collection":
            params.minimum_similarity_score_to_first_entry_in_collection,
        "no_of_days_to_finalize_collection": params.no_of_days_to_finalize_collection,
        "royalty": params.royalty,
        "spendable_address": spendable_address,
    })
}

/// Send the collection ticket to WalletNode.
pub async fn register(ctx: &PipelineCtx, task_id: Uuid) -> Result<()> {
    let task = ctx.load_task(task_id).await?;

    if task.process_status != TaskStatus::New && task.process_status != TaskStatus::Restarted {
        warn!(%task_id, status = ?task.process_status, "collection register: wrong task state, skipping");
        return Ok(());
    }

    let raw = task.collection_params.clone().ok_or_else(|| {
        GatewayError::Invariant(format!("task {task_id} has no collection params"))
    })?;
    let params: CollectionParams = serde_json::from_value(raw)
        .map_err(|e| GatewayError::Serialization(format!("bad collection params: {e}")))?;
    params.validate()?;

    let fee = ctx.config.collection_reg_fee;
    let balances = ctx.rpc.list_address_amounts().await?;
    let spendable = match find_spendable_address(&balances, fee) {
        Some(address) => address,
        None => {
            ctx.alerts
                .raise(
                    "no spendable address",
                    &format!("no wallet address can cover the {fee} collection fee"),
                )
                .await;
            return Err(GatewayError::Policy(format!(
                "no spendable address found for amount > {fee}"
            )));
        }
    };

    let form = register_form(&params, &task.pastel_id, &spendable);
    let passphrase = ctx.secrets.passphrase(&task.pastel_id).await?;
    let wn_task_id = ctx
        .wn
        .start_task(task.kind.wn_service(), "", form, &passphrase)
        .await?;

    info!(%task_id, wn_task_id, item_type = params.item_type, "collection registration started");
    repository::mark_started(ctx.db.pool(), task_id, &wn_task_id).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_params() -> CollectionParams {
        CollectionParams {
            item_type: "nft".into(),
            collection_name: "Landscapes".into(),
            max_collection_entries: 100,
            collection_item_copy_count: 1,
            authorized_pastel_ids: vec!["jXcontrib".into()],
            max_permitted_open_nsfw_score: 0.5,
            minimum_similarity_score_to_first_entry_in_collection: 0.3,
            no_of_days_to_finalize_collection: 7,
            royalty: 10.0,
            green: false,
        }
    }

    #[test]
    fn test_valid_params_pass() {
        assert!(valid_params().validate().is_ok());
    }

    #[test]
    fn test_item_type_must_be_known() {
        let mut params = valid_params();
        params.item_type = "cascade".into();
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_entry_count_boundaries() {
        let mut params = valid_params();
        params.max_collection_entries = 0;
        assert!(params.validate().is_err());
        params.max_collection_entries = 1;
        assert!(params.validate().is_ok());
        params.max_collection_entries = 1_000_000;
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_score_ranges_exclude_upper_bound() {
        let mut params = valid_params();
        params.max_permitted_open_nsfw_score = 0.0;
        assert!(params.validate().is_ok());
        params.max_permitted_open_nsfw_score = 0.999;
        assert!(params.validate().is_ok());
        params.max_permitted_open_nsfw_score = 1.0;
        assert!(params.validate().is_err());
        params.max_permitted_open_nsfw_score = 0.5;

        params.minimum_similarity_score_to_first_entry_in_collection = 1.0;
        assert!(params.validate().is_err());
        params.minimum_similarity_score_to_first_entry_in_collection = 0.0;
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_royalty_range_excludes_upper_bound() {
        let mut params = valid_params();
        params.royalty = 50.0;
        assert!(params.validate().is_ok());
        params.royalty = 99.9;
        assert!(params.validate().is_ok());
        params.royalty = 100.0;
        assert!(params.validate().is_err());
        params.royalty = -0.1;
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_finalize_window_boundaries() {
        let mut params = valid_params();
        params.no_of_days_to_finalize_collection = 0;
        assert!(params.validate().is_err());
        params.no_of_days_to_finalize_collection = 8;
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_form_carries_contributors() {
        let params = valid_params();
        let form = register_form(&params, "jXgw", "addr1");
        assert_eq!(form["app_pastelid"], "jXgw");
        assert_eq!(
            form["list_of_pastelids_of_authorized_contributors"][0],
            "jXcontrib"
        );
        assert_eq!(form["spendable_address"], "addr1");
    }
}
