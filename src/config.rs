/// Gateway configuration.
///
/// Loaded from a JSON file with serde, with every field defaulted so a
/// minimal file only needs the endpoints. Secrets (RPC credentials, the
/// funding address passphrase) are read from the environment, never from
/// the config file.
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

/// Retry policy for one stage family.
///
/// Backoff is exponential: `retry_backoff * 2^(attempt - 1)`, capped at
/// `retry_backoff_max`. `soft_time_limit` only logs a warning; the hard
/// `time_limit` cancels the stage attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagePolicy {
    pub retry_backoff_secs: u64,
    pub retry_backoff_max_secs: u64,
    pub max_retries: u32,
    pub soft_time_limit_secs: u64,
    pub time_limit_secs: u64,
}

impl Default for StagePolicy {
    fn default() -> Self {
        Self {
            retry_backoff_secs: 180,
            retry_backoff_max_secs: 36_000,
            max_retries: 15,
            soft_time_limit_secs: 300,
            time_limit_secs: 360,
        }
    }
}

impl StagePolicy {
    /// Backoff before the given retry attempt (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let base = self.retry_backoff_secs;
        let shift = attempt.saturating_sub(1).min(16);
        let secs = base.saturating_mul(1u64 << shift);
        Duration::from_secs(secs.min(self.retry_backoff_max_secs))
    }

    pub fn soft_time_limit(&self) -> Duration {
        Duration::from_secs(self.soft_time_limit_secs)
    }

    pub fn time_limit(&self) -> Duration {
        Duration::from_secs(self.time_limit_secs)
    }
}

/// Per-family stage policies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StagePolicies {
    pub register_file: StagePolicy,
    pub preburn_fee: StagePolicy,
    pub process: StagePolicy,
    pub re_register_file: StagePolicy,
    pub collection_register: StagePolicy,
}

/// Full gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// PostgreSQL connection URL.
    pub database_url: String,
    /// Pastel node JSON-RPC endpoint.
    pub rpc_url: String,
    /// WalletNode REST endpoint.
    pub walletnode_url: String,
    /// IPFS HTTP API endpoint.
    pub ipfs_api_url: String,
    /// Optional remote pinning service endpoint.
    pub pinner_url: Option<String>,
    /// Directory for the local artifact cache.
    pub local_cache_dir: PathBuf,

    /// Network burn address preburn fees are sent to.
    pub burn_address: String,
    /// Address that funds preburn transactions.
    pub funding_address: String,
    /// PastelID used to author tickets on behalf of the gateway.
    pub pastel_id: String,

    /// Number of pipeline workers.
    pub worker_count: usize,
    /// Bounded depth of the job channel.
    pub queue_depth: usize,

    pub stage_policies: StagePolicies,

    /// Seconds between finisher sweeps.
    pub finisher_interval_secs: u64,
    /// Seconds between re-processor sweeps.
    pub re_processor_interval_secs: u64,
    /// Seconds between fee pre-burner sweeps.
    pub fee_pre_burner_interval_secs: u64,
    /// Rows picked up per re-processor sweep.
    pub re_processor_limit: i64,
    /// Retries before a restarted task is declared dead.
    pub re_processor_retry_cap: i32,

    /// Blocks a burn tx must age before it is considered confirmed.
    pub burn_confirmation_blocks: i64,
    /// Tasks older than this many blocks with no history are errored out.
    pub finisher_age_limit_blocks: i64,
    /// Fee tiers (in whole coins) the pre-burner keeps warm.
    pub preburn_fee_tiers: Vec<i64>,
    /// NEW rows kept per tier.
    pub preburn_pool_target: i64,
    /// Files above this size (MB) never use the shared preburn pool.
    pub max_size_for_preburn_mb: u64,

    /// Fixed fee for a collection registration, in whole coins.
    pub collection_reg_fee: i64,
    /// Cap used when quoting an NFT fee from file size.
    pub nft_default_max_file_size_for_fee_mb: u64,
    /// Square thumbnail edge for NFT registration.
    pub nft_thumbnail_size_px: u32,

    /// Include raw WalletNode error text in status projections.
    pub return_detailed_wn_error: bool,
    /// External account manager owns the funding address; the control
    /// loops must not run while this is set.
    pub account_manager_enabled: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/pastel_gateway".into(),
            rpc_url: "http://localhost:19932".into(),
            walletnode_url: "http://localhost:8080".into(),
            ipfs_api_url: "http://localhost:5001".into(),
            pinner_url: None,
            local_cache_dir: PathBuf::from("/var/lib/pastel-gateway/cache"),
            burn_address: "PtpasteLBurnAddressXXXXXXXXXXbJ5ndd".into(),
            funding_address: String::new(),
            pastel_id: String::new(),
            worker_count: 8,
            queue_depth: 256,
            stage_policies: StagePolicies::default(),
            finisher_interval_secs: 600,
            re_processor_interval_secs: 700,
            fee_pre_burner_interval_secs: 500,
            re_processor_limit: 10,
            re_processor_retry_cap: 10,
            burn_confirmation_blocks: 5,
            finisher_age_limit_blocks: 48,
            preburn_fee_tiers: vec![1, 2, 3, 4, 5, 10, 20],
            preburn_pool_target: 2,
            max_size_for_preburn_mb: 20,
            collection_reg_fee: 1000,
            nft_default_max_file_size_for_fee_mb: 100,
            nft_thumbnail_size_px: 256,
            return_detailed_wn_error: false,
            account_manager_enabled: false,
        }
    }
}

impl GatewayConfig {
    /// Load from a JSON file, falling back to defaults for absent fields.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| GatewayError::Config(format!("bad config file: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.funding_address.is_empty() {
            return Err(GatewayError::Config("funding_address is required".into()));
        }
        if self.pastel_id.is_empty() {
            return Err(GatewayError::Config("pastel_id is required".into()));
        }
        if self.worker_count == 0 {
            return Err(GatewayError::Config("worker_count must be positive".into()));
        }
        if self.preburn_fee_tiers.is_empty() {
            return Err(GatewayError::Config("preburn_fee_tiers is empty".into()));
        }
        Ok(())
    }

    /// Running the control loops while an external account manager owns
    /// the funding address would double-spend preburns.
    pub fn check_loops_allowed(&self) -> Result<()> {
        if self.account_manager_enabled {
            return Err(GatewayError::Config(
                "control loops cannot run while account_manager_enabled is set".into(),
            ));
        }
        Ok(())
    }

    pub fn finisher_interval(&self) -> Duration {
        Duration::from_secs(self.finisher_interval_secs)
    }

    pub fn re_processor_interval(&self) -> Duration {
        Duration::from_secs(self.re_processor_interval_secs)
    }

    pub fn fee_pre_burner_interval(&self) -> Duration {
        Duration::from_secs(self.fee_pre_burner_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = StagePolicy::default();
        assert_eq!(policy.backoff_for(1), Duration::from_secs(180));
        assert_eq!(policy.backoff_for(2), Duration::from_secs(360));
        assert_eq!(policy.backoff_for(3), Duration::from_secs(720));
        // 180 * 2^15 > 36000, so the cap applies
        assert_eq!(policy.backoff_for(16), Duration::from_secs(36_000));
        assert_eq!(policy.backoff_for(200), Duration::from_secs(36_000));
    }

    #[test]
    fn test_validate_rejects_missing_identity() {
        let mut config = GatewayConfig::default();
        assert!(config.validate().is_err());
        config.funding_address = "tPburn".into();
        assert!(config.validate().is_err());
        config.pastel_id = "jXabc".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_loops_blocked_under_account_manager() {
        let mut config = GatewayConfig::default();
        config.account_manager_enabled = true;
        assert!(config.check_loops_allowed().is_err());
        config.account_manager_enabled = false;
        assert!(config.check_loops_allowed().is_ok());
    }

    #[test]
    fn test_minimal_file_gets_defaults() {
        let json = r#"{"funding_address": "tPburn", "pastel_id": "jXabc"}"#;
        let config: GatewayConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.worker_count, 8);
        assert_eq!(config.finisher_interval_secs, 600);
        assert_eq!(config.stage_policies.process.max_retries, 15);
    }
}
