//! Asynchronous registration gateway for the Pastel network.
//!
//! Clients hand the gateway artifacts; the gateway drives the full
//! registration lifecycle against the Pastel node and WalletNode:
//! upload, fee preburn, ticket registration, activation tracking,
//! artifact archival and offer tickets. Three control loops keep the
//! pipeline honest: the finisher polls WalletNode for outcomes, the
//! re-processor retries failed tasks and the fee pre-burner keeps the
//! preburn pool warm.

pub mod aggregator;
pub mod alert;
pub mod burnpool;
pub mod config;
pub mod error;
pub mod finisher;
pub mod pipeline;
pub mod reprocessor;
pub mod rpc;
pub mod secrets;
pub mod state;
pub mod storage;
pub mod walletnode;

pub use error::{GatewayError, Result};
