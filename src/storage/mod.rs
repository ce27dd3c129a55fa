/// Artifact storage for the registration pipeline.
///
/// Three layers cooperate:
/// - `local`: filesystem cache of original uploads and finished results
/// - `ipfs`: content-addressed store, the durable copy the gateway serves
/// - `pinner`: best-effort replication of CIDs to a remote pinning service
///
/// The pipeline never depends on the pinner; a lost pin only reduces
/// redundancy.
pub mod ipfs;
pub mod local;
pub mod pinner;

use async_trait::async_trait;

use crate::error::Result;

/// Content-addressed blob store.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Human-readable name of this store (e.g., "IPFS").
    fn name(&self) -> &str;

    /// Store data and return its CID.
    async fn put(&self, file_name: &str, data: &[u8]) -> Result<String>;

    /// Fetch data by CID.
    async fn get(&self, cid: &str) -> Result<Vec<u8>>;

    /// Pin a CID so the node keeps it.
    async fn pin(&self, cid: &str) -> Result<()>;

    /// Unpin a CID. Succeeds even if the CID was not pinned.
    async fn unpin(&self, cid: &str) -> Result<()>;
}
