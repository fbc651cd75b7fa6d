//! The write (upload, delete) and read (download) pipelines: the only
//! callers of [`crate::chunking`], [`crate::transport`], [`crate::catalog`],
//! [`crate::cluster_lock`] and [`crate::replication`] that the shell talks
//! to directly.

pub mod delete;
pub mod download;
pub mod upload;

/// Shared context threaded through every pipeline call: the local state a
/// peer needs to place, replicate, and locate chunks.
pub struct PeerContext {
    pub catalog: crate::catalog::Catalog,
    pub peers: crate::peers::PeerRegistry,
    pub lock: std::sync::Arc<crate::cluster_lock::ClusterLock>,
    /// This peer's own `host:port`, gossiped back into the registry once a
    /// peer we joined through broadcasts `SYNC_PEER_LIST` to everyone
    /// including us. Excluded from replica placement candidates.
    pub self_addr: String,
    pub tmp_dir: std::path::PathBuf,
    pub storage_dir: std::path::PathBuf,
    pub download_dir: std::path::PathBuf,
}
