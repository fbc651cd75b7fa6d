//! Peer registry: the ordered in-memory peer list backed by
//! `server_list.txt`, a newline-separated file (CRLF canonical, LF
//! accepted on read) of `host:port` records.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::info;
use tokio::net::TcpStream;
use tokio::sync::RwLock;

/// An in-memory, file-backed ordered list of cluster peers.
///
/// Reads are lock-free-ish (a `tokio::sync::RwLock` read guard); the only
/// writer is `join`, serialized by the same lock, matching the "append on
/// join, never removed by the core" lifecycle from the data model.
pub struct PeerRegistry {
    path: PathBuf,
    peers: RwLock<Vec<String>>,
}

impl PeerRegistry {
    /// Load the registry from `path`, creating an empty file if absent.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            tokio::fs::write(&path, b"").await?;
        }
        let peers = read_peer_list(&path).await?;
        Ok(Self {
            path,
            peers: RwLock::new(peers),
        })
    }

    /// Re-read the backing file, discarding the in-memory list. Used after
    /// receiving a `SYNC_PEER_LIST` snapshot or downloading the list fresh
    /// from a bootstrap peer.
    pub async fn refresh(&self) -> Result<()> {
        let fresh = read_peer_list(&self.path).await?;
        let mut guard = self.peers.write().await;
        *guard = fresh;
        Ok(())
    }

    /// A snapshot of the current, ordered peer list.
    pub async fn snapshot(&self) -> Vec<String> {
        self.peers.read().await.clone()
    }

    /// The whole-file byte image exchanged by `GET_PEER_LIST`/
    /// `SYNC_PEER_LIST`.
    pub async fn read_bytes(&self) -> Result<Vec<u8>> {
        tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("reading peer list {:?}", self.path))
    }

    /// Overwrite the on-disk list with a byte image received from a peer,
    /// then refresh the in-memory copy.
    pub async fn write_bytes(&self, data: &[u8]) -> Result<()> {
        atomic_write(&self.path, data).await?;
        self.refresh().await
    }

    /// Admit `peer` into the cluster if it is not already present, then
    /// persist the updated list. Returns `true` if the peer was newly
    /// added.
    pub async fn join(&self, peer: &str) -> Result<bool> {
        let mut guard = self.peers.write().await;
        if guard.iter().any(|p| p == peer) {
            info!("peer {} already in the registry", peer);
            return Ok(false);
        }
        guard.push(peer.to_string());
        let contents = guard.join("\r\n");
        drop(guard);
        atomic_write(&self.path, contents.as_bytes()).await?;
        info!("admitted new peer {}", peer);
        Ok(true)
    }
}

async fn read_peer_list(path: &Path) -> Result<Vec<String>> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading peer list {:?}", path))?;
    Ok(contents
        .replace("\r\n", "\n")
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

async fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = dir.to_path_buf();
    tmp.push(format!(
        ".{}.tmp",
        path.file_name().unwrap().to_string_lossy()
    ));
    tokio::fs::write(&tmp, data)
        .await
        .with_context(|| format!("writing {:?}", tmp))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("renaming {:?} to {:?}", tmp, path))?;
    Ok(())
}

/// The reverse-dial admission probe for `JOIN_CLUSTER`: the core's sole
/// admission criterion, so that a NAT'd peer that cannot be dialed back
/// cannot be added.
pub async fn verify_reachable(peer: &str) -> bool {
    TcpStream::connect(peer).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn join_is_idempotent_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server_list.txt");
        let registry = PeerRegistry::load(&path).await.unwrap();

        assert!(registry.join("10.0.0.1:2333").await.unwrap());
        assert!(!registry.join("10.0.0.1:2333").await.unwrap());
        assert!(registry.join("10.0.0.2:2333").await.unwrap());

        assert_eq!(
            registry.snapshot().await,
            vec!["10.0.0.1:2333".to_string(), "10.0.0.2:2333".to_string()]
        );

        let reloaded = PeerRegistry::load(&path).await.unwrap();
        assert_eq!(reloaded.snapshot().await, registry.snapshot().await);
    }

    #[tokio::test]
    async fn accepts_lf_only_lists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server_list.txt");
        tokio::fs::write(&path, b"10.0.0.1:2333\n10.0.0.2:2333\n")
            .await
            .unwrap();
        let registry = PeerRegistry::load(&path).await.unwrap();
        assert_eq!(
            registry.snapshot().await,
            vec!["10.0.0.1:2333".to_string(), "10.0.0.2:2333".to_string()]
        );
    }
}
