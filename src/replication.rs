//! Full-state replication: after any local catalog or peer-list mutation,
//! the whole file is pushed to every peer and the caller awaits `ACK`.
//!
//! This is O(n) per write (see spec §9) but keeps the wire contract for
//! `SYNC_CATALOG`/`SYNC_PEER_LIST` simple; row-level deltas are not
//! implemented. Fan-out uses the same bounded, collect-all idiom the
//! reference peer's sync pipeline uses for chunk downloads.

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use log::warn;
use tokio::net::TcpStream;

use crate::catalog::Catalog;
use crate::peers::PeerRegistry;
use crate::wire::{self, Opcode};

const FANOUT_CONCURRENCY: usize = 8;

/// Push the current catalog byte image to every peer, awaiting `ACK` from
/// each. A peer that is unreachable is logged and skipped — it will
/// reconcile on its next successful `SEND_CATALOG`/join.
pub async fn sync_catalog_to_all_peers(catalog: &Catalog, peers: &PeerRegistry) -> Result<()> {
    let bytes = catalog.read_bytes()?;
    broadcast(peers, Opcode::SyncCatalog, &bytes).await
}

/// Push the current peer-list byte image to every peer.
pub async fn sync_peer_list_to_all_peers(peers: &PeerRegistry) -> Result<()> {
    let bytes = peers.read_bytes().await?;
    broadcast(peers, Opcode::SyncPeerList, &bytes).await
}

async fn broadcast(peers: &PeerRegistry, op: Opcode, payload: &[u8]) -> Result<()> {
    let targets = peers.snapshot().await;

    stream::iter(targets)
        .for_each_concurrent(FANOUT_CONCURRENCY, |peer| {
            let payload = payload.to_vec();
            async move {
                if let Err(err) = send_snapshot(&peer, op, &payload).await {
                    warn!("replication to {} failed: {:#}", peer, err);
                }
            }
        })
        .await;

    Ok(())
}

async fn send_snapshot(peer: &str, op: Opcode, payload: &[u8]) -> Result<()> {
    let mut conn = TcpStream::connect(peer)
        .await
        .with_context(|| format!("connecting to {} for replication", peer))?;
    wire::send_opcode(&mut conn, op).await?;
    wire::send_blob(&mut conn, payload).await?;
    let reply = wire::read_opcode(&mut conn).await;
    if reply != Opcode::Ack as u8 {
        anyhow::bail!("peer {} did not ack replication", peer);
    }
    Ok(())
}
