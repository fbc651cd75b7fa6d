//! Write pipeline: `del` a filename from the cluster.

use anyhow::Result;
use log::{info, warn};
use tokio::net::TcpStream;

use super::PeerContext;
use crate::replication::sync_catalog_to_all_peers;
use crate::wire::{self, Opcode};

/// Remove every catalog row for `filename`, replicate the mutation, then
/// best-effort broadcast `DELETE_CHUNK` to the peers that had held it.
pub async fn del(ctx: &PeerContext, filename: &str) -> Result<()> {
    ctx.lock.acquire_write(&ctx.peers).await?;
    let outcome = match ctx.catalog.delete_by_filename(filename) {
        Ok(rows) => sync_catalog_to_all_peers(&ctx.catalog, &ctx.peers)
            .await
            .map(|()| rows),
        Err(err) => Err(err),
    };
    ctx.lock.release_write(&ctx.peers).await;
    let rows = outcome?;

    info!("deleted {} catalog row(s) for {}", rows.len(), filename);

    for (key, peer) in rows {
        if let Err(err) = send_delete_chunk(&peer, &key).await {
            warn!("delete of chunk {} on {} failed: {:#}", key, peer, err);
        }
    }

    Ok(())
}

async fn send_delete_chunk(peer: &str, key: &str) -> Result<()> {
    let mut conn = TcpStream::connect(peer).await?;
    wire::send_opcode(&mut conn, Opcode::DeleteChunk).await?;
    wire::send_key(&mut conn, key).await?;
    let reply = wire::read_opcode(&mut conn).await;
    if reply != Opcode::Ack as u8 {
        anyhow::bail!("peer {} did not ack delete of chunk {}", peer, key);
    }
    Ok(())
}
