//! Write pipeline: `put` a local file into the cluster.

use std::path::Path;

use anyhow::{Context, Result};
use log::{info, warn};

use super::PeerContext;
use crate::chunking::split_and_stage;
use crate::replication::sync_catalog_to_all_peers;
use crate::transport::upload_chunk;

/// Split, place, and catalog `source`, replicating each chunk to up to
/// [`crate::config::REPLICATION_FACTOR`] peers.
pub async fn put(ctx: &PeerContext, source: &Path) -> Result<()> {
    let filename = source
        .file_name()
        .context("upload source has no filename")?
        .to_string_lossy()
        .into_owned();

    let staged = split_and_stage(source, &ctx.tmp_dir).await?;
    info!("staged {} chunk(s) for {}", staged.len(), filename);

    for chunk in staged {
        ctx.lock.acquire_read().await;
        let candidates: Vec<String> = ctx
            .peers
            .snapshot()
            .await
            .into_iter()
            .filter(|peer| peer != &ctx.self_addr)
            .collect();
        let mut ranked: Vec<(String, i64)> = Vec::with_capacity(candidates.len());
        let counted = (|| -> Result<()> {
            for peer in &candidates {
                let count = ctx.catalog.count_by_peer(peer)?;
                ranked.push((peer.clone(), count));
            }
            Ok(())
        })();
        ctx.lock.release_read().await;
        counted?;

        ranked.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

        let mut replicas = Vec::with_capacity(crate::config::REPLICATION_FACTOR);
        for (peer, _) in &ranked {
            if replicas.len() >= crate::config::REPLICATION_FACTOR {
                break;
            }
            match upload_chunk(peer, &chunk.key, &chunk.path).await {
                Ok(()) => {
                    info!("uploaded chunk {} (index {}) to {}", chunk.key, chunk.index, peer);
                    replicas.push(peer.clone());
                }
                Err(err) => warn!("upload of chunk {} to {} failed: {:#}", chunk.key, peer, err),
            }
        }

        if replicas.is_empty() {
            anyhow::bail!("no peer reachable for chunk {} of {}", chunk.key, filename);
        }
        if replicas.len() < crate::config::REPLICATION_FACTOR {
            warn!(
                "chunk {} of {} has only {} replica(s)",
                chunk.key,
                filename,
                replicas.len()
            );
        }

        let _ = tokio::fs::remove_file(&chunk.path).await;

        ctx.lock.acquire_write(&ctx.peers).await?;
        let commit = (|| -> Result<()> {
            for peer in &replicas {
                ctx.catalog.insert(&filename, chunk.index, &chunk.key, peer)?;
            }
            Ok(())
        })();
        let result = match commit {
            Ok(()) => sync_catalog_to_all_peers(&ctx.catalog, &ctx.peers).await,
            Err(err) => Err(err),
        };
        ctx.lock.release_write(&ctx.peers).await;
        result?;
    }

    info!("upload of {} complete", filename);
    Ok(())
}
