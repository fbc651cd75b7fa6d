//! Read pipeline: `get` reassembles a filename from its replicas.
//!
//! A gap in a filename's chunk-index sequence is treated as corruption —
//! the file is refused rather than served partially. See the cluster
//! lock's per-chunk write-lock tradeoff noted in [`crate::pipeline::upload`].

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{info, warn};
use tokio::sync::Semaphore;

use super::PeerContext;
use crate::config::DOWNLOAD_CONCURRENCY;
use crate::error::PeerError;
use crate::transport::{download_chunk, probe_load};

struct PlannedChunk {
    index: i64,
    key: String,
    peers: Vec<String>,
}

/// Fetch every chunk of `filename`, verifying and reassembling it into
/// `download/{filename}`.
pub async fn get(ctx: &PeerContext, filename: &str) -> Result<()> {
    ctx.lock.acquire_read().await;
    let rows = ctx.catalog.select_chunks(filename);
    ctx.lock.release_read().await;
    let rows = rows?;

    if rows.is_empty() {
        anyhow::bail!("no such file: {}", filename);
    }

    let plan = plan_chunks(filename, rows)?;

    let semaphore = Arc::new(Semaphore::new(DOWNLOAD_CONCURRENCY));
    let mut tasks = Vec::with_capacity(plan.len());
    for chunk in &plan {
        let semaphore = semaphore.clone();
        let tmp_dir = ctx.tmp_dir.clone();
        let chunk = PlannedChunk {
            index: chunk.index,
            key: chunk.key.clone(),
            peers: chunk.peers.clone(),
        };
        tasks.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            fetch_chunk(&chunk, &tmp_dir).await
        }));
    }
    for task in tasks {
        task.await.context("download task panicked")??;
    }

    let dest = ctx.download_dir.join(filename);
    let mut out = Vec::new();
    for chunk in &plan {
        let bytes = tokio::fs::read(ctx.tmp_dir.join(&chunk.key))
            .await
            .with_context(|| format!("reading staged chunk {}", chunk.key))?;
        out.extend(bytes);
    }
    tokio::fs::write(&dest, &out)
        .await
        .with_context(|| format!("writing {:?}", dest))?;

    for chunk in &plan {
        let _ = tokio::fs::remove_file(ctx.tmp_dir.join(&chunk.key)).await;
    }

    info!("reassembled {} into {:?}", filename, dest);
    Ok(())
}

fn plan_chunks(filename: &str, rows: Vec<(i64, String, String)>) -> Result<Vec<PlannedChunk>> {
    let mut by_index: BTreeMap<i64, (String, Vec<String>)> = BTreeMap::new();
    for (index, key, peer) in rows {
        let entry = by_index
            .entry(index)
            .or_insert_with(|| (key.clone(), Vec::new()));
        entry.1.push(peer);
    }

    let max_index = *by_index.keys().last().expect("rows is non-empty");
    for expected in 0..=max_index {
        if !by_index.contains_key(&expected) {
            return Err(PeerError::CorruptedFile(filename.to_string(), expected as usize).into());
        }
    }

    Ok(by_index
        .into_iter()
        .map(|(index, (key, peers))| PlannedChunk { index, key, peers })
        .collect())
}

async fn fetch_chunk(chunk: &PlannedChunk, tmp_dir: &std::path::Path) -> Result<()> {
    let mut ranked: Vec<(String, u8)> = Vec::with_capacity(chunk.peers.len());
    for peer in &chunk.peers {
        ranked.push((peer.clone(), probe_load(peer).await));
    }

    let mut order: Vec<usize> = (0..ranked.len()).collect();
    order.sort_by_key(|&i| ranked[i].1);

    let dest = tmp_dir.join(&chunk.key);
    let mut last_err = None;
    for idx in order {
        let peer = &ranked[idx].0;
        match download_chunk(peer, &chunk.key, &dest).await {
            Ok(()) => return Ok(()),
            Err(err) => {
                warn!(
                    "fetch of chunk {} from {} failed, trying next replica: {:#}",
                    chunk.key, peer, err
                );
                last_err = Some(err);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| PeerError::NoReplicaAvailable(chunk.key.clone()).into()))
}
