//! Content-addressed chunking: split a file greedily at `CHUNK_SIZE`
//! boundaries, key each chunk by the lowercase hex SHA-1 of its bytes, and
//! stage the bytes under `tmp/{key}`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::config::CHUNK_SIZE;

/// A chunk staged on local disk, ready for upload.
#[derive(Debug, Clone)]
pub struct StagedChunk {
    pub index: i64,
    pub key: String,
    pub path: PathBuf,
    pub size: u64,
}

/// The lowercase hex SHA-1 of `data` — a chunk's key.
pub fn key_of(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Split `source` into chunks of at most `CHUNK_SIZE` bytes, staging each
/// under `tmp_dir/{key}`. A file of size <= `CHUNK_SIZE` produces exactly
/// one chunk; the last chunk's length is `file_size mod CHUNK_SIZE` (or a
/// full `CHUNK_SIZE` on an exact multiple).
pub async fn split_and_stage(source: &Path, tmp_dir: &Path) -> Result<Vec<StagedChunk>> {
    let mut file = tokio::fs::File::open(source)
        .await
        .with_context(|| format!("opening {:?}", source))?;
    let file_size = file.metadata().await?.len();

    let chunk_count = if file_size == 0 {
        1
    } else {
        ((file_size + CHUNK_SIZE - 1) / CHUNK_SIZE).max(1)
    };

    let mut staged = Vec::with_capacity(chunk_count as usize);

    for index in 0..chunk_count {
        let offset = index * CHUNK_SIZE;
        let remaining = file_size.saturating_sub(offset);
        let this_len = remaining.min(CHUNK_SIZE) as usize;

        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; this_len];
        file.read_exact(&mut buf).await.with_context(|| {
            format!("reading chunk {} of {:?} at offset {}", index, source, offset)
        })?;

        let key = key_of(&buf);
        let dest = tmp_dir.join(&key);
        tokio::fs::write(&dest, &buf)
            .await
            .with_context(|| format!("staging chunk {:?}", dest))?;

        staged.push(StagedChunk {
            index: index as i64,
            key,
            path: dest,
            size: this_len as u64,
        });
    }

    Ok(staged)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sha1_hex(data: &[u8]) -> String {
        key_of(data)
    }

    #[test]
    fn known_vector() {
        assert_eq!(
            sha1_hex(b"hello world\n"),
            "22596363b3de40b06f981fb85d82312e8c0ed511"
        );
    }

    #[tokio::test]
    async fn single_chunk_for_small_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("f.txt");
        tokio::fs::write(&src, b"hello world\n").await.unwrap();

        let staged = split_and_stage(&src, dir.path()).await.unwrap();
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].size, 12);
        assert_eq!(staged[0].key, "22596363b3de40b06f981fb85d82312e8c0ed511");
    }

    #[tokio::test]
    async fn chunks_at_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("big.bin");

        let total = CHUNK_SIZE + 1024 * 1024; // CHUNK_SIZE + 1 MiB
        let data = vec![7u8; total as usize];
        tokio::fs::write(&src, &data).await.unwrap();

        let staged = split_and_stage(&src, dir.path()).await.unwrap();
        assert_eq!(staged.len(), 2);
        assert_eq!(staged[0].size, CHUNK_SIZE);
        assert_eq!(staged[1].size, 1024 * 1024);

        // reassembly is byte-identical
        let mut reassembled = Vec::new();
        for chunk in &staged {
            reassembled.extend(tokio::fs::read(&chunk.path).await.unwrap());
        }
        assert_eq!(reassembled, data);
    }

    #[tokio::test]
    async fn exact_multiple_has_full_last_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("exact.bin");
        let data = vec![1u8; CHUNK_SIZE as usize];
        tokio::fs::write(&src, &data).await.unwrap();

        let staged = split_and_stage(&src, dir.path()).await.unwrap();
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].size, CHUNK_SIZE);
    }
}
