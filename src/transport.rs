//! Chunk transport: the `UPLOAD_CHUNK`/`DOWNLOAD_FILE` client and server
//! sides. Transfers stream through a fixed read buffer and are tracked
//! against an announced length rather than relying on EOF, because the
//! connection is reused for further opcodes.

use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use log::info;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::chunking::key_of;
use crate::config::TRANSPORT_READ_BUFFER;
use crate::error::PeerError;
use crate::wire::{self, Opcode};

/// Stream the file at `path` to `conn`, preceded by its 8-byte length.
/// Used both for `SEND_CATALOG`/`GET_PEER_LIST` (whole small files, via
/// [`crate::wire::send_blob`]) and for chunk/ manifest payloads large
/// enough to want buffered streaming instead of loading into memory.
pub async fn send_file<W: AsyncWrite + Unpin>(path: &Path, conn: &mut W) -> Result<()> {
    let start = Instant::now();
    let metadata = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("stat {:?}", path))?;
    let len = metadata.len();
    wire::send_len(conn, len).await?;

    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("opening {:?}", path))?;
    let mut buf = vec![0u8; TRANSPORT_READ_BUFFER];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        conn.write_all(&buf[..n]).await?;
    }

    let elapsed = start.elapsed().as_secs_f64().max(f64::EPSILON);
    info!(
        "sent {} bytes from {:?} ({:.3} MiB/s)",
        len,
        path,
        (len as f64) / (1024.0 * 1024.0) / elapsed
    );
    Ok(())
}

/// Receive a length-prefixed stream into `dest`, stopping exactly at the
/// announced length rather than at EOF.
pub async fn receive_file<R: AsyncRead + Unpin>(dest: &Path, conn: &mut R) -> Result<()> {
    let start = Instant::now();
    let len = wire::read_len(conn).await?;

    let mut file = tokio::fs::File::create(dest)
        .await
        .with_context(|| format!("creating {:?}", dest))?;
    let mut remaining = len;
    let mut buf = vec![0u8; TRANSPORT_READ_BUFFER];

    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = conn.read(&mut buf[..want]).await?;
        if n == 0 {
            anyhow::bail!(PeerError::ShortRead {
                expected: len as usize,
                got: (len - remaining) as usize,
            });
        }
        file.write_all(&buf[..n]).await?;
        remaining -= n as u64;
    }

    let elapsed = start.elapsed().as_secs_f64().max(f64::EPSILON);
    info!(
        "received {} bytes into {:?} ({:.3} MiB/s)",
        len,
        dest,
        (len as f64) / (1024.0 * 1024.0) / elapsed
    );
    Ok(())
}

/// Client side of `UPLOAD_CHUNK`: send the opcode, key, and file bytes,
/// then await `ACK`.
pub async fn upload_chunk(peer: &str, key: &str, path: &Path) -> Result<()> {
    let mut conn = TcpStream::connect(peer)
        .await
        .map_err(|_| PeerError::PeerUnreachable(peer.to_string()))?;
    wire::send_opcode(&mut conn, Opcode::UploadChunk).await?;
    wire::send_key(&mut conn, key).await?;
    send_file(path, &mut conn).await?;

    let reply = wire::read_opcode(&mut conn).await;
    if reply != Opcode::Ack as u8 {
        anyhow::bail!("peer {} did not ack upload of chunk {}", peer, key);
    }
    Ok(())
}

/// Client side of `DOWNLOAD_FILE`: request `key` from `peer`, verify the
/// received bytes hash to `key`, and write them to `dest` on success.
pub async fn download_chunk(peer: &str, key: &str, dest: &Path) -> Result<()> {
    let mut conn = TcpStream::connect(peer)
        .await
        .map_err(|_| PeerError::PeerUnreachable(peer.to_string()))?;
    wire::send_opcode(&mut conn, Opcode::DownloadFile).await?;
    wire::send_key(&mut conn, key).await?;

    let tmp_dest = dest.with_extension("partial");
    receive_file(&tmp_dest, &mut conn).await?;

    let data = tokio::fs::read(&tmp_dest).await?;
    let actual = key_of(&data);
    if actual != key {
        let _ = tokio::fs::remove_file(&tmp_dest).await;
        anyhow::bail!(PeerError::ChunkVerificationFailed {
            key: key.to_string(),
            actual,
        });
    }
    tokio::fs::rename(&tmp_dest, dest).await?;
    Ok(())
}

/// Server side of `SERVER_LOAD`: dial `peer`, ask for its load byte.
/// A connection failure is treated as load `255` (maximally loaded), per
/// spec §4.8.
pub async fn probe_load(peer: &str) -> u8 {
    match probe_load_inner(peer).await {
        Ok(load) => load,
        Err(_) => 255,
    }
}

async fn probe_load_inner(peer: &str) -> Result<u8> {
    let mut conn = TcpStream::connect(peer).await?;
    wire::send_opcode(&mut conn, Opcode::ServerLoad).await?;
    let mut buf = [0u8; 1];
    conn.read_exact(&mut buf).await?;
    Ok(buf[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_and_receive_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        let dst = dir.path().join("dst.bin");
        tokio::fs::write(&src, b"some payload bytes").await.unwrap();

        let mut buf = Vec::new();
        send_file(&src, &mut buf).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        receive_file(&dst, &mut cursor).await.unwrap();

        assert_eq!(
            tokio::fs::read(&dst).await.unwrap(),
            tokio::fs::read(&src).await.unwrap()
        );
    }

    #[tokio::test]
    async fn receive_file_detects_short_stream() {
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("dst.bin");

        // announce 100 bytes, supply only 5
        let mut buf = Vec::new();
        buf.extend_from_slice(&100u64.to_be_bytes());
        buf.extend_from_slice(b"short");

        let mut cursor = std::io::Cursor::new(buf);
        let err = receive_file(&dst, &mut cursor).await.unwrap_err();
        assert!(err.to_string().contains("short read") || err.to_string().contains("Short"));
    }
}
