//! Frame codec: the single-byte opcodes and their typed payloads.
//!
//! All multi-byte integers on the wire are big-endian. A connection is a
//! loop of opcode reads; `ACK` doubles as both an opcode and a sentinel
//! response, and the out-of-band byte `255` means "EOF or protocol error"
//! at the request-reading boundary — it is never a valid opcode.

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Length, in bytes, of a hex-encoded SHA-1 chunk key.
pub const KEY_LEN: usize = 40;

/// Sentinel returned by [`read_opcode`] on EOF or a decode error, and used
/// by `JOIN_CLUSTER` to signal that the reverse-dial probe failed.
pub const SENTINEL: u8 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    DownloadFile = 1,
    LendLock = 6,
    ReturnLock = 7,
    Ack = 8,
    SyncCatalog = 9,
    UploadChunk = 10,
    DeleteChunk = 11,
    SendCatalog = 12,
    JoinCluster = 13,
    GetPeerList = 14,
    SyncPeerList = 15,
    ServerLoad = 16,
}

impl Opcode {
    pub fn from_byte(b: u8) -> Option<Self> {
        use Opcode::*;
        Some(match b {
            1 => DownloadFile,
            6 => LendLock,
            7 => ReturnLock,
            8 => Ack,
            9 => SyncCatalog,
            10 => UploadChunk,
            11 => DeleteChunk,
            12 => SendCatalog,
            13 => JoinCluster,
            14 => GetPeerList,
            15 => SyncPeerList,
            16 => ServerLoad,
            _ => return None,
        })
    }
}

/// Read one opcode byte. Returns `SENTINEL` on EOF or any I/O error,
/// mirroring the reference peer's `readInstruct`.
pub async fn read_opcode<R: AsyncRead + Unpin>(conn: &mut R) -> u8 {
    let mut buf = [0u8; 1];
    match conn.read_exact(&mut buf).await {
        Ok(_) => buf[0],
        Err(_) => SENTINEL,
    }
}

pub async fn send_opcode<W: AsyncWrite + Unpin>(conn: &mut W, op: Opcode) -> Result<()> {
    conn.write_all(&[op as u8]).await?;
    Ok(())
}

/// Read exactly `KEY_LEN` bytes, retrying on short reads, and interpret
/// them as an ASCII chunk key.
pub async fn read_key<R: AsyncRead + Unpin>(conn: &mut R) -> Result<String> {
    let mut buf = [0u8; KEY_LEN];
    conn.read_exact(&mut buf)
        .await
        .context("short read while reading chunk key")?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

pub async fn send_key<W: AsyncWrite + Unpin>(conn: &mut W, key: &str) -> Result<()> {
    if key.len() != KEY_LEN {
        bail!("chunk key '{}' is not {} bytes", key, KEY_LEN);
    }
    conn.write_all(key.as_bytes()).await?;
    Ok(())
}

/// Read an 8-byte big-endian length prefix.
pub async fn read_len<R: AsyncRead + Unpin>(conn: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    conn.read_exact(&mut buf).await.context("short read on length prefix")?;
    Ok(u64::from_be_bytes(buf))
}

pub async fn send_len<W: AsyncWrite + Unpin>(conn: &mut W, len: u64) -> Result<()> {
    conn.write_all(&len.to_be_bytes()).await?;
    Ok(())
}

/// Read a length-prefixed byte buffer (used for catalog and peer-list
/// snapshots, which are small enough to hold in memory).
pub async fn read_blob<R: AsyncRead + Unpin>(conn: &mut R) -> Result<Vec<u8>> {
    let len = read_len(conn).await? as usize;
    let mut buf = vec![0u8; len];
    conn.read_exact(&mut buf).await.context("short read on blob payload")?;
    Ok(buf)
}

pub async fn send_blob<W: AsyncWrite + Unpin>(conn: &mut W, data: &[u8]) -> Result<()> {
    send_len(conn, data.len() as u64).await?;
    conn.write_all(data).await?;
    Ok(())
}

/// Read a 2-byte big-endian port number, as sent by `JOIN_CLUSTER`.
pub async fn read_port<R: AsyncRead + Unpin>(conn: &mut R) -> Result<u16> {
    let mut buf = [0u8; 2];
    conn.read_exact(&mut buf).await.context("short read on port")?;
    Ok(u16::from_be_bytes(buf))
}

pub async fn send_port<W: AsyncWrite + Unpin>(conn: &mut W, port: u16) -> Result<()> {
    conn.write_all(&port.to_be_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opcode_round_trip() {
        let mut buf = Vec::new();
        send_opcode(&mut buf, Opcode::UploadChunk).await.unwrap();
        assert_eq!(Opcode::from_byte(buf[0]), Some(Opcode::UploadChunk));
    }

    #[tokio::test]
    async fn unknown_opcode_is_none() {
        assert_eq!(Opcode::from_byte(200), None);
        assert_eq!(Opcode::from_byte(SENTINEL), None);
    }

    #[tokio::test]
    async fn key_round_trip() {
        let key = "a".repeat(KEY_LEN);
        let mut buf = Vec::new();
        send_key(&mut buf, &key).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let got = read_key(&mut cursor).await.unwrap();
        assert_eq!(got, key);
    }

    #[tokio::test]
    async fn blob_round_trip() {
        let data = b"hello cluster".to_vec();
        let mut buf = Vec::new();
        send_blob(&mut buf, &data).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let got = read_blob(&mut cursor).await.unwrap();
        assert_eq!(got, data);
    }

    #[tokio::test]
    async fn read_opcode_eof_is_sentinel() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        assert_eq!(read_opcode(&mut cursor).await, SENTINEL);
    }
}
