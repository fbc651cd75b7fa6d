//! Server dispatcher: the accept loop and per-connection opcode router.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{info, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Duration;

use crate::catalog::Catalog;
use crate::cluster_lock::ClusterLock;
use crate::peers::PeerRegistry;
use crate::transport::{receive_file, send_file};
use crate::wire::{self, Opcode, SENTINEL};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Shared, `Arc`-wrapped server state reachable from every connection task.
pub struct Shared {
    pub catalog: Catalog,
    pub peers: PeerRegistry,
    pub lock: Arc<ClusterLock>,
    pub storage_dir: PathBuf,
    pub global_db_path: PathBuf,
    pub server_list_path: PathBuf,
    pub load: AtomicU8,
}

/// RAII guard decrementing the load counter on drop, including on early
/// return from a handler error.
struct LoadGuard<'a>(&'a AtomicU8);

impl<'a> Drop for LoadGuard<'a> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Bind `port` and accept connections until `shutdown` resolves, spawning
/// one task per connection. In-flight handlers are allowed to drain; the
/// accept loop itself stops as soon as the signal fires.
pub async fn run(
    shared: Arc<Shared>,
    port: &str,
    shutdown: impl std::future::Future<Output = ()>,
) -> Result<()> {
    let listener = TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .with_context(|| format!("binding port {}", port))?;
    info!("listening on port {}", port);

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (conn, addr) = accepted.context("accepting connection")?;
                info!("new connection: {}", addr);
                shared.load.fetch_add(1, Ordering::SeqCst);
                let shared = shared.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(shared.clone(), conn).await {
                        warn!("connection handler error: {:#}", err);
                    }
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, closing accept loop");
                return Ok(());
            }
        }
    }
}

async fn handle_connection(shared: Arc<Shared>, mut conn: TcpStream) -> Result<()> {
    let peer_addr = conn.peer_addr().ok();
    let _guard = LoadGuard(&shared.load);

    loop {
        let opcode = match tokio::time::timeout(REQUEST_TIMEOUT, wire::read_opcode(&mut conn)).await {
            Ok(op) => op,
            Err(_) => {
                warn!("request timed out, closing connection");
                break;
            }
        };
        if opcode == SENTINEL {
            break;
        }
        let Some(op) = Opcode::from_byte(opcode) else {
            warn!("unknown opcode {}, closing connection", opcode);
            break;
        };

        match tokio::time::timeout(REQUEST_TIMEOUT, dispatch(&shared, op, &mut conn, peer_addr)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!("error handling {:?}: {:#}", op, err);
                break;
            }
            Err(_) => {
                warn!("{:?} payload timed out, closing connection", op);
                break;
            }
        }
    }

    if let Some(addr) = peer_addr {
        info!("connection closed: {}", addr);
    }
    Ok(())
}

async fn dispatch(
    shared: &Arc<Shared>,
    op: Opcode,
    conn: &mut TcpStream,
    peer_addr: Option<std::net::SocketAddr>,
) -> Result<()> {
    match op {
        Opcode::DownloadFile => {
            let key = wire::read_key(conn).await?;
            let path = shared.storage_dir.join(&key);
            send_file(&path, conn).await?;
        }
        Opcode::LendLock => {
            if shared.lock.try_loan().await {
                wire::send_opcode(conn, Opcode::Ack).await?;
            } else {
                conn.write_all(&[wire::SENTINEL]).await?;
            }
        }
        Opcode::ReturnLock => {
            shared.lock.release_loan().await;
            wire::send_opcode(conn, Opcode::Ack).await?;
        }
        Opcode::SyncCatalog => {
            receive_file(&shared.global_db_path, conn).await?;
            wire::send_opcode(conn, Opcode::Ack).await?;
        }
        Opcode::UploadChunk => {
            let key = wire::read_key(conn).await?;
            let path = shared.storage_dir.join(&key);
            receive_file(&path, conn).await?;

            let data = tokio::fs::read(&path).await?;
            let actual = crate::chunking::key_of(&data);
            if actual != key {
                let _ = tokio::fs::remove_file(&path).await;
                anyhow::bail!(crate::error::PeerError::ChunkVerificationFailed { key, actual });
            }
            wire::send_opcode(conn, Opcode::Ack).await?;
        }
        Opcode::DeleteChunk => {
            let key = wire::read_key(conn).await?;
            let _ = tokio::fs::remove_file(shared.storage_dir.join(&key)).await;
            wire::send_opcode(conn, Opcode::Ack).await?;
        }
        Opcode::SendCatalog => {
            shared.lock.acquire_read().await;
            let result = send_file(&shared.global_db_path, conn).await;
            shared.lock.release_read().await;
            result?;
        }
        Opcode::JoinCluster => {
            let port = wire::read_port(conn).await?;
            let ip = peer_addr
                .map(|a| a.ip().to_string())
                .context("no peer address for JOIN_CLUSTER")?;
            let candidate = format!("{}:{}", ip, port);

            if !crate::peers::verify_reachable(&candidate).await {
                conn.write_all(&[wire::SENTINEL]).await?;
                return Ok(());
            }

            shared.peers.join(&candidate).await?;
            wire::send_opcode(conn, Opcode::Ack).await?;
            crate::replication::sync_peer_list_to_all_peers(&shared.peers).await?;
        }
        Opcode::GetPeerList => {
            send_file(&shared.server_list_path, conn).await?;
        }
        Opcode::SyncPeerList => {
            receive_file(&shared.server_list_path, conn).await?;
            shared.peers.refresh().await?;
            wire::send_opcode(conn, Opcode::Ack).await?;
        }
        Opcode::ServerLoad => {
            let load = shared.load.load(Ordering::SeqCst);
            conn.write_all(&[load]).await?;
        }
        Opcode::Ack => {}
    }
    Ok(())
}
