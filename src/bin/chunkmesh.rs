//! Entry point: parse flags, lay out the local directories, join or
//! bootstrap the cluster, then run the server and/or the shell.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{error, info, warn};
use tokio::net::TcpStream;

use chunkmesh::catalog::Catalog;
use chunkmesh::cluster_lock::ClusterLock;
use chunkmesh::config::{
    Opt, DOWNLOAD_DIR, GLOBAL_DB_FILE, SERVER_LIST_FILE, STORAGE_DIR, TMP_DIR,
};
use chunkmesh::peers::PeerRegistry;
use chunkmesh::pipeline::PeerContext;
use chunkmesh::server::{self, Shared};
use chunkmesh::transport::receive_file;
use chunkmesh::wire::{self, Opcode};

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse_args();

    let level = if opt.verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    info!("enable_server={} port={} first_server={}", opt.enable_server, opt.port, opt.first_server);

    for dir in [TMP_DIR, STORAGE_DIR, DOWNLOAD_DIR] {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating directory {}", dir))?;
    }

    let peers = PeerRegistry::load(SERVER_LIST_FILE).await?;

    if opt.first_server {
        if !Path::new(GLOBAL_DB_FILE).exists() {
            info!("no catalog found, creating a fresh one");
            Catalog::open(GLOBAL_DB_FILE)?;
        }
    } else {
        bootstrap(&peers, &opt).await?;
    }

    let lock = ClusterLock::new();

    if opt.enable_server {
        let shared = Arc::new(Shared {
            catalog: Catalog::open(GLOBAL_DB_FILE)?,
            peers,
            lock,
            storage_dir: Path::new(STORAGE_DIR).to_path_buf(),
            global_db_path: Path::new(GLOBAL_DB_FILE).to_path_buf(),
            server_list_path: Path::new(SERVER_LIST_FILE).to_path_buf(),
            load: std::sync::atomic::AtomicU8::new(0),
        });

        info!("server starting up");
        let shutdown = async {
            let _ = tokio::signal::ctrl_c().await;
        };
        server::run(shared, &opt.port, shutdown).await?;
        info!("server shut down");
    } else {
        let ctx = PeerContext {
            catalog: Catalog::open(GLOBAL_DB_FILE)?,
            peers,
            lock,
            self_addr: format!("0.0.0.0:{}", opt.port),
            tmp_dir: Path::new(TMP_DIR).to_path_buf(),
            storage_dir: Path::new(STORAGE_DIR).to_path_buf(),
            download_dir: Path::new(DOWNLOAD_DIR).to_path_buf(),
        };
        chunkmesh::shell::run(&ctx).await?;
    }

    Ok(())
}

/// Dial peers from the loaded list until one responds, pull its catalog,
/// join the cluster if we are also a server, then refresh the peer list
/// from the same peer.
async fn bootstrap(peers: &PeerRegistry, opt: &Opt) -> Result<()> {
    let candidates = peers.snapshot().await;
    let mut connected: Option<String> = None;

    for peer in &candidates {
        let mut conn = match TcpStream::connect(peer).await {
            Ok(conn) => conn,
            Err(_) => {
                warn!("could not connect to {}", peer);
                continue;
            }
        };
        info!("connected to {}", peer);

        wire::send_opcode(&mut conn, Opcode::SendCatalog).await?;
        receive_file(Path::new(GLOBAL_DB_FILE), &mut conn).await?;

        if opt.enable_server {
            info!("joining cluster via {}", peer);
            wire::send_opcode(&mut conn, Opcode::JoinCluster).await?;
            let port: u16 = opt.port.parse().context("--port is not a valid u16")?;
            wire::send_port(&mut conn, port).await?;
            let reply = wire::read_opcode(&mut conn).await;
            if reply == Opcode::Ack as u8 {
                info!("joined the cluster");
            } else {
                error!("cluster join was refused, check port forwarding");
                anyhow::bail!("join refused by {}", peer);
            }
        }

        connected = Some(peer.clone());
        break;
    }

    let connected = match connected {
        Some(peer) => peer,
        None => {
            if opt.enable_server {
                warn!("no peer reachable; starting with an empty catalog");
                if !Path::new(GLOBAL_DB_FILE).exists() {
                    Catalog::open(GLOBAL_DB_FILE)?;
                }
                return Ok(());
            }
            anyhow::bail!("could not connect to any server in {}", SERVER_LIST_FILE);
        }
    };

    info!("refreshing peer list from {}", connected);
    let mut conn = TcpStream::connect(&connected).await?;
    wire::send_opcode(&mut conn, Opcode::GetPeerList).await?;
    receive_file(Path::new(SERVER_LIST_FILE), &mut conn).await?;
    peers.refresh().await?;

    Ok(())
}
