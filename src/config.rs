//! CLI flags and on-disk layout constants.
//!
//! Flag names and defaults mirror the reference peer's `flag.Bool`/
//! `flag.String` declarations; parsing itself uses `clap`'s derive API.

use clap::Parser;

/// Staging directory for chunks that have been split but not yet uploaded.
pub const TMP_DIR: &str = "tmp";
/// Directory holding chunks this peer stores for the cluster.
pub const STORAGE_DIR: &str = "storage";
/// Directory holding files reassembled by the read pipeline.
pub const DOWNLOAD_DIR: &str = "download";
/// Peer registry, CRLF-separated `host:port` records.
pub const SERVER_LIST_FILE: &str = "server_list.txt";
/// Catalog database file.
pub const GLOBAL_DB_FILE: &str = "global.db";

/// Maximum size of a single chunk (32 MiB).
pub const CHUNK_SIZE: u64 = 32 * 1024 * 1024;
/// Read buffer used while streaming chunk payloads over the wire.
pub const TRANSPORT_READ_BUFFER: usize = 2 * 1024 * 1024;
/// Target replication factor for a chunk; degrades to 1 if only one peer
/// is reachable at upload time.
pub const REPLICATION_FACTOR: usize = 2;
/// Maximum number of chunks downloaded concurrently by the read pipeline.
pub const DOWNLOAD_CONCURRENCY: usize = 2;

#[derive(Parser, Debug, Clone)]
#[clap(name = "chunkmesh", about = "Peer-to-peer content-addressed chunk cluster")]
pub struct Opt {
    /// Enable the server (accept incoming connections from peers/clients).
    #[clap(long = "enable-server")]
    pub enable_server: bool,

    /// Listening port (only meaningful with --enable-server).
    #[clap(long, default_value = "2333")]
    pub port: String,

    /// First server in the cluster: skip peer discovery, start with an
    /// empty catalog.
    #[clap(long = "first-server")]
    pub first_server: bool,

    /// Verbose logging.
    #[clap(short = 'v', long, parse(try_from_str), default_value = "true")]
    pub verbose: bool,
}

impl Opt {
    pub fn parse_args() -> Self {
        Opt::parse()
    }
}
