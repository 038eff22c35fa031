use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::chunker::DEFAULT_CHUNK_SIZE;

/// Content type sent for objects fetched through the catch-all route.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum CatchAllContentType {
    /// Always `application/octet-stream`.
    #[default]
    OctetStream,
    /// Derived from the key's suffix, like the category route does.
    Infer,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// A TUF repository serving signed metadata and content-addressed targets.
#[derive(Debug, Clone, Parser)]
#[command(name = "tufrepo", version, about)]
pub struct Config {
    /// Address to listen on.
    #[arg(long, env = "TUF_LISTEN", default_value = "127.0.0.1:8000")]
    pub listen: SocketAddr,

    /// Directory of the persistent store. Objects are kept in memory if unset.
    #[arg(long, env = "TUF_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Seconds a single blob store operation may take.
    #[arg(long, env = "TUF_STORE_TIMEOUT_SECS", default_value_t = 10)]
    pub store_timeout_secs: u64,

    /// Largest accepted upload request body.
    #[arg(long, env = "TUF_MAX_UPLOAD_BYTES", default_value_t = 512 * 1024 * 1024)]
    pub max_upload_bytes: usize,

    /// Size of the chunks stored objects are split into.
    #[arg(long, env = "TUF_CHUNK_SIZE", default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,

    #[arg(long, env = "TUF_CATCH_ALL_CONTENT_TYPE", value_enum, default_value_t)]
    pub catch_all_content_type: CatchAllContentType,

    #[arg(long, env = "TUF_REPO_NAME", default_value = "TUF Repository")]
    pub repo_name: String,

    #[arg(
        long,
        env = "TUF_REPO_DESCRIPTION",
        default_value = "A TUF-compliant repository backed by a content-addressed blob store"
    )]
    pub repo_description: String,

    #[arg(long, env = "TUF_LOG_FORMAT", value_enum, default_value_t)]
    pub log_format: LogFormat,

    /// Also append plain-text logs to this file.
    #[arg(long, env = "TUF_LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

impl Config {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }
}
