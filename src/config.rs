//! Runtime configuration.
//!
//! Every option can be given on the command line or through a `STE_*`
//! environment variable (a `.env` file is loaded first). Paths that are not
//! given explicitly live under the data directory.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;

const DEFAULT_CACHE_TTL_SECS: u64 = 3600;
const DEFAULT_SESSION_TTL_SECS: u64 = 12 * 60 * 60;
const DEFAULT_UPLOAD_LIMIT: usize = 25 * 1024 * 1024;

#[derive(Debug, Clone, Parser)]
#[command(name = "releves-ste", version, about = "Relevés et rapports des stations d'épuration")]
pub struct Cli {
    /// Address the web server listens on
    #[arg(long, env = "STE_BIND", default_value = "0.0.0.0:5000")]
    pub bind: SocketAddr,

    /// Directory holding the workbook, logs, photos and chart cache
    #[arg(long, env = "STE_DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,

    /// Measurement workbook (default: <data-dir>/mesures.xlsx)
    #[arg(long, env = "STE_WORKBOOK")]
    pub workbook: Option<PathBuf>,

    /// Chart cache lifetime in seconds
    #[arg(long, env = "STE_CACHE_TTL", default_value_t = DEFAULT_CACHE_TTL_SECS)]
    pub cache_ttl: u64,

    /// Session lifetime in seconds
    #[arg(long, env = "STE_SESSION_TTL", default_value_t = DEFAULT_SESSION_TTL_SECS)]
    pub session_ttl: u64,

    /// Accepted access codes, comma separated
    #[arg(long, env = "STE_ACCESS_CODES", value_delimiter = ',', default_values_t = [12u8, 13, 14])]
    pub access_codes: Vec<u8>,

    /// Largest accepted upload body in bytes
    #[arg(long, env = "STE_UPLOAD_LIMIT", default_value_t = DEFAULT_UPLOAD_LIMIT)]
    pub upload_limit: usize,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: SocketAddr,
    pub workbook_path: PathBuf,
    pub cache_dir: PathBuf,
    pub cache_ttl: Duration,
    pub reports_log_path: PathBuf,
    pub photos_dir: PathBuf,
    pub photo_log_path: PathBuf,
    pub access_codes: Vec<u8>,
    pub session_ttl: Duration,
    pub upload_limit: usize,
}

impl Config {
    /// Reads `.env`, then the command line and environment.
    pub fn load() -> Self {
        dotenvy::dotenv().ok();
        Self::from(Cli::parse())
    }

    /// Default layout rooted at `data_dir`.
    pub fn with_data_dir(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref();
        Config {
            bind: SocketAddr::from(([127, 0, 0, 1], 5000)),
            workbook_path: data_dir.join("mesures.xlsx"),
            cache_dir: data_dir.join("cache"),
            cache_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            reports_log_path: data_dir.join("rapports.json"),
            photos_dir: data_dir.join("photos_releves"),
            photo_log_path: data_dir.join("releves_20.json"),
            access_codes: vec![12, 13, 14],
            session_ttl: Duration::from_secs(DEFAULT_SESSION_TTL_SECS),
            upload_limit: DEFAULT_UPLOAD_LIMIT,
        }
    }
}

impl From<Cli> for Config {
    fn from(cli: Cli) -> Self {
        let mut config = Config::with_data_dir(&cli.data_dir);
        config.bind = cli.bind;
        if let Some(workbook) = cli.workbook {
            config.workbook_path = workbook;
        }
        config.cache_ttl = Duration::from_secs(cli.cache_ttl);
        config.session_ttl = Duration::from_secs(cli.session_ttl);
        config.access_codes = cli.access_codes;
        config.upload_limit = cli.upload_limit;
        config
    }
}
