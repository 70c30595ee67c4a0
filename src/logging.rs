// ============================================
// logging.rs - Log file setup
// ============================================
//
// The executable usually runs without a console, so everything goes to
// a log file (wayk_cse.log in the temp directory unless --log-file says
// otherwise). Lines look like:
//
//   2026-10-18T12:00:00Z [INFO] src/deploy.rs:151: Bundle extracted: ...
//
// RUST_LOG, when set, takes precedence over --log-level.
// ============================================

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use env_logger::{Builder, Env, Target};
use log::LevelFilter;

pub const DEFAULT_LOG_FILE_NAME: &str = "wayk_cse.log";

pub fn default_log_path() -> PathBuf {
    std::env::temp_dir().join(DEFAULT_LOG_FILE_NAME)
}

/// Logger configuration writing to `path` (appending). RUST_LOG is not
/// consulted here; `init` layers it on top.
pub fn builder(path: &Path, level: LevelFilter) -> Result<Builder> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path.display()))?;

    let mut builder = Builder::new();
    builder
        .filter_level(level)
        .target(Target::Pipe(Box::new(file)))
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}:{}: {}",
                buf.timestamp_seconds(),
                record.level(),
                record.file().unwrap_or("?"),
                record.line().unwrap_or(0),
                record.args()
            )
        });
    Ok(builder)
}

/// Install the global logger. Call once, at startup.
pub fn init(path: &Path, level: LevelFilter) -> Result<()> {
    builder(path, level)?
        .parse_env(Env::default())
        .try_init()
        .context("Logger was already initialized")
}
