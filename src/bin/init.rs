//! protomud_init - World database bootstrap tool
//!
//! Creates the database if needed and brings it to a usable state. Safe to
//! re-run: existing objects, aliases and methods are left alone.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// protomud database bootstrap tool
#[derive(Parser, Debug)]
#[command(
    name = "protomud_init",
    version,
    about = "Create or bootstrap a protomud world database"
)]
struct Args {
    /// Path to the SQLite database file
    #[arg(short, long)]
    database: PathBuf,

    /// Lua files attached to the root object as methods named after the
    /// file stem (can be specified multiple times)
    #[arg(long = "lib")]
    libs: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "protomud=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Parse CLI arguments
    let args = Args::parse();

    // Load Lua library files
    let mut libs = BTreeMap::new();
    for lib_path in &args.libs {
        if !lib_path.exists() {
            bail!("Library file not found: {}", lib_path.display());
        }

        let name = lib_path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| anyhow::anyhow!("Invalid library filename: {}", lib_path.display()))?
            .to_string();

        let source = std::fs::read_to_string(lib_path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", lib_path.display(), e))?;

        libs.insert(name, source);
    }

    let report = protomud::bootstrap::init_database(&args.database, libs).await?;
    if !report.libs_skipped.is_empty() {
        info!(
            "Kept existing root methods: {}",
            report.libs_skipped.join(", ")
        );
    }

    Ok(())
}
