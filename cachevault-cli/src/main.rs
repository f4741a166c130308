//! cachevault CLI - inspect and manage cache databases.
//!
//! The CLI opens a database the same way an embedding application would,
//! so `stats` needs the key file the application uses. `clear` only
//! rewrites the version file and works without the key.

mod error;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cachevault::{Database, EncryptionKey, Settings};
use error::CliError;

#[derive(Debug, Parser)]
#[command(name = "cachevault", version, about = "Manage cachevault databases")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show entry counts and sizes for a database
    Stats {
        /// Base directory of the database
        #[arg(long)]
        base: PathBuf,
        /// File holding the 256 bytes of key material
        #[arg(long)]
        key_file: PathBuf,
        /// Open without estimated-time tracking (must match the database)
        #[arg(long)]
        no_estimated_time: bool,
    },
    /// Point the database at a fresh empty version
    Clear {
        /// Base directory of the database
        #[arg(long)]
        base: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    if let Err(error) = run(cli).await {
        error.exit();
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Commands::Stats {
            base,
            key_file,
            no_estimated_time,
        } => {
            let key = load_key(&key_file)?;
            let settings =
                Settings::default().with_track_estimated_time(!no_estimated_time);
            let db = Database::new(&base, settings);
            db.open(key).await?;
            let stats = db.stats().await;
            db.close().await;

            println!("Database: {}", base.display());
            println!("  Version: {}", stats.version);
            println!("  Entries: {}", stats.entries);
            println!("  Data:    {}", format_size(stats.total_size.max(0) as u64));
            println!("  Binlog:  {}", format_size(stats.binlog_size));
            println!(
                "  Excess:  {}",
                format_size(stats.binlog_excess_length.max(0) as u64)
            );
            Ok(())
        }
        Commands::Clear { base } => {
            let db = Database::new(&base, Settings::default());
            db.clear().await?;
            println!("Database cleared: {}", base.display());
            println!("The old version directory is removed on the next open.");
            Ok(())
        }
    }
}

fn load_key(path: &Path) -> Result<EncryptionKey, CliError> {
    let bytes = std::fs::read(path).map_err(|error| CliError::KeyFile {
        path: path.to_path_buf(),
        problem: error.to_string(),
    })?;
    if bytes.len() != EncryptionKey::SIZE {
        return Err(CliError::KeyFile {
            path: path.to_path_buf(),
            problem: format!(
                "expected {} bytes of key material, found {}",
                EncryptionKey::SIZE,
                bytes.len()
            ),
        });
    }
    Ok(EncryptionKey::new(bytes))
}

/// Format a byte count for humans.
fn format_size(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * KIB;
    const GIB: u64 = 1024 * MIB;
    if bytes >= GIB {
        format!("{:.2} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{} B", bytes)
    }
}
