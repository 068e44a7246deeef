//! violations_export - dump stored violation records as JSON

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;

use overload_watch::{SqliteViolationStore, ViolationRecord, ViolationStore};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the violations database.
    #[arg(long, env = "OVERLOAD_DB_PATH", default_value = "illegal_vehicles.db")]
    db_path: String,
    /// Output file; stdout when omitted.
    #[arg(long)]
    output: Option<String>,
    /// Only records still waiting for analysis.
    #[arg(long)]
    pending: bool,
}

#[derive(Serialize)]
struct ExportArtifact {
    exported_at: String,
    db_path: String,
    count: usize,
    records: Vec<ViolationRecord>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut store = SqliteViolationStore::open(&args.db_path)?;
    let records = if args.pending {
        store.list_pending()?
    } else {
        store.list_all()?
    };
    let artifact = ExportArtifact {
        exported_at: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        db_path: args.db_path,
        count: records.len(),
        records,
    };
    let json = serde_json::to_string_pretty(&artifact)?;

    match args.output {
        Some(path) => {
            std::fs::write(&path, json).with_context(|| format!("write export {}", path))?;
            log::info!("exported {} records to {}", artifact.count, path);
        }
        None => println!("{}", json),
    }
    Ok(())
}
