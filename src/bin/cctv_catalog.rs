//! cctv_catalog - list public highway CCTV streams in a bounding box

use anyhow::Result;
use clap::Parser;

use overload_watch::catalog::{self, CatalogQuery};
use overload_watch::config::AppConfig;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// ITS open API key; overrides catalog.api_key.
    #[arg(long, env = "OVERLOAD_CATALOG_API_KEY")]
    api_key: Option<String>,
    #[arg(long)]
    min_x: Option<f64>,
    #[arg(long)]
    max_x: Option<f64>,
    #[arg(long)]
    min_y: Option<f64>,
    #[arg(long)]
    max_y: Option<f64>,
    /// Print JSON instead of "name<TAB>url" lines.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut settings = AppConfig::load()?.catalog;
    if args.api_key.is_some() {
        settings.api_key = args.api_key;
    }
    let defaults = CatalogQuery::from(&settings);
    let query = CatalogQuery {
        min_x: args.min_x.unwrap_or(defaults.min_x),
        max_x: args.max_x.unwrap_or(defaults.max_x),
        min_y: args.min_y.unwrap_or(defaults.min_y),
        max_y: args.max_y.unwrap_or(defaults.max_y),
    };

    let entries = catalog::fetch(&settings, &query)?;
    log::info!("{} cameras in [{}, {}] x [{}, {}]", entries.len(), query.min_x, query.max_x, query.min_y, query.max_y);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        for entry in entries {
            println!("{}\t{}", entry.name, entry.url);
        }
    }
    Ok(())
}
