//! Stats command - cache pool counters and occupancy.
//!
//! Each invocation starts a fresh pool, so the counters describe the files
//! named on the command line: each is read twice, once cold and once warm.

use anyhow::Result;
use bucketfs_engine::{OpenMode, PoolStatsSnapshot, format_bytes};
use clap::Args as ClapArgs;
use tracing::instrument;

use super::parse_path;
use crate::output::create_table;
use crate::session::Session;

#[derive(ClapArgs)]
pub struct Args {
    /// Files to read through the cache before reporting
    pub files: Vec<String>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[instrument(level = "info", name = "cmd::stats", skip_all, fields(files = args.files.len()))]
pub async fn execute(session: &Session, args: &Args) -> Result<()> {
    for file in &args.files {
        let path = parse_path(file)?;
        let entry = session.lookup(&path).await?;
        let handle = entry.handle;
        let result = async {
            session.open_file(handle, OpenMode::READ_ONLY).await?;
            for _ in 0..2 {
                let mut offset = 0u64;
                loop {
                    let chunk = session.read(handle, offset).await?;
                    if chunk.is_empty() {
                        break;
                    }
                    offset += chunk.len() as u64;
                }
            }
            session.release(handle).await;
            Ok::<_, bucketfs_core::FsError>(())
        }
        .await;
        session.forget(handle).await;
        result?;
    }

    let stats = session.stats();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        print_stats_table(&stats);
    }
    Ok(())
}

fn print_stats_table(stats: &PoolStatsSnapshot) {
    let mut table = create_table();
    table.set_header(vec!["Counter", "Value"]);
    let rows: [(&str, String); 12] = [
        ("Hits", stats.hits.to_string()),
        ("Misses", stats.misses.to_string()),
        ("Hit rate", format!("{:.1}%", stats.hit_rate() * 100.0)),
        ("Fetches", stats.fetches.to_string()),
        ("Coalesced fetches", stats.coalesced.to_string()),
        ("Evictions (clean)", stats.evictions_clean.to_string()),
        ("Evictions (flushed)", stats.evictions_flushed.to_string()),
        ("Flushes", stats.flushes.to_string()),
        ("Flush failures", stats.flush_failures.to_string()),
        ("Expired blocks", stats.expired.to_string()),
        ("Write-through", stats.write_through.to_string()),
        ("Bytes cached", format_bytes(stats.bytes_in_use())),
    ];
    for (name, value) in rows {
        table.add_row(vec![name.to_string(), value]);
    }
    println!("{table}");

    let mut classes = create_table();
    classes.set_header(vec!["Block size", "Blocks", "In use"]);
    for class in &stats.classes {
        classes.add_row(vec![
            format_bytes(class.block_size as u64),
            class.blocks.to_string(),
            (class.blocks - class.free).to_string(),
        ]);
    }
    println!("{classes}");
}
