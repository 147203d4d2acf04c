use anyhow::Result;
use clap::Args as ClapArgs;
use tracing::instrument;

use super::parse_path;
use crate::output::{create_table, format_entry_type, format_mtime, format_size};
use crate::session::Session;

#[derive(ClapArgs)]
pub struct Args {
    /// File or directory path
    pub path: String,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[instrument(level = "info", name = "cmd::stat", skip_all, fields(path = %args.path))]
pub async fn execute(session: &Session, args: &Args) -> Result<()> {
    let path = parse_path(&args.path)?;
    let entry = session.lookup(&path).await?;
    session.forget(entry.handle).await;
    let attr = &entry.attributes;

    if args.json {
        let output = serde_json::json!({
            "path": path.as_str(),
            "kind": attr.kind,
            "size": attr.size,
            "mtime": format_mtime(attr.mtime),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    let mut table = create_table();
    table.add_row(vec!["Path".to_string(), path.to_string()]);
    table.add_row(vec!["Type".to_string(), format_entry_type(attr.kind).to_string()]);
    table.add_row(vec!["Size".to_string(), format!("{} ({} bytes)", format_size(attr.size), attr.size)]);
    table.add_row(vec!["Modified".to_string(), format_mtime(attr.mtime)]);
    println!("{table}");
    Ok(())
}
