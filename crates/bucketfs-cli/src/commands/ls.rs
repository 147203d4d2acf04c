//! List command - list directory contents.
//!
//! # Examples
//!
//! ```bash
//! # List root directory
//! bucketfs --root /srv/data ls
//!
//! # List with details
//! bucketfs --root /srv/data ls -l /documents
//!
//! # Output as JSON for scripting
//! bucketfs --root /srv/data ls --json / | jq '.entries[].name'
//! ```

use anyhow::Result;
use bucketfs_core::EntryKind;
use bucketfs_engine::DirEntryReply;
use clap::Args as ClapArgs;
use serde::Serialize;
use tracing::instrument;

use super::parse_path;
use crate::output::{create_table, format_entry_type, format_size};
use crate::session::Session;

#[derive(ClapArgs, Clone)]
pub struct Args {
    /// Path to list (default: root)
    #[arg(default_value = "/")]
    pub path: String,

    /// Show detailed information
    #[arg(short, long)]
    pub long: bool,

    /// Show entries starting with a dot
    #[arg(short, long)]
    pub all: bool,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Serialize)]
struct LsOutput<'a> {
    path: &'a str,
    entries: Vec<&'a DirEntryReply>,
}

#[instrument(level = "info", name = "cmd::ls", skip_all, fields(path = %args.path))]
pub async fn execute(session: &Session, args: &Args) -> Result<()> {
    let path = parse_path(&args.path)?;
    let entry = session.lookup(&path).await?;

    let listed = if entry.attributes.kind == EntryKind::Directory {
        session.read_dir(entry.handle).await
    } else {
        // A file lists as itself.
        Ok(vec![DirEntryReply {
            name: path.name().unwrap_or_default().to_string(),
            kind: EntryKind::File,
            size: entry.attributes.size,
            offset: 1,
        }])
    };
    session.forget(entry.handle).await;
    let listed = listed?;

    let entries: Vec<&DirEntryReply> = listed
        .iter()
        .filter(|e| args.all || !e.name.starts_with('.'))
        .collect();

    if args.json {
        let output = LsOutput {
            path: path.as_str(),
            entries,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else if args.long {
        print_long_format(&entries);
    } else {
        for entry in entries {
            match entry.kind {
                EntryKind::Directory => println!("{}/", entry.name),
                EntryKind::File => println!("{}", entry.name),
            }
        }
    }
    Ok(())
}

fn print_long_format(entries: &[&DirEntryReply]) {
    let mut table = create_table();
    table.set_header(vec!["Type", "Size", "Name"]);

    for entry in entries {
        let (size, name) = match entry.kind {
            EntryKind::Directory => ("-".to_string(), format!("{}/", entry.name)),
            EntryKind::File => (format_size(entry.size), entry.name.clone()),
        };
        table.add_row(vec![format_entry_type(entry.kind).to_string(), size, name]);
    }

    println!("{table}");
}
