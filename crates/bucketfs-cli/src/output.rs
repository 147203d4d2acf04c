//! Table and size formatting shared by the commands.

use std::time::{SystemTime, UNIX_EPOCH};

use bucketfs_core::EntryKind;
use bucketfs_engine::format_bytes;
use comfy_table::presets::UTF8_FULL_CONDENSED;
use comfy_table::{ContentArrangement, Table};

pub fn create_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

pub fn format_entry_type(kind: EntryKind) -> &'static str {
    match kind {
        EntryKind::Directory => "dir",
        EntryKind::File => "file",
    }
}

pub fn format_size(size: u64) -> String {
    format_bytes(size)
}

/// Seconds since the Unix epoch, or `-` when unknown.
pub fn format_mtime(mtime: Option<SystemTime>) -> String {
    mtime
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or_else(|| "-".to_string(), |d| d.as_secs().to_string())
}
