use std::io::{self, Write};

use anyhow::Result;
use bucketfs_engine::{HandleId, OpenMode};
use clap::Args as ClapArgs;
use tracing::instrument;

use super::parse_path;
use crate::session::Session;

#[derive(ClapArgs)]
pub struct Args {
    /// File path
    pub file: String,
}

#[instrument(level = "info", name = "cmd::cat", skip_all, fields(file = %args.file))]
pub async fn execute(session: &Session, args: &Args) -> Result<()> {
    let path = parse_path(&args.file)?;
    let entry = session.lookup(&path).await?;
    let handle = entry.handle;
    let result = cat_open(session, handle).await;
    session.forget(handle).await;
    result
}

async fn cat_open(session: &Session, handle: HandleId) -> Result<()> {
    session.open_file(handle, OpenMode::READ_ONLY).await?;
    let copied = copy_to_stdout(session, handle).await;
    session.release(handle).await;
    copied
}

async fn copy_to_stdout(session: &Session, handle: HandleId) -> Result<()> {
    let mut stdout = io::stdout();
    let mut offset = 0u64;
    loop {
        let chunk = session.read(handle, offset).await?;
        if chunk.is_empty() {
            break;
        }
        stdout.write_all(&chunk)?;
        offset += chunk.len() as u64;
    }
    stdout.flush()?;
    Ok(())
}
