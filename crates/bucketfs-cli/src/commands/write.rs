use std::io::{self, Read};

use anyhow::{Context, Result};
use bucketfs_engine::{HandleId, OpenMode, Operation, Response};
use bytes::Bytes;
use clap::Args as ClapArgs;
use tracing::instrument;

use super::parse_path;
use crate::session::{IO_CHUNK, Session};

#[derive(ClapArgs)]
pub struct Args {
    /// Destination file path
    pub file: String,

    /// Append to the file instead of replacing it
    #[arg(short, long)]
    pub append: bool,
}

#[instrument(level = "info", name = "cmd::write", skip_all, fields(file = %args.file, append = args.append))]
pub async fn execute(session: &Session, args: &Args) -> Result<()> {
    let path = parse_path(&args.file)?;
    let mut content = Vec::new();
    io::stdin()
        .read_to_end(&mut content)
        .context("Failed to read stdin")?;

    let mode = if args.append {
        OpenMode::READ_WRITE.append()
    } else {
        OpenMode::READ_WRITE.truncate()
    };
    let (parent, name) = session.lookup_parent(&path).await?;
    let created = session
        .call(Operation::Create {
            parent,
            name,
            mode,
            exclusive: false,
        })
        .await;
    session.forget(parent).await;
    let handle = match created? {
        Response::Created(entry) => entry.handle,
        other => anyhow::bail!("Unexpected create reply: {other:?}"),
    };

    let result = write_all(session, handle, Bytes::from(content)).await;
    session.release(handle).await;
    session.forget(handle).await;
    let written = result?;
    eprintln!("Wrote {written} bytes to {path}");
    Ok(())
}

async fn write_all(session: &Session, handle: HandleId, content: Bytes) -> Result<u64> {
    let mut offset = 0u64;
    for chunk in content.chunks(IO_CHUNK) {
        let written = session
            .write(handle, offset, content.slice_ref(chunk))
            .await?;
        offset += u64::from(written);
    }
    session
        .call(Operation::Fsync {
            handle,
            datasync: false,
        })
        .await
        .context("Failed to flush written data")?;
    Ok(offset)
}
