use anyhow::Result;
use bucketfs_core::{FsError, FsPath};
use bucketfs_engine::{Operation, Response};
use clap::Args as ClapArgs;
use tracing::instrument;

use super::parse_path;
use crate::session::Session;

#[derive(ClapArgs)]
pub struct Args {
    /// Directory path to create
    pub path: String,

    /// Create parent directories as needed
    #[arg(short, long)]
    pub parents: bool,
}

#[instrument(level = "info", name = "cmd::mkdir", skip_all, fields(path = %args.path, parents = args.parents))]
pub async fn execute(session: &Session, args: &Args) -> Result<()> {
    let path = parse_path(&args.path)?;
    if !args.parents {
        make_dir(session, &path).await?;
        return Ok(());
    }

    let mut current = FsPath::root();
    for name in path.components() {
        current = current.join(name)?;
        match make_dir(session, &current).await {
            Ok(()) => {}
            // Existing directories are fine with -p; files are not.
            Err(FsError::AlreadyExists(_)) => {
                let entry = session.lookup(&current).await?;
                session.forget(entry.handle).await;
                if !entry.attributes.kind.is_dir() {
                    return Err(FsError::not_a_directory(current.as_str()).into());
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

async fn make_dir(session: &Session, path: &FsPath) -> Result<(), FsError> {
    let (parent, name) = session.lookup_parent(path).await?;
    let made = session.call(Operation::Mkdir { parent, name }).await;
    session.forget(parent).await;
    if let Response::Entry(entry) = made? {
        session.forget(entry.handle).await;
    }
    Ok(())
}
