use anyhow::{Result, bail};
use bucketfs_core::{EntryKind, FsError, FsPath};
use bucketfs_engine::Operation;
use clap::Args as ClapArgs;
use tracing::instrument;

use super::parse_path;
use crate::session::Session;

#[derive(ClapArgs)]
pub struct Args {
    /// Path to remove
    pub path: String,

    /// Remove directories and their contents recursively
    #[arg(short, long)]
    pub recursive: bool,

    /// Ignore nonexistent paths
    #[arg(short, long)]
    pub force: bool,
}

#[derive(Debug, Default)]
struct RemoveStats {
    files: usize,
    directories: usize,
}

#[instrument(level = "info", name = "cmd::rm", skip_all, fields(path = %args.path, recursive = args.recursive))]
pub async fn execute(session: &Session, args: &Args) -> Result<()> {
    let path = parse_path(&args.path)?;
    if path.is_root() {
        bail!("Refusing to remove the root directory");
    }

    let kind = match session.lookup(&path).await {
        Ok(entry) => {
            session.forget(entry.handle).await;
            entry.attributes.kind
        }
        Err(FsError::NotFound(_)) if args.force => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    match kind {
        EntryKind::File => remove(session, &path, kind).await?,
        EntryKind::Directory if args.recursive => {
            let mut stats = RemoveStats::default();
            remove_tree(session, path, &mut stats).await?;
            eprintln!("Deleted {} files and {} directories", stats.files, stats.directories);
        }
        EntryKind::Directory => remove(session, &path, kind).await?,
    }
    Ok(())
}

async fn remove(session: &Session, path: &FsPath, kind: EntryKind) -> Result<(), FsError> {
    let (parent, name) = session.lookup_parent(path).await?;
    let op = match kind {
        EntryKind::File => Operation::Unlink { parent, name },
        EntryKind::Directory => Operation::Rmdir { parent, name },
    };
    let removed = session.call(op).await;
    session.forget(parent).await;
    removed.map(|_| ())
}

/// Depth-first removal. Directories are emptied level by level so the
/// recursion stays an explicit stack.
async fn remove_tree(session: &Session, root: FsPath, stats: &mut RemoveStats) -> Result<(), FsError> {
    // (path, children already removed)
    let mut stack = vec![(root, false)];
    while let Some((dir, emptied)) = stack.pop() {
        if emptied {
            remove(session, &dir, EntryKind::Directory).await?;
            stats.directories += 1;
            continue;
        }

        let entry = session.lookup(&dir).await?;
        let listed = session.read_dir(entry.handle).await;
        session.forget(entry.handle).await;

        stack.push((dir.clone(), true));
        for child in listed? {
            let child_path = dir.join(&child.name)?;
            match child.kind {
                EntryKind::File => {
                    remove(session, &child_path, EntryKind::File).await?;
                    stats.files += 1;
                }
                EntryKind::Directory => stack.push((child_path, false)),
            }
        }
    }
    Ok(())
}
