use anyhow::Result;
use bucketfs_engine::Operation;
use clap::Args as ClapArgs;
use tracing::instrument;

use super::parse_path;
use crate::session::Session;

#[derive(ClapArgs)]
pub struct Args {
    /// Source path
    pub source: String,

    /// Destination path
    pub dest: String,
}

#[instrument(level = "info", name = "cmd::mv", skip_all, fields(source = %args.source, dest = %args.dest))]
pub async fn execute(session: &Session, args: &Args) -> Result<()> {
    let source = parse_path(&args.source)?;
    let dest = parse_path(&args.dest)?;

    let (parent, name) = session.lookup_parent(&source).await?;
    let renamed = match session.lookup_parent(&dest).await {
        Ok((new_parent, new_name)) => {
            let renamed = session
                .call(Operation::Rename {
                    parent,
                    name,
                    new_parent,
                    new_name,
                })
                .await;
            session.forget(new_parent).await;
            renamed
        }
        Err(e) => Err(e),
    };
    session.forget(parent).await;
    renamed?;
    Ok(())
}
