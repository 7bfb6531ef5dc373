use crate::cli::actions::{checksum, export, gen, import, server, Action};
use anyhow::Result;

/// Execute the provided action.
/// # Errors
/// Returns an error if the action fails.
pub async fn execute(action: Action) -> Result<()> {
    match action {
        Action::Server(args) => server::execute(args).await,
        Action::Checksum(args) => checksum::execute(args).await,
        Action::Gen(args) => gen::execute(args).await,
        Action::Export(args) => export::execute(args).await,
        Action::Import(args) => import::execute(args).await,
    }
}
