pub mod checksum;
pub mod export;
pub mod gen;
pub mod import;
pub mod server;

// Internal "interpreter" for `Action`.
mod run;

#[derive(Debug)]
pub enum Action {
    Server(server::Args),
    Checksum(checksum::Args),
    Gen(gen::Args),
    Export(export::Args),
    Import(import::Args),
}

impl Action {
    /// Execute the action.
    /// # Errors
    /// Returns an error if the action fails.
    pub async fn execute(self) -> anyhow::Result<()> {
        run::execute(self).await
    }
}
