use crate::{
    cli::globals::GlobalArgs,
    storage::{postgres::ClientProfile, Client, PgStorage},
};
use anyhow::{Context, Result};
use base64ct::{Base64, Encoding};
use rand::{rngs::OsRng, RngCore};
use secrecy::ExposeSecret;
use tracing::info;

/// Random bytes behind every client secret.
const SECRET_LEN: usize = 20;

#[derive(Debug)]
pub struct Args {
    pub globals: GlobalArgs,
    pub count: u32,
    pub profile: ClientProfile,
}

/// Execute the gen action.
/// # Errors
/// Returns an error if the clients cannot be inserted.
pub async fn execute(args: Args) -> Result<()> {
    let storage = PgStorage::connect(args.globals.dsn.expose_secret())
        .await
        .context("Failed to connect to database")?;

    let secrets: Vec<String> = (0..args.count).map(|_| new_secret(&mut OsRng)).collect();

    let clients = storage
        .insert_clients(&secrets, &args.profile)
        .await
        .context("Failed to insert clients")?;

    info!("created {} clients", clients.len());

    for line in client_lines(&clients) {
        println!("{line}");
    }

    Ok(())
}

fn new_secret<R: RngCore>(rng: &mut R) -> String {
    let mut bytes = [0u8; SECRET_LEN];
    rng.fill_bytes(&mut bytes);
    Base64::encode_string(&bytes)
}

fn client_lines(clients: &[Client]) -> Vec<String> {
    clients
        .iter()
        .map(|client| format!("{},{}", client.id, client.secret))
        .collect()
}
