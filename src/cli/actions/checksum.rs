use crate::{
    cli::globals::GlobalArgs,
    storage::{Client, DeviceRecord, PgStorage},
};
use anyhow::{Context, Result};
use secrecy::ExposeSecret;
use sha1::{Digest, Sha1};
use std::fmt::Write;
use tracing::debug;

/// Hex characters printed from the digest.
const CHECKSUM_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Clients,
    Deactivated,
}

#[derive(Debug)]
pub struct Args {
    pub globals: GlobalArgs,
    pub table: Table,
    pub print: bool,
}

/// Execute the checksum action.
/// # Errors
/// Returns an error if the database cannot be read.
pub async fn execute(args: Args) -> Result<()> {
    let storage = PgStorage::connect(args.globals.dsn.expose_secret())
        .await
        .context("Failed to connect to database")?;

    let rows = match args.table {
        Table::Clients => client_rows(&storage.clients().await.context("Failed to read clients")?),
        Table::Deactivated => device_rows(
            &storage
                .deactivated_devices()
                .await
                .context("Failed to read deactivated yubikeys")?,
        ),
    };

    debug!("checksum over {} bytes of {:?} rows", rows.len(), args.table);

    if args.print {
        print!("{rows}");
    }

    println!("{}", checksum(&rows));

    Ok(())
}

fn client_rows(clients: &[Client]) -> String {
    clients.iter().fold(String::new(), |mut rows, client| {
        let _ = writeln!(
            rows,
            "{}\t{}\t{}",
            client.id,
            u8::from(client.active),
            client.secret
        );
        rows
    })
}

fn device_rows(devices: &[DeviceRecord]) -> String {
    devices.iter().fold(String::new(), |mut rows, device| {
        let _ = writeln!(
            rows,
            "{}\t{}\t{}",
            device.public_name, device.session_counter, device.use_counter
        );
        rows
    })
}

fn checksum(rows: &str) -> String {
    let mut hex = hex::encode(Sha1::digest(rows.as_bytes()));
    hex.truncate(CHECKSUM_LEN);
    hex
}
