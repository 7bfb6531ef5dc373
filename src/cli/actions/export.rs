use crate::{
    cli::globals::GlobalArgs,
    storage::{postgres::ClientRecord, DeviceRecord, PgStorage},
};
use anyhow::{Context, Result};
use secrecy::ExposeSecret;
use tracing::debug;

/// Table moved by `export` and `import`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dataset {
    Keys,
    Clients,
}

#[derive(Debug)]
pub struct Args {
    pub globals: GlobalArgs,
    pub dataset: Dataset,
}

/// Execute the export action.
/// # Errors
/// Returns an error if the database cannot be read.
pub async fn execute(args: Args) -> Result<()> {
    let storage = PgStorage::connect(args.globals.dsn.expose_secret())
        .await
        .context("Failed to connect to database")?;

    let lines: Vec<String> = match args.dataset {
        Dataset::Keys => storage
            .devices()
            .await
            .context("Failed to read yubikeys")?
            .iter()
            .map(key_line)
            .collect(),
        Dataset::Clients => storage
            .client_records()
            .await
            .context("Failed to read clients")?
            .iter()
            .map(client_line)
            .collect(),
    };

    debug!("exporting {} {:?} rows", lines.len(), args.dataset);

    for line in lines {
        println!("{line}");
    }

    Ok(())
}

/// `active,created_at,modified_at,public_name,session_counter,use_counter,low,high,nonce,notes`
pub(crate) fn key_line(device: &DeviceRecord) -> String {
    format!(
        "{},{},{},{},{},{},{},{},{},{}",
        u8::from(device.active),
        device.created_at,
        device.modified_at,
        device.public_name,
        device.session_counter,
        device.use_counter,
        device.timestamp_low,
        device.timestamp_high,
        device.nonce,
        device.notes
    )
}

/// `id,active,created,secret,email,notes,otp`
pub(crate) fn client_line(client: &ClientRecord) -> String {
    format!(
        "{},{},{},{},{},{},{}",
        client.id,
        u8::from(client.active),
        client.created,
        client.secret,
        client.email,
        client.notes,
        client.otp
    )
}
