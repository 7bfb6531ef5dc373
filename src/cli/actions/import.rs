use crate::{
    cli::{actions::export::Dataset, globals::GlobalArgs},
    storage::{postgres::ClientRecord, DeviceRecord, PgStorage},
};
use anyhow::{bail, Context, Result};
use secrecy::ExposeSecret;
use std::str::FromStr;
use tokio::io::AsyncReadExt;
use tracing::info;

const KEY_FIELDS: usize = 10;
const CLIENT_FIELDS: usize = 7;

#[derive(Debug)]
pub struct Args {
    pub globals: GlobalArgs,
    pub dataset: Dataset,
}

/// Execute the import action.
/// # Errors
/// Returns an error if stdin holds a malformed line or the transaction fails.
pub async fn execute(args: Args) -> Result<()> {
    let mut input = String::new();
    tokio::io::stdin()
        .read_to_string(&mut input)
        .await
        .context("Failed to read stdin")?;

    // Parse everything before touching the database.
    match args.dataset {
        Dataset::Keys => {
            let devices = parse_keys(&input)?;
            let storage = connect(&args.globals).await?;
            let written = storage
                .import_devices(&devices)
                .await
                .context("Failed to import yubikeys")?;

            info!("read {} yubikeys, {written} rows written", devices.len());
            println!("Successfully imported yubikeys to database");
        }
        Dataset::Clients => {
            let clients = parse_clients(&input)?;
            let storage = connect(&args.globals).await?;
            let inserted = storage
                .import_clients(&clients)
                .await
                .context("Failed to import clients")?;

            info!("read {} clients, {inserted} rows inserted", clients.len());
            println!("Successfully imported clients to database");
        }
    }

    Ok(())
}

async fn connect(globals: &GlobalArgs) -> Result<PgStorage> {
    PgStorage::connect(globals.dsn.expose_secret())
        .await
        .context("Failed to connect to database")
}

/// Non-blank lines with their 1-based line number.
fn rows(input: &str) -> impl Iterator<Item = (usize, &str)> {
    input
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| (index + 1, line))
}

fn parse_keys(input: &str) -> Result<Vec<DeviceRecord>> {
    rows(input)
        .map(|(number, line)| parse_key(line).with_context(|| format!("yubikey line {number}")))
        .collect()
}

fn parse_clients(input: &str) -> Result<Vec<ClientRecord>> {
    rows(input)
        .map(|(number, line)| parse_client(line).with_context(|| format!("client line {number}")))
        .collect()
}

/// Notes are the last field and may contain commas.
fn parse_key(line: &str) -> Result<DeviceRecord> {
    let fields: Vec<&str> = line.splitn(KEY_FIELDS, ',').collect();
    let [
        active,
        created_at,
        modified_at,
        public_name,
        session_counter,
        use_counter,
        timestamp_low,
        timestamp_high,
        nonce,
        notes,
    ] = fields.as_slice()
    else {
        bail!("expected {KEY_FIELDS} fields, got {}", fields.len());
    };

    if public_name.is_empty() {
        bail!("empty public name");
    }

    Ok(DeviceRecord {
        active: parse_active(active)?,
        created_at: parse_number(created_at, "created_at")?,
        modified_at: parse_number(modified_at, "modified_at")?,
        public_name: (*public_name).to_string(),
        session_counter: parse_number(session_counter, "session_counter")?,
        use_counter: parse_number(use_counter, "use_counter")?,
        timestamp_low: parse_number(timestamp_low, "timestamp_low")?,
        timestamp_high: parse_number(timestamp_high, "timestamp_high")?,
        nonce: (*nonce).to_string(),
        notes: (*notes).to_string(),
    })
}

fn parse_client(line: &str) -> Result<ClientRecord> {
    let fields: Vec<&str> = line.split(',').collect();
    let [id, active, created, secret, email, notes, otp] = fields.as_slice() else {
        bail!("expected {CLIENT_FIELDS} fields, got {}", fields.len());
    };

    Ok(ClientRecord {
        id: parse_number(id, "id")?,
        active: parse_active(active)?,
        created: parse_number(created, "created")?,
        secret: (*secret).to_string(),
        email: (*email).to_string(),
        notes: (*notes).to_string(),
        otp: (*otp).to_string(),
    })
}

fn parse_active(value: &str) -> Result<bool> {
    match value {
        "1" => Ok(true),
        "0" => Ok(false),
        other => bail!("active must be 0 or 1, got {other:?}"),
    }
}

fn parse_number<T>(value: &str, field: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("{field} is not a number: {value:?}"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::cli::actions::export::{client_line, key_line};

    const KEYS: &str = "\
1,1700000000,1700000100,cccccccccccb,7,3,34495,131,aef3a7835277a28da831,desk, left drawer
0,1700000000,-1,cccccccccccd,-1,-1,-1,-1,0000000000000000,
";

    #[test]
    fn keys_are_parsed_in_order() {
        let devices = parse_keys(KEYS).unwrap();
        assert_eq!(devices.len(), 2);

        let first = &devices[0];
        assert!(first.active);
        assert_eq!(first.public_name, "cccccccccccb");
        assert_eq!((first.session_counter, first.use_counter), (7, 3));
        assert_eq!((first.timestamp_low, first.timestamp_high), (0x86bf, 0x83));
        assert_eq!(first.notes, "desk, left drawer");

        let second = &devices[1];
        assert!(!second.active);
        assert_eq!(second.modified_at, -1);
        assert_eq!(second.notes, "");
    }

    #[test]
    fn exported_key_reads_back() {
        let mut device = DeviceRecord::discovered("cccccccccccb", 1_700_000_000);
        device.session_counter = 2;
        device.use_counter = 9;
        device.notes = "spare".to_string();

        assert_eq!(parse_key(&key_line(&device)).unwrap(), device);
    }

    #[test]
    fn clients_are_parsed() {
        let input = "1,1,1700000000,c2VjcmV0,ops@example.com,,cccccccccccb\r\n\r\n2,0,1700000001,b3RoZXI=,,,\n";
        let clients = parse_clients(input).unwrap();

        assert_eq!(clients.len(), 2);
        assert_eq!(clients[0].id, 1);
        assert_eq!(clients[0].otp, "cccccccccccb");
        assert!(!clients[1].active);
        assert_eq!(clients[1].secret, "b3RoZXI=");
        assert_eq!(client_line(&clients[1]), "2,0,1700000001,b3RoZXI=,,,");
    }

    #[test]
    fn blank_input_is_empty() {
        assert!(parse_keys("").unwrap().is_empty());
        assert!(parse_clients("\n  \n").unwrap().is_empty());
    }

    #[test]
    fn errors_name_the_line() {
        let err = parse_keys("1,0,0,cccccccccccb,1,1,1,1,n,\n1,0,0,cccccccccccd,x,1,1,1,n,\n")
            .unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("yubikey line 2"), "{message}");
        assert!(message.contains("session_counter"), "{message}");
    }

    #[test]
    fn malformed_rows_are_rejected() {
        assert!(parse_key("1,0,0,cccccccccccb,1,1").is_err());
        assert!(parse_key("1,0,0,,1,1,1,1,n,").is_err());
        assert!(parse_key("yes,0,0,cccccccccccb,1,1,1,1,n,").is_err());
        assert!(parse_client("1,1,0,secret,a,b").is_err());
        assert!(parse_client("1,1,0,secret,a,b,c,d").is_err());
        assert!(parse_client("one,1,0,secret,,,").is_err());
    }
}
