use clap::{Arg, ArgAction, Command};

pub const CMD_CHECKSUM: &str = "checksum";
pub const CMD_CLIENTS: &str = "clients";
pub const CMD_DEACTIVATED: &str = "deactivated";
pub const CMD_EXPORT: &str = "export";
pub const CMD_GEN: &str = "gen";
pub const CMD_IMPORT: &str = "import";
pub const CMD_KEYS: &str = "keys";

pub const ARG_PRINT: &str = "print";
pub const ARG_COUNT: &str = "count";
pub const ARG_EMAIL: &str = "email";
pub const ARG_NOTES: &str = "notes";
pub const ARG_OTP: &str = "otp";

fn print_arg() -> Arg {
    Arg::new(ARG_PRINT)
        .long(ARG_PRINT)
        .help("Print the rows the checksum is computed over")
        .action(ArgAction::SetTrue)
}

#[must_use]
pub fn checksum() -> Command {
    Command::new(CMD_CHECKSUM)
        .about("Checksum client or deactivated YubiKey data, to compare servers of a sync pool")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new(CMD_CLIENTS)
                .about("Checksum the id, active flag and secret of every client")
                .arg(print_arg()),
        )
        .subcommand(
            Command::new(CMD_DEACTIVATED)
                .about("Checksum the counters of every deactivated YubiKey")
                .arg(print_arg()),
        )
}

#[must_use]
pub fn gen() -> Command {
    Command::new(CMD_GEN)
        .about("Generate API clients")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new(CMD_CLIENTS)
                .about("Insert new clients and print them as `id,secret` lines")
                .arg(
                    Arg::new(ARG_COUNT)
                        .help("Number of clients to create")
                        .default_value("1")
                        .value_parser(clap::value_parser!(u32).range(1..=1000)),
                )
                .arg(
                    Arg::new(ARG_EMAIL)
                        .long(ARG_EMAIL)
                        .help("Contact email stored with the clients"),
                )
                .arg(
                    Arg::new(ARG_NOTES)
                        .long(ARG_NOTES)
                        .help("Notes stored with the clients"),
                )
                .arg(
                    Arg::new(ARG_OTP)
                        .long(ARG_OTP)
                        .help("OTP of the YubiKey that requested the clients"),
                ),
        )
}

#[must_use]
pub fn export() -> Command {
    Command::new(CMD_EXPORT)
        .about("Print YubiKey or client data as comma separated lines, for `import` on another server")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(Command::new(CMD_KEYS).about("Export every YubiKey ordered by public name"))
        .subcommand(Command::new(CMD_CLIENTS).about("Export every client ordered by id"))
}

#[must_use]
pub fn import() -> Command {
    Command::new(CMD_IMPORT)
        .about("Read lines written by `export` from stdin and load them in one transaction")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new(CMD_KEYS)
                .about("Add unknown YubiKeys and advance known ones whose counters are newer"),
        )
        .subcommand(Command::new(CMD_CLIENTS).about("Add clients whose id is not taken yet"))
}
