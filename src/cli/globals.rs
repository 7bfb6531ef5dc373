use secrecy::SecretString;

/// Arguments shared by every subcommand.
#[derive(Debug, Clone)]
pub struct GlobalArgs {
    pub dsn: SecretString,
}

impl GlobalArgs {
    #[must_use]
    pub fn new(dsn: SecretString) -> Self {
        Self { dsn }
    }
}
