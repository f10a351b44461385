//! Key and token utility for borg.
//!
//! `borg-keygen new-key` prints a fresh `auth_key`; `borg-keygen mint <user> --key <k>`
//! prints the value a caller puts after `Authorization: Bearer`.
use anyhow::anyhow;
use borg::auth::TokenCipher;
use borg::settings::DEFAULT_AUTH_PREFIX;
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(version, about = "Generate keys and caller tokens for borg", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print a new base64-url encoded 32-byte key for `auth_key`.
    NewKey,
    /// Seal `username` into a caller token.
    Mint {
        username: String,
        /// The proxy's `auth_key`.
        #[arg(long, env = "AUTH_KEY", hide_env_values = true)]
        key: String,
        /// Must match the proxy's `auth_prefix`.
        #[arg(long, default_value = DEFAULT_AUTH_PREFIX)]
        prefix: String,
    },
}

fn main() -> anyhow::Result<()> {
    match Cli::parse().command {
        Command::NewKey => println!("{}", TokenCipher::generate_key()),
        Command::Mint {
            username,
            key,
            prefix,
        } => {
            let cipher = TokenCipher::from_base64(&key)?;
            let token = cipher
                .seal(&username)
                .map_err(|e| anyhow!("failed to seal token: {e}"))?;
            println!("{prefix}{token}");
        }
    }
    Ok(())
}
