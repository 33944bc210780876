use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sign_server::{Endpoint, SigningBackend, SocketBackend, codec};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Operator tooling for the sign server: envelope codec and one-shot signing.
#[derive(Parser)]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Encrypt plaintext into an uppercase hex envelope.
    Encrypt {
        #[clap(long, env = "AES_KEY", hide_env_values = true)]
        key: String,
        plaintext: String,
    },
    /// Decrypt a hex envelope back to plaintext.
    Decrypt {
        #[clap(long, env = "AES_KEY", hide_env_values = true)]
        key: String,
        ciphertext: String,
    },
    /// Sign `data` through the local signing socket and print `signature||certificate`.
    Sign {
        #[clap(long, env = "WS_URL", default_value = "ws://127.0.0.1:61232")]
        endpoint: String,
        #[clap(long)]
        data: String,
        #[clap(long, env = "SIGN_PASSWORD", hide_env_values = true)]
        password: String,
        #[clap(long, default_value = "30")]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    match Args::parse().command {
        Command::Encrypt { key, plaintext } => {
            println!("{}", codec::encrypt(&key, &plaintext).context("encrypting")?);
        }
        Command::Decrypt { key, ciphertext } => {
            let plaintext = codec::decrypt(&key, Some(ciphertext.trim())).context("decrypting")?;
            println!("{}", plaintext.unwrap_or_default());
        }
        Command::Sign {
            endpoint,
            data,
            password,
            timeout_secs,
        } => {
            let endpoint = Endpoint::parse(&endpoint).context("parsing endpoint")?;
            let response_timeout = Duration::from_secs(timeout_secs.max(1));
            let backend = SocketBackend::new(endpoint).with_response_timeout(response_timeout);
            info!(endpoint = %backend.endpoint(), "signing");
            let result = backend.get_code(&data, &password).await;
            backend.close().await;
            println!("{}", result.context("signing")?);
        }
    }
    Ok(())
}
