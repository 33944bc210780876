use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use sign_server::{
    AppState, DocumentStore, Endpoint, EnvelopeCipher, NativeBackend, SigningBackend,
    SocketBackend, run,
};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendKind {
    Socket,
    Native,
}

#[derive(Parser)]
#[command(version, about = "Encrypted HTTP front end for the operator signing device")]
struct Args {
    #[clap(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,
    #[clap(long, env = "PORT", default_value = "8801")]
    port: u16,
    #[clap(long, env = "AES_KEY", hide_env_values = true)]
    aes_key: String,
    #[clap(long, env = "SAVE_FOLDER", default_value = "./xml_files/")]
    save_folder: PathBuf,
    #[clap(long, env = "SIGN_BACKEND", value_enum, default_value = "socket")]
    backend: BackendKind,
    #[clap(long, env = "WS_URL", default_value = "ws://127.0.0.1:61232")]
    ws_url: String,
    #[clap(long, env = "SIGN_TIMEOUT_SECS", default_value = "30")]
    response_timeout_secs: u64,
    #[clap(long, env = "SIGN64_LIBRARY", default_value = "dll/Sign64.dll")]
    native_library: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let cipher = EnvelopeCipher::new(&args.aes_key).context("invalid AES_KEY")?;
    let backend = build_backend(&args)?;
    let documents = DocumentStore::new(&args.save_folder);

    info!(
        backend = backend.name(),
        available = backend.is_available(),
        save_folder = %args.save_folder.display(),
        "starting sign server"
    );

    let state = AppState {
        backend,
        cipher,
        documents,
    };
    run(args.host, args.port, state).await
}

fn build_backend(args: &Args) -> Result<Arc<dyn SigningBackend>> {
    let backend: Arc<dyn SigningBackend> = match args.backend {
        BackendKind::Socket => {
            if args.response_timeout_secs == 0 {
                bail!("SIGN_TIMEOUT_SECS must be greater than zero");
            }
            let endpoint = Endpoint::parse(&args.ws_url)
                .with_context(|| format!("invalid WS_URL {:?}", args.ws_url))?;
            let response_timeout = Duration::from_secs(args.response_timeout_secs);
            Arc::new(SocketBackend::new(endpoint).with_response_timeout(response_timeout))
        }
        BackendKind::Native => Arc::new(NativeBackend::load(&args.native_library)),
    };
    Ok(backend)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
