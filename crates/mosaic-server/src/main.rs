use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use mosaic_core::config::Config;
use mosaic_core::errors::CoreError;
use mosaic_crypto::identity::Identity;
use mosaic_crypto::keyfile;
use mosaic_server::Server;

#[derive(Parser)]
#[command(name = "mosaic-server")]
#[command(about = "Mosaic server - relays encrypted terminal video chat")]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, e.g. 0.0.0.0:7878 (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Identity key file (overrides config)
    #[arg(short, long)]
    identity: Option<PathBuf>,

    /// Generate the identity file if it does not exist
    #[arg(long)]
    generate_identity: bool,

    /// Maximum concurrent clients (overrides config)
    #[arg(long)]
    max_clients: Option<usize>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(format!(
            "mosaic_server={0},mosaic_core={0},mosaic_crypto={0},mosaic_proto={0}",
            args.log_level
        ))
        .init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(code = e.stable_code(), "{e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn run(args: Args) -> Result<(), CoreError> {
    let mut config = match &args.config {
        Some(path) => Config::load_from_file(path)?,
        None => Config::default(),
    };
    if let Some(listen) = args.listen {
        config.listen_addr = Some(listen);
    }
    if config.listen_addr.is_none() {
        config.listen_addr = Some("0.0.0.0:7878".into());
    }
    if let Some(identity) = args.identity {
        config.identity_file = identity;
    }
    if let Some(max) = args.max_clients {
        config.max_clients = max;
    }
    config.validate_server()?;

    let identity = load_identity(&config, args.generate_identity)?;
    info!(host = %identity.host_id(), "identity loaded");

    let server = Server::bind(config, identity)?;
    server.run()
}

fn load_identity(config: &Config, generate: bool) -> Result<Identity, CoreError> {
    let path = &config.identity_file;
    // The identity-file password is independent of the chat password;
    // it comes from the environment so it never lands in config files.
    match keyfile::load_identity(path, None) {
        Ok(identity) => Ok(identity),
        Err(keyfile::KeyFileError::Io(e))
            if e.kind() == std::io::ErrorKind::NotFound && generate =>
        {
            info!(path = %path.display(), "generating new identity");
            let identity = Identity::generate();
            keyfile::save_identity(path, &identity, None)?;
            Ok(identity)
        }
        Err(keyfile::KeyFileError::PasswordRequired) => {
            let password = std::env::var("MOSAIC_KEY_PASSWORD").map_err(|_| {
                mosaic_core::config::ConfigError::Invalid(
                    "identity file is encrypted; set MOSAIC_KEY_PASSWORD".into(),
                )
            })?;
            Ok(keyfile::load_identity(path, Some(&password))?)
        }
        Err(e) => Err(e.into()),
    }
}
