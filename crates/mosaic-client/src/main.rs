use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use mosaic_core::config::{ColorModeOption, Config};
use mosaic_core::errors::CoreError;
use mosaic_crypto::identity::Identity;
use mosaic_crypto::keyfile;

#[derive(Parser)]
#[command(name = "mosaic")]
#[command(about = "Mosaic - encrypted terminal video chat client")]
struct Args {
    /// Server address, e.g. chat.example.org:7878
    #[arg(value_name = "ADDRESS")]
    connect: Option<String>,

    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Identity key file (overrides config)
    #[arg(short, long)]
    identity: Option<PathBuf>,

    /// Generate the identity file if it does not exist
    #[arg(long)]
    generate_identity: bool,

    /// Display name (overrides config)
    #[arg(short, long)]
    name: Option<String>,

    /// Color mode: mono, fg256, bg256, fg24, bg24
    #[arg(long)]
    color: Option<String>,

    /// Disable audio capture and playback
    #[arg(long)]
    no_audio: bool,

    /// Disable video capture
    #[arg(long)]
    no_video: bool,

    /// Render one frame and exit
    #[arg(long)]
    snapshot: bool,

    /// Stretch frames to the full terminal instead of letterboxing
    #[arg(long)]
    stretch: bool,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Rendering owns stdout; logs go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(format!(
            "mosaic_client={0},mosaic_core={0},mosaic_crypto={0},mosaic_proto={0},mosaic_render={0}",
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
    if let Some(addr) = args.connect {
        config.connect_addr = Some(addr);
    }
    if let Some(identity) = args.identity {
        config.identity_file = identity;
    }
    if let Some(name) = args.name {
        config.display_name = name;
    }
    if let Some(color) = args.color {
        config.color_mode = parse_color(&color)?;
    }
    if args.no_audio {
        config.enable_audio = false;
    }
    if args.no_video {
        config.enable_video = false;
    }
    if args.snapshot {
        config.snapshot_mode = true;
    }
    if args.stretch {
        config.stretch = true;
    }
    config.validate_client()?;

    let identity = load_identity(&config, args.generate_identity)?;
    info!(host = %identity.host_id(), "identity loaded");

    mosaic_client::run(config, identity)
}

fn parse_color(name: &str) -> Result<ColorModeOption, CoreError> {
    Ok(match name {
        "mono" => ColorModeOption::Mono,
        "fg256" => ColorModeOption::Fg256,
        "bg256" => ColorModeOption::Bg256,
        "fg24" => ColorModeOption::Fg24,
        "bg24" => ColorModeOption::Bg24,
        other => {
            return Err(mosaic_core::config::ConfigError::Invalid(format!(
                "unknown color mode {other:?}"
            ))
            .into())
        }
    })
}

fn load_identity(config: &Config, generate: bool) -> Result<Identity, CoreError> {
    let path = &config.identity_file;
    // The identity file password is independent of the server password;
    // reuse the configured source only for the latter.
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
