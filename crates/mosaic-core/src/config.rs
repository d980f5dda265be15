//! Configuration.
//!
//! One record covers both roles; the binaries validate the fields their
//! role requires. Loadable from a TOML file, with every field defaulted
//! so a config file only states what it changes.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use mosaic_proto::wire::DEFAULT_MAX_PAYLOAD;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("password source {0:?} could not be resolved")]
    PasswordSource(String),
}

impl ConfigError {
    pub fn stable_code(&self) -> &'static str {
        match self {
            ConfigError::Io(_) => "E_CONFIG_IO",
            ConfigError::Parse(_) => "E_CONFIG_PARSE",
            ConfigError::Invalid(_) => "E_CONFIG_INVALID",
            ConfigError::PasswordSource(_) => "E_CONFIG_PASSWORD_SOURCE",
        }
    }
}

/// Color mode names accepted in config files and on the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorModeOption {
    Mono,
    Fg256,
    Bg256,
    Fg24,
    Bg24,
}

impl Default for ColorModeOption {
    fn default() -> Self {
        ColorModeOption::Fg24
    }
}

impl ColorModeOption {
    pub fn to_wire(self) -> mosaic_proto::messages::ColorMode {
        use mosaic_proto::messages::ColorMode;
        match self {
            ColorModeOption::Mono => ColorMode::Mono,
            ColorModeOption::Fg256 => ColorMode::Fg256,
            ColorModeOption::Bg256 => ColorMode::Bg256,
            ColorModeOption::Fg24 => ColorMode::Fg24,
            ColorModeOption::Bg24 => ColorMode::Bg24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Server: address to listen on.
    pub listen_addr: Option<String>,
    /// Client: address to connect to.
    pub connect_addr: Option<String>,

    pub identity_file: PathBuf,
    pub known_hosts_file: PathBuf,
    /// Pin unknown hosts on first contact instead of refusing them.
    pub tofu_auto_add: bool,

    pub require_password: bool,
    /// `env:VAR`, `file:/path`, or `pass:literal`.
    pub password_source: Option<String>,

    pub display_name: String,
    pub enable_audio: bool,
    pub enable_video: bool,
    pub color_mode: ColorModeOption,
    pub stretch: bool,

    pub render_fps: u32,
    pub capture_fps: u32,

    pub max_clients: usize,
    pub max_frame_bytes: u32,

    /// Forced on/off; unset means "on when three or more clients".
    pub compose_on_server: Option<bool>,
    /// Render a single frame and exit.
    pub snapshot_mode: bool,
    /// Pin the luminance loop to the scalar reference.
    pub force_scalar: bool,

    pub handshake_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub queue_timeout_ms: u64,
    /// Frames/batches older than this are discarded instead of queued.
    pub frame_deadline_ms: u64,
    pub send_queue_depth: usize,
    pub video_lane_depth: usize,
    pub audio_lane_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_addr: None,
            connect_addr: None,
            identity_file: PathBuf::from("mosaic_id.key"),
            known_hosts_file: PathBuf::from("known_hosts"),
            tofu_auto_add: true,
            require_password: false,
            password_source: None,
            display_name: String::from("anonymous"),
            enable_audio: true,
            enable_video: true,
            color_mode: ColorModeOption::default(),
            stretch: false,
            render_fps: 30,
            capture_fps: 30,
            max_clients: 16,
            max_frame_bytes: DEFAULT_MAX_PAYLOAD,
            compose_on_server: None,
            snapshot_mode: false,
            force_scalar: false,
            handshake_timeout_secs: 10,
            heartbeat_interval_secs: 15,
            queue_timeout_ms: 50,
            frame_deadline_ms: 250,
            send_queue_depth: 32,
            video_lane_depth: 8,
            audio_lane_depth: 16,
        }
    }
}

impl Config {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&text)?;
        Ok(config)
    }

    /// Checks that apply to either role.
    pub fn validate_common(&self) -> Result<(), ConfigError> {
        if self.render_fps == 0 || self.render_fps > 240 {
            return Err(ConfigError::Invalid(format!("render_fps {} out of range", self.render_fps)));
        }
        if self.capture_fps == 0 || self.capture_fps > 240 {
            return Err(ConfigError::Invalid(format!(
                "capture_fps {} out of range",
                self.capture_fps
            )));
        }
        if self.max_frame_bytes == 0 {
            return Err(ConfigError::Invalid("max_frame_bytes must be positive".into()));
        }
        if self.display_name.len() > mosaic_proto::messages::MAX_DISPLAY_NAME {
            return Err(ConfigError::Invalid("display_name exceeds 32 bytes".into()));
        }
        if self.send_queue_depth == 0 || self.video_lane_depth == 0 || self.audio_lane_depth == 0 {
            return Err(ConfigError::Invalid("queue depths must be positive".into()));
        }
        Ok(())
    }

    pub fn validate_server(&self) -> Result<(), ConfigError> {
        self.validate_common()?;
        if self.listen_addr.is_none() {
            return Err(ConfigError::Invalid("server requires listen_addr".into()));
        }
        if self.max_clients == 0 {
            return Err(ConfigError::Invalid("max_clients must be positive".into()));
        }
        if self.require_password && self.password_source.is_none() {
            return Err(ConfigError::Invalid(
                "require_password set but no password_source".into(),
            ));
        }
        Ok(())
    }

    pub fn validate_client(&self) -> Result<(), ConfigError> {
        self.validate_common()?;
        if self.connect_addr.is_none() {
            return Err(ConfigError::Invalid("client requires connect_addr".into()));
        }
        Ok(())
    }

    /// Resolve `password_source` to the actual password.
    pub fn resolve_password(&self) -> Result<Option<String>, ConfigError> {
        let source = match &self.password_source {
            None => return Ok(None),
            Some(s) => s,
        };
        if let Some(var) = source.strip_prefix("env:") {
            return env::var(var)
                .map(Some)
                .map_err(|_| ConfigError::PasswordSource(source.clone()));
        }
        if let Some(path) = source.strip_prefix("file:") {
            let text = fs::read_to_string(path)
                .map_err(|_| ConfigError::PasswordSource(source.clone()))?;
            return Ok(Some(text.trim_end_matches(['\r', '\n']).to_owned()));
        }
        if let Some(literal) = source.strip_prefix("pass:") {
            return Ok(Some(literal.to_owned()));
        }
        Err(ConfigError::PasswordSource(source.clone()))
    }

    /// Whether the server composes the grid, given the current client
    /// count.
    pub fn compose_for(&self, client_count: usize) -> bool {
        self.compose_on_server.unwrap_or(client_count >= 3)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Connections silent for longer than this are reaped.
    pub fn idle_timeout(&self) -> Duration {
        2 * self.heartbeat_interval()
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    pub fn frame_deadline(&self) -> Duration {
        Duration::from_millis(self.frame_deadline_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_validate_for_their_roles() {
        let mut config = Config::default();
        assert!(config.validate_server().is_err());
        assert!(config.validate_client().is_err());

        config.listen_addr = Some("127.0.0.1:7878".into());
        config.validate_server().unwrap();

        config.connect_addr = Some("127.0.0.1:7878".into());
        config.validate_client().unwrap();
    }

    #[test]
    fn toml_round_trip_with_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mosaic.toml");
        let mut f = fs::File::create(&path).unwrap();
        writeln!(
            f,
            "connect_addr = \"10.0.0.2:7878\"\ncolor_mode = \"fg256\"\nrender_fps = 15"
        )
        .unwrap();
        drop(f);

        let config = Config::load_from_file(&path).unwrap();
        assert_eq!(config.connect_addr.as_deref(), Some("10.0.0.2:7878"));
        assert_eq!(config.color_mode, ColorModeOption::Fg256);
        assert_eq!(config.render_fps, 15);
        // Unstated fields keep their defaults.
        assert_eq!(config.max_clients, 16);
    }

    #[test]
    fn unknown_keys_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mosaic.toml");
        fs::write(&path, "not_a_real_option = true\n").unwrap();
        assert!(matches!(Config::load_from_file(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn bad_values_rejected() {
        let mut config = Config { listen_addr: Some("0.0.0.0:1".into()), ..Config::default() };
        config.render_fps = 0;
        assert!(config.validate_server().is_err());

        let mut config = Config { listen_addr: Some("0.0.0.0:1".into()), ..Config::default() };
        config.require_password = true;
        assert!(config.validate_server().is_err());
        config.password_source = Some("pass:secret".into());
        config.validate_server().unwrap();
    }

    #[test]
    fn password_sources_resolve() {
        let mut config = Config::default();
        assert_eq!(config.resolve_password().unwrap(), None);

        config.password_source = Some("pass:hunter2".into());
        assert_eq!(config.resolve_password().unwrap().as_deref(), Some("hunter2"));

        let dir = tempfile::tempdir().unwrap();
        let pw_file = dir.path().join("pw");
        fs::write(&pw_file, "from-file\n").unwrap();
        config.password_source = Some(format!("file:{}", pw_file.display()));
        assert_eq!(config.resolve_password().unwrap().as_deref(), Some("from-file"));

        config.password_source = Some("carrier-pigeon:coo".into());
        assert!(config.resolve_password().is_err());
    }

    #[test]
    fn compose_default_kicks_in_at_three() {
        let config = Config::default();
        assert!(!config.compose_for(2));
        assert!(config.compose_for(3));
        let forced = Config { compose_on_server: Some(false), ..Config::default() };
        assert!(!forced.compose_for(10));
    }

    #[test]
    fn idle_timeout_is_twice_heartbeat() {
        let config = Config::default();
        assert_eq!(config.idle_timeout(), Duration::from_secs(30));
    }
}
