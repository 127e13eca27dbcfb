use crate::media::AudioMixer;
use crate::services::{
    file_transfer::FileTransferCoordinator, presenter::PresenterArbiter, session::SessionRegistry,
};
use anyhow::{Context, ensure};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind_host: String,
    pub control_port: u16,
    pub media_port: u16,
    pub max_participants: usize,
    pub max_file_size: u64,
    pub file_chunk_size: usize,
    pub max_frame_length: usize,
    pub max_datagram_size: usize,
    pub storage_dir: PathBuf,
    pub outbound_queue: usize,
    pub download_queue: usize,
    pub handshake_timeout_secs: u64,
    pub liveness_timeout_secs: u64,
    /// Opt-in age after which a stored audio frame mixes as silence.
    /// 0 (the default) keeps frames until overwritten.
    pub audio_stale_after_ms: u64,
    /// Whether chat senders receive their own messages back
    pub chat_echo: bool,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            control_port: 65435,
            media_port: 65436,
            max_participants: 16,
            max_file_size: 500 * 1024 * 1024,
            file_chunk_size: huddle_protocol::FILE_CHUNK_SIZE,
            max_frame_length: 1024 * 1024,
            max_datagram_size: 65507,
            storage_dir: PathBuf::from("huddle-files"),
            outbound_queue: 256,
            download_queue: 8,
            handshake_timeout_secs: 10,
            liveness_timeout_secs: 30,
            audio_stale_after_ms: 0,
            chat_echo: false,
            log_format: LogFormat::Pretty,
        }
    }
}

impl Config {
    /// Load from `huddle.toml` (optional) and `HUDDLE_*` environment variables
    pub fn load() -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("huddle").required(false))
            .add_source(config::Environment::with_prefix("HUDDLE").try_parsing(true))
            .build()
            .context("Failed to read configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.max_participants > 0, "max_participants must be positive");
        ensure!(self.file_chunk_size > 0, "file_chunk_size must be positive");
        ensure!(
            self.max_frame_length >= self.file_chunk_size + 1024,
            "max_frame_length must leave room for a {} byte chunk",
            self.file_chunk_size
        );
        ensure!(self.outbound_queue > 0, "outbound_queue must be positive");
        ensure!(self.download_queue > 0, "download_queue must be positive");
        ensure!(
            self.max_datagram_size > 0 && self.max_datagram_size <= 65507,
            "max_datagram_size must be between 1 and 65507"
        );
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }

    pub fn audio_stale_after(&self) -> Option<Duration> {
        (self.audio_stale_after_ms > 0).then(|| Duration::from_millis(self.audio_stale_after_ms))
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sessions: Arc<SessionRegistry>,
    pub presenter: Arc<PresenterArbiter>,
    pub files: Arc<FileTransferCoordinator>,
    pub mixer: Arc<AudioMixer>,
    /// Cancelled when the server shuts down; connection tokens are children of it
    pub shutdown: CancellationToken,
}

impl AppState {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        config.validate()?;

        let files = FileTransferCoordinator::new(
            config.storage_dir.clone(),
            config.max_file_size,
            config.file_chunk_size,
        );
        files
            .prepare()
            .await
            .with_context(|| format!("Failed to prepare storage dir {:?}", config.storage_dir))?;

        let sessions = SessionRegistry::new(config.max_participants);
        let mixer = AudioMixer::new(config.audio_stale_after());

        Ok(Self {
            config: Arc::new(config),
            sessions: Arc::new(sessions),
            presenter: Arc::new(PresenterArbiter::new()),
            files: Arc::new(files),
            mixer: Arc::new(mixer),
            shutdown: CancellationToken::new(),
        })
    }
}
