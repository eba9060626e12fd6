use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{ensure, Context};
use clap::{Parser, ValueEnum};
use courier_remote::RemoteConfig;
use courier_transfer::{
    LinkSettings, PollPolicy, RetryPolicy, RunSettings, SizeBands, UploadLimits, UploadSettings,
    UploadTimeoutScale, MEBI_BYTE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn is_development(self) -> bool {
        matches!(self, Environment::Development)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Environment::Development => "development",
            Environment::Production => "production",
        })
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "courier-gateway",
    author,
    version,
    about = "Upload and relay gateway in front of a remote document service"
)]
pub struct Cli {
    /// Address to bind the HTTP listener to.
    #[arg(long, env = "COURIER_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    listen_addr: String,

    /// Base URL of the remote document service API.
    #[arg(
        long,
        env = "COURIER_REMOTE_BASE_URL",
        default_value = "https://api.openai.com/v1"
    )]
    remote_base_url: String,

    /// API key for the remote service. Without one the gateway runs against an
    /// in-memory document service.
    #[arg(long, env = "COURIER_REMOTE_API_KEY", hide_env_values = true)]
    remote_api_key: Option<String>,

    #[arg(long, env = "COURIER_MODEL", default_value = "gpt-4o-mini")]
    model: String,

    /// Controls whether error responses carry debug details.
    #[arg(
        long,
        env = "COURIER_ENVIRONMENT",
        value_enum,
        default_value_t = Environment::Development
    )]
    environment: Environment,

    /// Hard ceiling on accepted file size.
    #[arg(long, env = "COURIER_MAX_FILE_BYTES", default_value_t = 100 * MEBI_BYTE)]
    max_file_bytes: u64,

    /// Stricter ceiling for this deployment; rejected files get their own error code.
    #[arg(long, env = "COURIER_RECOMMENDED_FILE_BYTES")]
    recommended_file_bytes: Option<u64>,

    #[arg(long, env = "COURIER_PHASED_THRESHOLD_BYTES", default_value_t = 50 * MEBI_BYTE)]
    phased_threshold_bytes: u64,

    #[arg(long, env = "COURIER_PHASED_WINDOW_BYTES", default_value_t = 2 * MEBI_BYTE as usize)]
    phased_window_bytes: usize,

    #[arg(long, env = "COURIER_WINDOWED_THRESHOLD_BYTES", default_value_t = 10 * MEBI_BYTE)]
    windowed_threshold_bytes: u64,

    #[arg(long, env = "COURIER_WINDOWED_WINDOW_BYTES", default_value_t = 5 * MEBI_BYTE as usize)]
    windowed_window_bytes: usize,

    /// Yield to the runtime after this many windows.
    #[arg(long, env = "COURIER_YIELD_EVERY", default_value_t = 4)]
    yield_every: usize,

    #[arg(long, env = "COURIER_UPLOAD_ATTEMPTS", default_value_t = 3)]
    upload_attempts: u32,

    #[arg(long, env = "COURIER_UPLOAD_INITIAL_DELAY_MS", default_value_t = 2_000)]
    upload_initial_delay_ms: u64,

    #[arg(long, env = "COURIER_UPLOAD_TIMEOUT_BASE_SECS", default_value_t = 30)]
    upload_timeout_base_secs: u64,

    #[arg(long, env = "COURIER_UPLOAD_TIMEOUT_PER_MIB_SECS", default_value_t = 2)]
    upload_timeout_per_mib_secs: u64,

    #[arg(long, env = "COURIER_UPLOAD_TIMEOUT_MAX_SECS", default_value_t = 300)]
    upload_timeout_max_secs: u64,

    #[arg(long, env = "COURIER_FILE_POLL_INTERVAL_MS", default_value_t = 2_000)]
    file_poll_interval_ms: u64,

    #[arg(long, env = "COURIER_FILE_POLL_MAX", default_value_t = 30)]
    file_poll_max: u32,

    #[arg(long, env = "COURIER_ATTACH_ATTEMPTS", default_value_t = 5)]
    attach_attempts: u32,

    #[arg(long, env = "COURIER_ATTACH_INITIAL_DELAY_MS", default_value_t = 5_000)]
    attach_initial_delay_ms: u64,

    #[arg(long, env = "COURIER_ATTACH_TIMEOUT_SECS", default_value_t = 120)]
    attach_timeout_secs: u64,

    #[arg(long, env = "COURIER_RUN_POLL_INTERVAL_MS", default_value_t = 1_000)]
    run_poll_interval_ms: u64,

    #[arg(long, env = "COURIER_RUN_POLL_MAX", default_value_t = 120)]
    run_poll_max: u32,

    /// Seconds without an upstream event before a relayed stream is closed.
    #[arg(long, env = "COURIER_STREAM_IDLE_TIMEOUT_SECS", default_value_t = 60)]
    stream_idle_timeout_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "COURIER_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    /// `None` selects the in-memory document service.
    pub remote: Option<RemoteConfig>,
    pub environment: Environment,
    pub upload: UploadSettings,
    pub link: LinkSettings,
    pub runs: RunSettings,
    pub stream_idle_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            remote: None,
            environment: Environment::Development,
            upload: UploadSettings::default(),
            link: LinkSettings::default(),
            runs: RunSettings::default(),
            stream_idle_timeout: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl GatewayConfig {
    /// Largest request body accepted: the file limit plus base64 expansion and
    /// room for the multipart or JSON envelope.
    pub fn body_limit(&self) -> usize {
        let file = self.upload.limits.absolute;
        let encoded = file.saturating_add(file / 3).saturating_add(MEBI_BYTE);
        usize::try_from(encoded).unwrap_or(usize::MAX)
    }
}

impl TryFrom<Cli> for GatewayConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        ensure!(cli.max_file_bytes > 0, "COURIER_MAX_FILE_BYTES must be positive");
        ensure!(
            cli.phased_window_bytes > 0 && cli.windowed_window_bytes > 0,
            "transcoder window sizes must be positive"
        );
        ensure!(cli.upload_attempts > 0, "COURIER_UPLOAD_ATTEMPTS must be at least 1");
        ensure!(cli.attach_attempts > 0, "COURIER_ATTACH_ATTEMPTS must be at least 1");

        let remote = cli
            .remote_api_key
            .filter(|key| !key.trim().is_empty())
            .map(|api_key| RemoteConfig {
                model: cli.model.clone(),
                ..RemoteConfig::new(cli.remote_base_url.clone(), api_key)
            });

        let defaults = GatewayConfig::default();
        let timeout_scale = UploadTimeoutScale {
            base: Duration::from_secs(cli.upload_timeout_base_secs),
            per_mib: Duration::from_secs(cli.upload_timeout_per_mib_secs),
            min: Duration::from_secs(cli.upload_timeout_base_secs),
            max: Duration::from_secs(cli.upload_timeout_max_secs),
        };
        let upload = UploadSettings {
            limits: UploadLimits {
                absolute: cli.max_file_bytes,
                recommended: cli.recommended_file_bytes,
            },
            bands: SizeBands {
                phased_threshold: cli.phased_threshold_bytes,
                phased_chunk_size: cli.phased_window_bytes,
                windowed_threshold: cli.windowed_threshold_bytes,
                windowed_chunk_size: cli.windowed_window_bytes,
                yield_every: cli.yield_every.max(1),
            },
            retry: RetryPolicy::new(
                cli.upload_attempts,
                Duration::from_millis(cli.upload_initial_delay_ms),
                timeout_scale.max,
            ),
            timeout_scale,
        };
        let link = LinkSettings {
            file_poll: PollPolicy::new(
                Duration::from_millis(cli.file_poll_interval_ms),
                cli.file_poll_max,
            ),
            attach_retry: RetryPolicy::new(
                cli.attach_attempts,
                Duration::from_millis(cli.attach_initial_delay_ms),
                Duration::from_secs(cli.attach_timeout_secs),
            ),
            ..defaults.link
        };
        let runs = RunSettings {
            index_file_poll: link.file_poll,
            run_poll: PollPolicy::new(
                Duration::from_millis(cli.run_poll_interval_ms),
                cli.run_poll_max,
            ),
            ..defaults.runs
        };

        Ok(GatewayConfig {
            listen_addr,
            remote,
            environment: cli.environment,
            upload,
            link,
            runs,
            stream_idle_timeout: Duration::from_secs(cli.stream_idle_timeout_secs),
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}
