use anyhow::{Context, Result};
use chrono::TimeDelta;
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    /// How long an incomplete upload may live before it is considered expired.
    pub session_ttl: TimeDelta,
    /// Seconds between expiry sweeps. Zero disables the sweeper.
    pub sweep_interval_secs: u64,
    pub max_chunk_bytes: usize,
    pub ffmpeg_bin: String,
    pub ffprobe_bin: String,
    /// Seconds each ffprobe/ffmpeg run may take before it is killed.
    pub thumbnail_timeout_secs: u64,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Chunked media upload service")]
pub struct Args {
    /// Host to bind to (overrides MEDIA_UPLOAD_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides MEDIA_UPLOAD_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where upload blobs are stored (overrides MEDIA_UPLOAD_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides MEDIA_UPLOAD_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Incomplete upload lifetime in hours (overrides MEDIA_UPLOAD_SESSION_TTL_HOURS)
    #[arg(long)]
    pub session_ttl_hours: Option<u64>,

    /// Seconds between expiry sweeps, 0 to disable (overrides MEDIA_UPLOAD_SWEEP_INTERVAL_SECS)
    #[arg(long)]
    pub sweep_interval_secs: Option<u64>,

    /// Largest accepted chunk in bytes (overrides MEDIA_UPLOAD_MAX_CHUNK_BYTES)
    #[arg(long)]
    pub max_chunk_bytes: Option<usize>,

    /// ffmpeg binary used for thumbnails (overrides MEDIA_UPLOAD_FFMPEG_BIN)
    #[arg(long)]
    pub ffmpeg_bin: Option<String>,

    /// ffprobe binary used for thumbnails (overrides MEDIA_UPLOAD_FFPROBE_BIN)
    #[arg(long)]
    pub ffprobe_bin: Option<String>,

    /// Seconds allowed per ffprobe/ffmpeg run (overrides MEDIA_UPLOAD_THUMBNAIL_TIMEOUT_SECS)
    #[arg(long)]
    pub thumbnail_timeout_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::merge(args)?, migrate))
    }

    /// CLI values win over environment values, which win over defaults.
    fn merge(args: Args) -> Result<Self> {
        Ok(Self {
            host: args
                .host
                .unwrap_or_else(|| env_or("MEDIA_UPLOAD_HOST", "0.0.0.0")),
            port: match args.port {
                Some(port) => port,
                None => env_parse("MEDIA_UPLOAD_PORT", 3000)?,
            },
            storage_dir: args
                .storage_dir
                .unwrap_or_else(|| env_or("MEDIA_UPLOAD_STORAGE_DIR", "./data/uploads")),
            database_url: args.database_url.unwrap_or_else(|| {
                env_or("MEDIA_UPLOAD_DATABASE_URL", "sqlite://./data/meta/uploads.db")
            }),
            session_ttl: session_ttl_from_hours(match args.session_ttl_hours {
                Some(hours) => hours,
                None => env_parse("MEDIA_UPLOAD_SESSION_TTL_HOURS", 12)?,
            })?,
            sweep_interval_secs: match args.sweep_interval_secs {
                Some(secs) => secs,
                None => env_parse("MEDIA_UPLOAD_SWEEP_INTERVAL_SECS", 900)?,
            },
            max_chunk_bytes: match args.max_chunk_bytes {
                Some(bytes) => bytes,
                None => env_parse("MEDIA_UPLOAD_MAX_CHUNK_BYTES", 64 * 1024 * 1024)?,
            },
            ffmpeg_bin: args
                .ffmpeg_bin
                .unwrap_or_else(|| env_or("MEDIA_UPLOAD_FFMPEG_BIN", "ffmpeg")),
            ffprobe_bin: args
                .ffprobe_bin
                .unwrap_or_else(|| env_or("MEDIA_UPLOAD_FFPROBE_BIN", "ffprobe")),
            thumbnail_timeout_secs: match args.thumbnail_timeout_secs {
                Some(secs) => secs,
                None => env_parse("MEDIA_UPLOAD_THUMBNAIL_TIMEOUT_SECS", 60)?,
            },
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn session_ttl(&self) -> TimeDelta {
        self.session_ttl
    }

    pub fn thumbnail_timeout(&self) -> Duration {
        Duration::from_secs(self.thumbnail_timeout_secs.max(1))
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}

fn session_ttl_from_hours(hours: u64) -> Result<TimeDelta> {
    i64::try_from(hours)
        .ok()
        .and_then(TimeDelta::try_hours)
        .with_context(|| format!("session TTL of {} hours is out of range", hours))
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.into())
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}
