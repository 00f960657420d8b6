// Logging setup, powered by tracing-subscriber.
//
// The bus itself only emits `tracing` events; installing a subscriber is the
// owning service's call. `init_tracing` is the default setup used by the
// services: one line per event, compact or JSON, filtered by `RUST_LOG`
// when set and by the configured level otherwise.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::{ConfigEnv, ProcessEnv};

pub const LOG_LEVEL_ENV: &str = "LOG_LEVEL";
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

/// Log format type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Compact text format: timestamp LEVEL target - message
    Compact,
    /// JSON Lines format for log shippers
    Json,
}

impl LogFormat {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" | "jsonl" => LogFormat::Json,
            _ => LogFormat::Compact,
        }
    }
}

/// Logging settings for a service.
#[derive(Debug, Clone)]
pub struct LogSettings {
    pub service_name: String,
    pub level: String,
    pub format: LogFormat,
}

impl LogSettings {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }

    /// Read `LOG_LEVEL` (default `info`) and `LOG_FORMAT` (default compact).
    pub fn from_env(service_name: impl Into<String>) -> Self {
        Self::from_env_with(service_name, &ProcessEnv)
    }

    pub fn from_env_with(service_name: impl Into<String>, env: &impl ConfigEnv) -> Self {
        let mut settings = Self::new(service_name);
        if let Some(level) = env.string(LOG_LEVEL_ENV).filter(|l| !l.trim().is_empty()) {
            settings.level = level.trim().to_lowercase();
        }
        if let Some(format) = env.string(LOG_FORMAT_ENV) {
            settings.format = LogFormat::parse(&format);
        }
        settings
    }
}

/// Build the filter: `RUST_LOG` wins, then the configured level. The AMQP
/// client's own chatter is capped at `warn`.
fn build_env_filter(level: &str) -> Result<EnvFilter, tracing_subscriber::filter::ParseError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(format!("{},lapin=warn,amq_protocol=warn", level))
}

/// Install the global subscriber.
///
/// Returns an error if a global subscriber is already set or the level does
/// not parse; callers usually log that and carry on.
pub fn init_tracing(settings: &LogSettings) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = build_env_filter(&settings.level)?;
    let registry = tracing_subscriber::registry().with(filter);

    match settings.format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true),
            )
            .try_init()?,
        LogFormat::Compact => registry
            .with(tracing_subscriber::fmt::layer().compact().with_target(true))
            .try_init()?,
    }

    tracing::info!(service = %settings.service_name, level = %settings.level, "logging initialised");
    Ok(())
}
