//! Tracing subscriber setup for binaries embedding the pipeline.
//!
//! # Environment Variables
//! - `DOCPIPE_LOG`: filter directives (default: `info`)
//! - `DOCPIPE_LOG_FORMAT`: `json` for JSON lines, anything else for text

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output format of the installed subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    pub fn from_name(name: &str) -> Self {
        if name.trim().eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Text
        }
    }

    pub fn from_env() -> Self {
        std::env::var("DOCPIPE_LOG_FORMAT")
            .map(|v| Self::from_name(&v))
            .unwrap_or_default()
    }
}

/// Install the global subscriber.
///
/// Returns `false` when a subscriber was already installed, in which case
/// nothing changes.
pub fn init_tracing() -> bool {
    let env_filter =
        EnvFilter::try_from_env("DOCPIPE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    init_with(env_filter, LogFormat::from_env())
}

pub fn init_with(env_filter: EnvFilter, format: LogFormat) -> bool {
    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).try_init(),
    };
    match installed {
        Ok(()) => {
            tracing::debug!(format = ?format, "Tracing initialized");
            true
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_from_name() {
        assert_eq!(LogFormat::from_name("json"), LogFormat::Json);
        assert_eq!(LogFormat::from_name(" JSON "), LogFormat::Json);
        assert_eq!(LogFormat::from_name("pretty"), LogFormat::Text);
        assert_eq!(LogFormat::from_name(""), LogFormat::Text);
    }

    #[test]
    fn test_second_init_is_harmless() {
        init_with(EnvFilter::new("warn"), LogFormat::Text);
        assert!(!init_with(EnvFilter::new("debug"), LogFormat::Json));
    }
}
