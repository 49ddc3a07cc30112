//! Logging setup and timing helpers.

use crate::config::LogFormat;
use std::time::{Duration, Instant};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{fmt, EnvFilter};

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` takes precedence; otherwise `default_level` applies to this
/// crate and `warn` to everything else.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(default_level: &str, format: LogFormat) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(default_level)));

    let (text, json) = match format {
        LogFormat::Text => (Some(fmt::layer().with_target(true)), None),
        LogFormat::Json => (None, Some(fmt::layer().json().with_current_span(true))),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(text)
        .with(json)
        .try_init()
}

fn default_filter(level: &str) -> String {
    format!("warn,researchflow={level},researchflow_demo={level}")
}

/// Simple span timing helper.
#[derive(Debug)]
pub struct SpanTimer {
    start: Instant,
    name: String,
}

impl SpanTimer {
    /// Starts a new span timer.
    #[must_use]
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            name: name.into(),
        }
    }

    /// Returns the elapsed time.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Returns the elapsed time in whole milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Returns the span name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Finishes the span and returns the duration in milliseconds.
    #[must_use]
    pub fn finish(self) -> u64 {
        self.elapsed_ms()
    }
}
