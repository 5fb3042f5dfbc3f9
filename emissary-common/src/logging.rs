//! Log setup and the wire-traffic logging macros.
//!
//! `outgoing!` marks client-to-server traffic, `incoming!` server-to-client
//! traffic and `internal!` everything the engine decides on its own. Each
//! opens a span of that name so the three streams can be filtered apart.

use std::str::FromStr;

use serde::Deserialize;
use tracing::metadata::LevelFilter;
use tracing_subscriber::{
    Layer, filter::FilterFn, prelude::__tracing_subscriber_SubscriberExt, util::SubscriberInitExt,
};

#[macro_export]
macro_rules! log {
    ($level:expr, $span:expr, $($msg:expr),*) => {{
        let span = $crate::tracing::span!($level, $span);
        let _enter = span.enter();

        $crate::tracing::event!($level, $($msg),*)
    }};
}

#[macro_export]
macro_rules! outgoing {
    (level = $level:ident, $($msg:expr),*) => {
        $crate::log!($crate::tracing::Level::$level, "outgoing", $($msg),*)
    };

    ($($msg:expr),*) => {
        $crate::outgoing!(level = TRACE, $($msg),*)
    };
}

#[macro_export]
macro_rules! incoming {
    (level = $level:ident, $($msg:expr),*) => {
        $crate::log!($crate::tracing::Level::$level, "incoming", $($msg),*)
    };

    ($($msg:expr),*) => {
        $crate::incoming!(level = TRACE, $($msg),*)
    };
}

#[macro_export]
macro_rules! internal {
    (level = $level:ident, $($msg:expr),*) => {
        $crate::log!($crate::tracing::Level::$level, "internal", $($msg),*)
    };

    ($($msg:expr),*) => {
        $crate::internal!(level = TRACE, $($msg),*)
    };
}

/// Subscriber settings.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Level name (`trace`, `debug`, ...). `LOG_LEVEL` overrides it.
    #[serde(default)]
    pub level: Option<String>,

    /// Colourise output.
    #[serde(default = "default_ansi")]
    pub ansi: bool,

    /// Only targets starting with one of these prefixes are emitted.
    #[serde(default = "default_targets")]
    pub targets: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: None,
            ansi: default_ansi(),
            targets: default_targets(),
        }
    }
}

const fn default_ansi() -> bool {
    true
}

fn default_targets() -> Vec<String> {
    vec!["emissary".to_string()]
}

impl LoggingConfig {
    /// Resolves the effective level: `LOG_LEVEL`, then the configured
    /// level, then TRACE for debug builds and INFO otherwise.
    #[must_use]
    pub fn level_filter(&self) -> LevelFilter {
        let fallback = if cfg!(debug_assertions) {
            LevelFilter::TRACE
        } else {
            LevelFilter::INFO
        };

        std::env::var("LOG_LEVEL")
            .ok()
            .or_else(|| self.level.clone())
            .map_or(fallback, |level| {
                LevelFilter::from_str(&level).unwrap_or_else(|_| {
                    eprintln!("Invalid log level specified {level}, defaulting to {fallback}");
                    fallback
                })
            })
    }
}

/// Installs the global subscriber with default settings.
pub fn init() {
    init_with(&LoggingConfig::default());
}

/// Installs the global subscriber. Later calls are ignored, so tests may
/// call this freely.
pub fn init_with(config: &LoggingConfig) {
    let targets = config.targets.clone();

    let _ = tracing_subscriber::Registry::default()
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(false)
                .with_line_number(false)
                .compact()
                .with_ansi(config.ansi)
                .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
                .with_filter(config.level_filter())
                .with_filter(FilterFn::new(move |metadata| {
                    targets
                        .iter()
                        .any(|prefix| metadata.target().starts_with(prefix.as_str()))
                })),
        )
        .try_init();
}
