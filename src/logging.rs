// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Log Output
//!
//! Installs the process-wide `tracing` subscriber. The filter comes from
//! `RUST_LOG` (default `info`); lapin's own chatter is kept at `warn`.

use std::str::FromStr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_DIRECTIVE: &str = "info,lapin=warn";

/// Output format for log events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format `{other}`")),
        }
    }
}

/// Installs the subscriber and the trace-context propagator used for AMQP
/// headers. Calling it twice keeps the first subscriber.
pub fn init_tracing(format: LogFormat) {
    crate::otel::install_propagator();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));

    let fmt_layer = match format {
        LogFormat::Json => fmt::layer().with_target(false).json().boxed(),
        LogFormat::Pretty => fmt::layer().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .ok();
}
