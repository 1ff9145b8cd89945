// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Where log events go. Mirrors the `Output` enum in the teacher's
/// `cfg::logger`, minus the JSON span-capture layer this crate has no use
/// for (no business handlers here produce span-worthy request metadata).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Stdout,
    Stderr,
}

/// Initializes the global `tracing` subscriber. `filter` is an
/// `EnvFilter`-compatible directive string (e.g. `"kcp_rpc=debug,info"`);
/// pass `None` to fall back to `RUST_LOG` or `info`.
///
/// Returns a [`WorkerGuard`] that must be kept alive for the process
/// lifetime; dropping it stops the non-blocking writer from flushing.
pub fn init_logger(output: LogOutput, filter: Option<&str>) -> Result<WorkerGuard> {
    let env_filter = match filter {
        Some(f) => EnvFilter::try_new(f).context("invalid log filter directive")?,
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let (writer, guard) = match output {
        LogOutput::Stdout => tracing_appender::non_blocking(std::io::stdout()),
        LogOutput::Stderr => tracing_appender::non_blocking(std::io::stderr()),
    };

    let fmt_layer = fmt::layer().with_writer(writer).with_target(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .context("failed to install global tracing subscriber")?;

    Ok(guard)
}
