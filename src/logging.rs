//! # Logging
//!
//! Callers install their own `tracing` subscriber; this module only
//! supplies [`ColorizedFormatter`], a level-colored event formatter, and
//! [`init`], a minimal stdout subscriber for tests and examples that want
//! colorized output without wiring up `tracing` themselves.

use std::fmt;

use colored::*;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

/// Colors an entire formatted log line by its severity level, without
/// printing timestamps or level labels, for clean user-facing output.
pub struct ColorizedFormatter;

impl<S, N> FormatEvent<S, N> for ColorizedFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(&self, ctx: &FmtContext<'_, S, N>, mut writer: Writer<'_>, event: &Event<'_>) -> fmt::Result {
        let mut buffer = String::new();
        let buf_writer = Writer::new(&mut buffer);
        ctx.format_fields(buf_writer, event)?;

        let colored_output = match *event.metadata().level() {
            Level::INFO => buffer.white(),
            Level::WARN => buffer.yellow(),
            Level::ERROR => buffer.red(),
            Level::DEBUG => buffer.blue(),
            Level::TRACE => buffer.purple(),
        };

        writeln!(writer, "{colored_output}")
    }
}

/// Install a stdout subscriber using [`ColorizedFormatter`], honoring
/// `RUST_LOG` (default `info`). Idempotent: a second call is a no-op
/// rather than panicking, so tests can call it freely.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stdout)
        .event_format(ColorizedFormatter)
        .with_env_filter(filter)
        .try_init();
}
