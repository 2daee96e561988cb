//! Process logging setup and raw JSON line output (ndjson).

use serde::Serialize;
use std::io::{self, Write};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Initialize tracing with JSON or human-readable output
pub struct StructuredLogger;

impl StructuredLogger {
    /// Install the global subscriber on stderr; stdout carries the threat report.
    /// `RUST_LOG` overrides `default_level`.
    pub fn init(json: bool, default_level: &str) {
        Self::subscriber(json, default_level, std::io::stderr).init();
    }

    pub fn subscriber<W>(json: bool, default_level: &str, writer: W) -> Box<dyn tracing::Subscriber + Send + Sync>
    where
        W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
    {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
        let registry = tracing_subscriber::registry().with(filter);
        if json {
            let fmt = tracing_subscriber::fmt::layer()
                .json()
                .with_span_events(FmtSpan::NONE)
                .with_writer(writer);
            Box::new(registry.with(fmt))
        } else {
            Box::new(registry.with(tracing_subscriber::fmt::layer().with_writer(writer)))
        }
    }

    /// Write one value as a single JSON line, bypassing tracing
    pub fn emit_json(event: &impl Serialize, w: &mut impl Write) -> io::Result<()> {
        let line = serde_json::to_string(event)?;
        writeln!(w, "{}", line)
    }
}
