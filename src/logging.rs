//! Logging setup and the log-on-error policy.
//!
//! Every event goes to stderr through the fmt layer. [`ErrorCapture`] also
//! buffers each line of the run; the buffer is written to
//! `<log_dir>/<stage>_<YYYY-MM-DD>.log` only if an ERROR event was seen.

use chrono::{Local, NaiveDate};
use std::fmt::{self, Write as _};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::{
    filter::EnvFilter,
    layer::{Context, SubscriberExt},
    registry::LookupSpan,
    util::SubscriberInitExt,
    Layer,
};

use crate::error::Result;

/// Layer that keeps the run's log in memory and remembers errors.
#[derive(Clone, Default)]
pub struct ErrorCapture {
    lines: Arc<Mutex<Vec<String>>>,
    saw_error: Arc<AtomicBool>,
}

impl ErrorCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_errors(&self) -> bool {
        self.saw_error.load(Ordering::SeqCst)
    }

    pub fn line_count(&self) -> usize {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Write the buffered log if any error occurred. Returns the file written.
    pub fn flush_if_errors(&self, log_dir: &Path, stage: &str, date: NaiveDate) -> Result<Option<PathBuf>> {
        if !self.has_errors() {
            return Ok(None);
        }

        fs::create_dir_all(log_dir)?;
        let path = log_dir.join(format!("{}_{}.log", stage, date.format("%Y-%m-%d")));
        let lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        let mut content = lines.join("\n");
        content.push('\n');
        fs::write(&path, content)?;
        Ok(Some(path))
    }
}

impl<S> Layer<S> for ErrorCapture
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if *metadata.level() == Level::ERROR {
            self.saw_error.store(true, Ordering::SeqCst);
        }

        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);

        let line = format!(
            "{} {:>5} {}: {}{}",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            metadata.level(),
            metadata.target(),
            visitor.message,
            visitor.fields
        );
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line);
    }
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

/// Install the global subscriber: EnvFilter (RUST_LOG, default info),
/// fmt to stderr, and the given capture layer.
pub fn init_tracing(capture: ErrorCapture) -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(capture)
        .try_init()?;
    Ok(())
}
