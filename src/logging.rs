use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::error::BotError;

const DEFAULT_DIRECTIVE: &str = "azure_bot=info";
const VERBOSE_DIRECTIVE: &str = "azure_bot=debug";

// ── Subscriber setup ─────────────────────────────────────

/// Install the global subscriber: stderr always, plus an ANSI-free file
/// layer when `log_file` is given. `RUST_LOG` is honoured on both.
pub fn init(verbose: bool, log_file: Option<&Path>) -> Result<(), BotError> {
    let terminal_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(filter(verbose));

    let file_layer = match log_file {
        Some(path) => {
            let writer = SharedFileWriter::open(path).map_err(|source| BotError::Io {
                context: format!("failed to open log file {}", path.display()),
                source,
            })?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(writer)
                    .with_filter(filter(verbose)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(terminal_layer)
        .with(file_layer)
        .init();
    Ok(())
}

fn filter(verbose: bool) -> EnvFilter {
    let directive = if verbose {
        VERBOSE_DIRECTIVE
    } else {
        DEFAULT_DIRECTIVE
    };
    EnvFilter::builder()
        .with_default_directive(tracing::Level::WARN.into())
        .parse_lossy(std::env::var("RUST_LOG").unwrap_or_else(|_| directive.to_string()))
}

// ── SharedFileWriter ─────────────────────────────────────

/// A `MakeWriter` that appends every event to one file, shared across
/// threads.
#[derive(Clone)]
pub struct SharedFileWriter {
    inner: Arc<Mutex<File>>,
}

impl SharedFileWriter {
    /// Open `path` in append mode, creating parent directories.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(file)),
        })
    }
}

/// Writer returned by `MakeWriter::make_writer`.
pub struct SharedWriter {
    inner: Arc<Mutex<File>>,
}

impl std::io::Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.inner.lock() {
            Ok(mut f) => f.write(buf),
            Err(_) => Ok(buf.len()), // poisoned: drop the line
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.inner.lock() {
            Ok(mut f) => f.flush(),
            Err(_) => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for SharedFileWriter {
    type Writer = SharedWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SharedWriter {
            inner: self.inner.clone(),
        }
    }
}
