//! Logging configuration with rotation support
//!
//! One subscriber is installed per process: a reloadable level filter, a
//! formatting layer writing to swappable destinations (stderr and a rolling
//! file), and the [`EmissionSink`] that feeds the observer registry.
//! Reconfiguring swaps destinations and filter in place; the sink layer and
//! every registered observer are left alone.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use relay_core::config::LogConfig;
//! use relay_core::logging::init_logging;
//! use relay_core::registry::ObserverRegistry;
//!
//! let registry = Arc::new(ObserverRegistry::new());
//! let logging = init_logging(&LogConfig::default(), registry).unwrap();
//! logging.reconfigure(&LogConfig { file_enabled: false, ..LogConfig::default() }).unwrap();
//! ```

use std::io::{self, Write};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use tracing::{Level, Metadata, Subscriber};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter, Registry};

use crate::config::{LogConfig, LogRotation};
use crate::error::{Error, Result};
use crate::registry::ObserverRegistry;
use crate::sink::EmissionSink;

static INSTALLED: OnceLock<LoggingHandle> = OnceLock::new();

/// Install the process-wide subscriber.
///
/// Calling this again with the same registry reconfigures the existing
/// subscriber instead of stacking a second one. A different registry is
/// rejected: the emission sink is bound to the first.
pub fn init_logging(config: &LogConfig, registry: Arc<ObserverRegistry>) -> Result<LoggingHandle> {
    if let Some(existing) = INSTALLED.get() {
        return existing.reuse(config, &registry);
    }

    let (subscriber, handle) = build_logging(config, Arc::clone(&registry))?;
    subscriber
        .try_init()
        .map_err(|e| Error::Logging(format!("Failed to init tracing: {}", e)))?;

    match INSTALLED.set(handle.clone()) {
        Ok(()) => Ok(handle),
        Err(_) => Err(Error::Logging("Logging initialised concurrently".to_string())),
    }
}

/// Build the subscriber without installing it.
///
/// Useful with [`tracing::subscriber::set_default`] in tests.
pub fn build_logging(
    config: &LogConfig,
    registry: Arc<ObserverRegistry>,
) -> Result<(impl Subscriber + Send + Sync + 'static, LoggingHandle)> {
    let destinations = DestinationWriter::new(Destinations::open(config)?);
    let (filter, filter_handle) = reload::Layer::new(build_filter(config)?);

    let output = fmt::layer()
        .with_writer(destinations.clone())
        .with_ansi(false)
        .with_target(false);

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(output)
        .with(EmissionSink::new(Arc::clone(&registry)));

    let handle = LoggingHandle {
        destinations,
        filter: filter_handle,
        registry,
    };
    Ok((subscriber, handle))
}

/// Transport crates stay quiet unless `RUST_LOG` asks for them; every admitted
/// record also reaches connected clients.
const QUIET_DIRECTIVES: &str = "hyper=warn,hyper_util=warn,h2=warn,reqwest=warn,tower_http=info";

/// Allow `RUST_LOG` to override, otherwise admit the most verbose
/// destination's level
fn build_filter(config: &LogConfig) -> Result<EnvFilter> {
    let console = config.console_level()?;
    let file = config.file_level()?;
    let level = match (config.console_enabled, config.file_enabled) {
        (true, true) => console.max(file),
        (false, true) => file,
        _ => console,
    };
    Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{},{}",
            level.as_str().to_ascii_lowercase(),
            QUIET_DIRECTIVES
        ))
    }))
}

/// Control over the installed subscriber
#[derive(Clone)]
pub struct LoggingHandle {
    destinations: DestinationWriter,
    filter: reload::Handle<EnvFilter, Registry>,
    registry: Arc<ObserverRegistry>,
}

impl LoggingHandle {
    /// Replace log destinations and levels.
    ///
    /// Buffered lines of a replaced log file are flushed before this returns.
    pub fn reconfigure(&self, config: &LogConfig) -> Result<()> {
        let filter = build_filter(config)?;
        let destinations = Destinations::open(config)?;
        let previous = self.destinations.replace(destinations);
        drop(previous);
        self.filter
            .reload(filter)
            .map_err(|e| Error::Logging(format!("Failed to reload log filter: {}", e)))
    }

    /// Registry fed by the emission sink
    pub fn registry(&self) -> &Arc<ObserverRegistry> {
        &self.registry
    }

    fn reuse(&self, config: &LogConfig, registry: &Arc<ObserverRegistry>) -> Result<Self> {
        if !Arc::ptr_eq(&self.registry, registry) {
            return Err(Error::Logging(
                "Logging already initialised with another observer registry".to_string(),
            ));
        }
        self.reconfigure(config)?;
        Ok(self.clone())
    }
}

impl std::fmt::Debug for LoggingHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoggingHandle")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

struct FileDestination {
    level: Level,
    writer: NonBlocking,
    _guard: WorkerGuard,
}

/// Currently configured outputs
struct Destinations {
    console: Option<Level>,
    file: Option<FileDestination>,
}

impl Destinations {
    fn open(config: &LogConfig) -> Result<Self> {
        let console = if config.console_enabled {
            Some(config.console_level()?)
        } else {
            None
        };

        let file = if config.file_enabled {
            let rotation = match config.rotation {
                LogRotation::Hourly => Rotation::HOURLY,
                LogRotation::Daily => Rotation::DAILY,
                LogRotation::Never => Rotation::NEVER,
            };
            let appender = RollingFileAppender::builder()
                .rotation(rotation)
                .filename_prefix(file_prefix(config.name.as_deref()))
                .filename_suffix("log")
                .build(&config.directory)
                .map_err(|e| Error::Logging(format!("Failed to create log appender: {}", e)))?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            Some(FileDestination {
                level: config.file_level()?,
                writer,
                _guard: guard,
            })
        } else {
            None
        };

        Ok(Self { console, file })
    }
}

/// `<name>_<YYYYmmddHHMMSS>`, or just the timestamp without a name
fn file_prefix(name: Option<&str>) -> String {
    let stamp = chrono::Local::now().format("%Y%m%d%H%M%S");
    match name {
        Some(name) if !name.trim().is_empty() => format!("{}_{}", name.trim(), stamp),
        _ => stamp.to_string(),
    }
}

/// `MakeWriter` routing each record to the destinations whose level admits it
#[derive(Clone)]
struct DestinationWriter {
    inner: Arc<RwLock<Destinations>>,
}

impl DestinationWriter {
    fn new(destinations: Destinations) -> Self {
        Self {
            inner: Arc::new(RwLock::new(destinations)),
        }
    }

    fn replace(&self, destinations: Destinations) -> Destinations {
        std::mem::replace(&mut *self.inner.write(), destinations)
    }

    fn writer(&self, level: Option<&Level>) -> RoutedWriter {
        let admits = |max: &Level| level.map_or(true, |level| level <= max);
        let destinations = self.inner.read();
        RoutedWriter {
            console: destinations.console.as_ref().is_some_and(admits),
            file: destinations
                .file
                .as_ref()
                .filter(|file| admits(&file.level))
                .map(|file| file.writer.clone()),
        }
    }
}

impl<'a> MakeWriter<'a> for DestinationWriter {
    type Writer = RoutedWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.writer(None)
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        self.writer(Some(meta.level()))
    }
}

/// Writer for one formatted record
struct RoutedWriter {
    console: bool,
    file: Option<NonBlocking>,
}

impl Write for RoutedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.console {
            let _ = io::stderr().write_all(buf);
        }
        if let Some(file) = &mut self.file {
            let _ = file.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.console {
            let _ = io::stderr().flush();
        }
        if let Some(file) = &mut self.file {
            let _ = file.flush();
        }
        Ok(())
    }
}
