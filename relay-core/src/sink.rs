//! Emission Sink: the tracing layer every log line passes through
//!
//! The layer renders each event into a [`LogMessage`] and hands it to the
//! [`ObserverRegistry`] unchanged. It is installed once by
//! [`init_logging`](crate::logging::init_logging) and is not touched when
//! log destinations are reconfigured.

use std::fmt::{self, Write as _};
use std::sync::Arc;

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::registry::{LogMessage, ObserverRegistry};

/// Layer forwarding every rendered event to the observer registry
#[derive(Debug, Clone)]
pub struct EmissionSink {
    registry: Arc<ObserverRegistry>,
}

impl EmissionSink {
    /// Create a sink feeding `registry`
    pub fn new(registry: Arc<ObserverRegistry>) -> Self {
        Self { registry }
    }

    /// The registry this sink feeds
    pub fn registry(&self) -> &Arc<ObserverRegistry> {
        &self.registry
    }
}

impl<S: Subscriber> Layer<S> for EmissionSink {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        // Nothing to render for.
        if self.registry.active_count() == 0 {
            return;
        }
        self.registry.dispatch(&render(event));
    }
}

/// Render an event as its message followed by ` key=value` for other fields
pub fn render(event: &Event<'_>) -> LogMessage {
    let mut visitor = MessageVisitor::default();
    event.record(&mut visitor);
    visitor.finish()
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(mut self) -> LogMessage {
        self.message.push_str(&self.fields);
        LogMessage::from(self.message)
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use parking_lot::Mutex;
    use tracing_subscriber::prelude::*;

    fn capture() -> (Arc<ObserverRegistry>, Arc<Mutex<Vec<String>>>) {
        let registry = Arc::new(ObserverRegistry::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        registry.register(Arc::new(move |message: &LogMessage| -> Result<()> {
            sink.lock().push(message.to_string());
            Ok(())
        }));
        (registry, seen)
    }

    #[test]
    fn test_message_is_forwarded_verbatim() {
        let (registry, seen) = capture();
        let subscriber = tracing_subscriber::registry().with(EmissionSink::new(registry));

        tracing::subscriber::with_default(subscriber, || {
            let ticker = "AAPL";
            tracing::info!("Fetching quote for {}", ticker);
            tracing::warn!("Empty prompt provided.");
        });

        assert_eq!(
            seen.lock().as_slice(),
            ["Fetching quote for AAPL", "Empty prompt provided."]
        );
    }

    #[test]
    fn test_extra_fields_follow_message() {
        let (registry, seen) = capture();
        let subscriber = tracing_subscriber::registry().with(EmissionSink::new(registry));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(step = 2, tool = "search", "Running tool");
        });

        assert_eq!(seen.lock().as_slice(), ["Running tool step=2 tool=search"]);
    }

    #[test]
    fn test_every_level_passes_through() {
        let (registry, seen) = capture();
        let subscriber = tracing_subscriber::registry().with(EmissionSink::new(registry));

        tracing::subscriber::with_default(subscriber, || {
            tracing::trace!("t");
            tracing::debug!("d");
            tracing::error!("e");
        });

        assert_eq!(seen.lock().as_slice(), ["t", "d", "e"]);
    }
}
