//! # Relay Core - log-event streaming bridge
//!
//! Relays the log output of a long-running background task to a client
//! while the task runs.
//!
//! This crate provides:
//! - Emission Sink (`sink`) - tracing layer every log line passes through
//! - Observer Registry (`registry`) - process-wide, mutable observer slots
//! - Bridge Queue (`bridge`) - per-connection push-to-pull FIFO
//! - Stream Driver (`driver`) - per-connection state machine
//! - Frames (`frame`) - outbound events and their SSE encoding
//! - Background tasks (`task`) - the opaque unit of work being relayed
//! - Configuration (`config`) and logging setup (`logging`)
//!
//! ```text
//! task logs ──▶ EmissionSink ──▶ ObserverRegistry ──▶ BridgeQueue (per connection)
//!                                                        │
//!                                       StreamDriver ◀───┘ ──▶ frames ──▶ client
//! ```

#![warn(missing_docs)]

pub mod bridge;
pub mod config;
pub mod driver;
pub mod error;
pub mod frame;
pub mod logging;
pub mod registry;
pub mod sink;
pub mod task;

pub use error::{Error, Result};

/// Prelude - commonly used types
pub mod prelude {
    pub use crate::config::{CancelPolicy, LogConfig, RelayConfig, StreamConfig};
    pub use crate::driver::{FrameStream, StreamDriver, StreamOutcome, StreamReport};
    pub use crate::error::{Error, Result};
    pub use crate::frame::{Frame, FrameKind};
    pub use crate::logging::{init_logging, LoggingHandle};
    pub use crate::registry::{LogMessage, LogObserver, ObserverHandle, ObserverRegistry};
    pub use crate::sink::EmissionSink;
    pub use crate::task::{BackgroundTask, ScriptedTask, ScriptedTaskFactory, TaskFactory};
}
