//! Stream Driver
//!
//! Runs one background task per connection and relays the process log to
//! the connection while the task is in flight.
//!
//! ```text
//! STARTING ──▶ STREAMING ──▶ DRAINING ──▶ DONE
//!     │            │             │          ▲
//!     └────────────┴──── ERRORED ┴──────────┘
//! ```
//!
//! Guarantees, per connection:
//! - frames carry log lines in emission order
//! - the terminal frame is the last frame
//! - the observer is unregistered before `cleanup()` and no frame follows it
//! - `cleanup()` runs exactly once whenever a task was created

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{FutureExt, Stream};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::bridge::{bridge, BridgeQueue, Polled};
use crate::config::{CancelPolicy, StreamConfig};
use crate::error::{panic_message, Error, Result};
use crate::frame::{Frame, FrameKind, COMPLETED, PROCESSING};
use crate::registry::ObserverRegistry;
use crate::task::{BackgroundTask, TaskFactory};

type TaskOutput = anyhow::Result<String>;

/// How a stream ended
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StreamOutcome {
    /// The request was invalid; no task was created
    Rejected,
    /// The task finished and the completion frame was sent
    #[default]
    Completed,
    /// The task or the driver failed; an error frame was sent
    Failed(String),
    /// The client went away before the terminal frame
    Disconnected,
}

/// Summary of one connection
#[derive(Debug, Clone, Default)]
pub struct StreamReport {
    /// Connection identifier used in log spans
    pub connection: Uuid,
    /// How the stream ended
    pub outcome: StreamOutcome,
    /// Frames accepted by the outbound channel
    pub frames_sent: u64,
    /// Log lines dropped by a full bounded queue
    pub messages_dropped: u64,
}

/// Drives background tasks and relays their log output.
///
/// Cheap to clone; every clone shares the registry.
#[derive(Debug, Clone)]
pub struct StreamDriver {
    registry: Arc<ObserverRegistry>,
    config: StreamConfig,
}

impl StreamDriver {
    /// Create a driver registering its observers with `registry`
    pub fn new(registry: Arc<ObserverRegistry>, config: StreamConfig) -> Self {
        Self { registry, config }
    }

    /// Registry observers are registered with
    pub fn registry(&self) -> &Arc<ObserverRegistry> {
        &self.registry
    }

    /// Streaming settings
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Spawn a driver for `prompt` and return its frames.
    ///
    /// Dropping the returned stream counts as a client disconnect.
    pub fn spawn(&self, prompt: impl Into<String>, factory: Arc<dyn TaskFactory>) -> FrameStream {
        let (tx, rx) = mpsc::channel(self.config.frame_buffer);
        let driver = self.clone();
        let prompt = prompt.into();
        let connection = Uuid::new_v4();
        let span = tracing::info_span!("stream", %connection);
        let handle = tokio::spawn(
            async move { driver.run_as(connection, &prompt, factory.as_ref(), tx).await }
                .instrument(span),
        );
        FrameStream {
            frames: rx,
            driver: handle,
        }
    }

    /// Run one connection to completion, sending frames to `frames`
    pub async fn run(
        &self,
        prompt: &str,
        factory: &dyn TaskFactory,
        frames: mpsc::Sender<Frame>,
    ) -> StreamReport {
        self.run_as(Uuid::new_v4(), prompt, factory, frames).await
    }

    async fn run_as(
        &self,
        connection: Uuid,
        prompt: &str,
        factory: &dyn TaskFactory,
        frames: mpsc::Sender<Frame>,
    ) -> StreamReport {
        let mut out = Outbound::new(frames);
        let mut report = StreamReport {
            connection,
            ..StreamReport::default()
        };

        // STARTING
        if prompt.trim().is_empty() {
            let rejection = Error::EmptyPrompt;
            warn!("{}", rejection);
            report.outcome = match out.send(Frame::rejected(rejection.to_string())).await {
                Ok(()) => StreamOutcome::Rejected,
                Err(_) => StreamOutcome::Disconnected,
            };
            report.frames_sent = out.sent;
            return report;
        }

        // Nothing is registered until a task exists, so a failing factory
        // leaves no observer behind.
        let task = match catch_unwind(AssertUnwindSafe(|| factory.create())) {
            Ok(task) => task,
            Err(panic) => {
                let failure = Error::TaskPanicked(panic_message(panic.as_ref()));
                error!("An error occurred: {}", failure);
                let frame = Frame::error(failure);
                let outcome = StreamOutcome::Failed(frame.text().to_string());
                report.outcome = match out.send(frame).await {
                    Ok(()) => outcome,
                    Err(_) => StreamOutcome::Disconnected,
                };
                report.frames_sent = out.sent;
                return report;
            }
        };

        let (observer, mut queue) = bridge(self.config.queue_capacity);
        let handle = self.registry.register(Arc::new(observer));

        info!("{}", PROCESSING);
        let mut job = launch(Arc::clone(&task), prompt.to_owned());

        // STREAMING / DRAINING, with any driver panic routed to ERRORED
        let drained = AssertUnwindSafe(self.drive(&mut queue, &mut job, &mut out))
            .catch_unwind()
            .await;
        let terminal = match drained {
            Ok(Ok(terminal)) => Some(terminal),
            Ok(Err(e)) if e.is_client_visible() => Some(Frame::error(e)),
            Ok(Err(_)) => None,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!("Stream driver failed: {}", message);
                Some(Frame::error(Error::Internal(message)))
            }
        };

        report.outcome = match terminal {
            Some(frame) => {
                let outcome = match frame.kind() {
                    FrameKind::Error => StreamOutcome::Failed(frame.text().to_string()),
                    _ => StreamOutcome::Completed,
                };
                match out.send(frame).await {
                    Ok(()) => outcome,
                    Err(_) => StreamOutcome::Disconnected,
                }
            }
            None => StreamOutcome::Disconnected,
        };

        // DONE
        self.registry.unregister(handle);
        queue.close();
        if !job.is_finished() {
            match self.config.cancel_policy {
                CancelPolicy::Abort => {
                    job.abort();
                    debug!("Background task aborted");
                }
                CancelPolicy::Detach => debug!("Background task left running"),
            }
        }
        release(task.as_ref()).await;

        report.frames_sent = out.sent;
        report.messages_dropped = queue.dropped();
        if report.messages_dropped > 0 {
            warn!(dropped = report.messages_dropped, "Bridge queue overflowed");
        }
        debug!(
            outcome = ?report.outcome,
            frames = report.frames_sent,
            "Stream finished"
        );
        report
    }

    /// STREAMING then DRAINING. Returns the terminal frame, or a transport
    /// error once the client is gone.
    async fn drive(
        &self,
        queue: &mut BridgeQueue,
        job: &mut JoinHandle<TaskOutput>,
        out: &mut Outbound,
    ) -> Result<Frame> {
        let wait = self.config.poll_interval();
        loop {
            match queue.poll(wait).await {
                Polled::Message(message) => out.send(Frame::log(message)).await?,
                Polled::Timeout => out.ensure_open()?,
                Polled::Closed => break,
            }
            if job.is_finished() {
                // Dispatch is synchronous, so every line the task logged is
                // already queued.
                while let Some(message) = queue.try_next() {
                    out.send(Frame::log(message)).await?;
                }
                break;
            }
        }

        let result = job.await;
        Ok(match task_result(result) {
            Ok(_) => {
                info!("{}", COMPLETED);
                Frame::completed()
            }
            Err(e) => {
                error!("An error occurred: {}", e);
                Frame::error(e)
            }
        })
    }
}

fn launch(task: Arc<dyn BackgroundTask>, prompt: String) -> JoinHandle<TaskOutput> {
    tokio::spawn(async move { task.run(&prompt).await }.in_current_span())
}

fn task_result(result: std::result::Result<TaskOutput, JoinError>) -> Result<String> {
    match result {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(Error::TaskFailed(format!("{:#}", e))),
        Err(e) if e.is_panic() => Err(Error::TaskPanicked(panic_message(e.into_panic().as_ref()))),
        Err(e) => Err(Error::TaskFailed(e.to_string())),
    }
}

/// Invoke `cleanup()`, containing a panic so the stream still ends cleanly
async fn release(task: &dyn BackgroundTask) {
    if AssertUnwindSafe(task.cleanup()).catch_unwind().await.is_err() {
        error!("Background task cleanup panicked");
    }
}

/// Outbound half with transport-failure detection
struct Outbound {
    tx: mpsc::Sender<Frame>,
    sent: u64,
}

impl Outbound {
    fn new(tx: mpsc::Sender<Frame>) -> Self {
        Self { tx, sent: 0 }
    }

    async fn send(&mut self, frame: Frame) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| Error::transport("client disconnected"))?;
        self.sent += 1;
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.tx.is_closed() {
            Err(Error::transport("client disconnected"))
        } else {
            Ok(())
        }
    }
}

/// Frames of one spawned connection
pub struct FrameStream {
    frames: mpsc::Receiver<Frame>,
    driver: JoinHandle<StreamReport>,
}

impl FrameStream {
    /// Receive the next frame; `None` once the driver is done
    pub async fn next_frame(&mut self) -> Option<Frame> {
        self.frames.recv().await
    }

    /// Split into the frame receiver and the driver's join handle
    pub fn into_parts(self) -> (mpsc::Receiver<Frame>, JoinHandle<StreamReport>) {
        (self.frames, self.driver)
    }

    /// Stop receiving frames and wait for the driver's report
    pub async fn finish(self) -> Result<StreamReport> {
        drop(self.frames);
        self.driver
            .await
            .map_err(|e| Error::Internal(format!("Stream driver task failed: {}", e)))
    }
}

impl Stream for FrameStream {
    type Item = Frame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.frames.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_task_result_mapping() {
        let ok = tokio::spawn(async { anyhow::Ok("done".to_string()) }).await;
        assert_eq!(task_result(ok).unwrap(), "done");

        let failed = tokio::spawn(async { Err::<String, _>(anyhow::anyhow!("no quota")) }).await;
        assert!(matches!(task_result(failed), Err(Error::TaskFailed(m)) if m == "no quota"));

        let panicked = tokio::spawn(async {
            if true {
                panic!("tool crashed");
            }
            anyhow::Ok(String::new())
        })
        .await;
        assert!(matches!(task_result(panicked), Err(Error::TaskPanicked(m)) if m == "tool crashed"));
    }

    #[tokio::test]
    async fn test_outbound_detects_closed_receiver() {
        let (tx, rx) = mpsc::channel(1);
        let mut out = Outbound::new(tx);
        out.ensure_open().unwrap();
        drop(rx);
        assert!(out.ensure_open().is_err());
        assert!(matches!(
            out.send(Frame::completed()).await,
            Err(Error::Transport(_))
        ));
        assert_eq!(out.sent, 0);
    }
}
