use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::migration::{MigrationRun, MigrationStatus, MigrationStep};

/// Events emitted while a run progresses, in order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Progress {
        phase: MigrationStatus,
        entity: String,
        records_processed: usize,
        records_succeeded: usize,
        records_failed: usize,
        total_records: usize,
        message: String,
    },
    StepComplete {
        step_id: String,
        name: String,
        entity: String,
        status: MigrationStatus,
        records_processed: usize,
        records_succeeded: usize,
        records_failed: usize,
    },
    Complete {
        run_id: String,
        status: MigrationStatus,
        total_records_processed: usize,
        total_records_succeeded: usize,
        total_records_failed: usize,
    },
    Error {
        phase: MigrationStatus,
        message: String,
    },
}

/// Sends progress events to an optional consumer.
///
/// The channel is unbounded so a slow consumer never holds up a phase, and a
/// consumer that went away is ignored.
#[derive(Debug, Clone, Default)]
pub struct ProgressReporter {
    sender: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl ProgressReporter {
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { sender: Some(tx) }, rx)
    }

    pub fn emit(&self, event: ProgressEvent) {
        if let Some(sender) = &self.sender {
            if sender.send(event).is_err() {
                debug!("Progress consumer dropped");
            }
        }
    }

    pub fn progress(
        &self,
        phase: MigrationStatus,
        step: &MigrationStep,
        total_records: usize,
        message: impl Into<String>,
    ) {
        self.emit(ProgressEvent::Progress {
            phase,
            entity: step.entity.clone(),
            records_processed: step.records_processed,
            records_succeeded: step.records_succeeded,
            records_failed: step.records_failed,
            total_records,
            message: message.into(),
        });
    }

    pub fn step_complete(&self, step: &MigrationStep) {
        self.emit(ProgressEvent::StepComplete {
            step_id: step.id.clone(),
            name: step.name.clone(),
            entity: step.entity.clone(),
            status: step.status,
            records_processed: step.records_processed,
            records_succeeded: step.records_succeeded,
            records_failed: step.records_failed,
        });
    }

    pub fn complete(&self, run: &MigrationRun) {
        self.emit(ProgressEvent::Complete {
            run_id: run.id.clone(),
            status: run.status,
            total_records_processed: run.total_records_processed,
            total_records_succeeded: run.total_records_succeeded,
            total_records_failed: run.total_records_failed,
        });
    }

    pub fn error(&self, phase: MigrationStatus, message: impl Into<String>) {
        self.emit(ProgressEvent::Error {
            phase,
            message: message.into(),
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunSignal {
    Running,
    Paused,
    Cancelled,
}

/// Pause, resume and cancel handle shared between a run and its controller.
///
/// The run only looks at the signal between batches. Cancellation is final.
#[derive(Debug, Clone)]
pub struct RunControl {
    sender: Arc<watch::Sender<RunSignal>>,
    receiver: watch::Receiver<RunSignal>,
}

impl RunControl {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(RunSignal::Running);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    pub fn signal(&self) -> RunSignal {
        *self.receiver.borrow()
    }

    pub fn pause(&self) {
        self.sender.send_if_modified(|signal| {
            if *signal == RunSignal::Running {
                *signal = RunSignal::Paused;
                true
            } else {
                false
            }
        });
    }

    pub fn resume(&self) {
        self.sender.send_if_modified(|signal| {
            if *signal == RunSignal::Paused {
                *signal = RunSignal::Running;
                true
            } else {
                false
            }
        });
    }

    pub fn cancel(&self) {
        self.sender.send_replace(RunSignal::Cancelled);
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal() == RunSignal::Cancelled
    }

    /// Block while paused and return the signal that ended the wait
    pub async fn wait_while_paused(&self) -> RunSignal {
        let mut receiver = self.receiver.clone();
        loop {
            let signal = *receiver.borrow_and_update();
            if signal != RunSignal::Paused {
                return signal;
            }
            if receiver.changed().await.is_err() {
                return RunSignal::Cancelled;
            }
        }
    }
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_cancel_is_final() {
        let control = RunControl::new();
        control.pause();
        assert_eq!(control.signal(), RunSignal::Paused);
        control.cancel();
        control.resume();
        control.pause();
        assert!(control.is_cancelled());
    }

    #[tokio::test]
    async fn test_wait_while_paused_returns_on_resume() {
        let control = RunControl::new();
        assert_eq!(control.wait_while_paused().await, RunSignal::Running);

        control.pause();
        let waiter = {
            let control = control.clone();
            tokio::spawn(async move { control.wait_while_paused().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        control.resume();
        assert_eq!(waiter.await.unwrap(), RunSignal::Running);
    }

    #[tokio::test]
    async fn test_wait_while_paused_returns_on_cancel() {
        let control = RunControl::new();
        control.pause();
        let waiter = {
            let control = control.clone();
            tokio::spawn(async move { control.wait_while_paused().await })
        };
        control.cancel();
        assert_eq!(waiter.await.unwrap(), RunSignal::Cancelled);
    }

    #[tokio::test]
    async fn test_progress_events_are_ordered() {
        let (reporter, mut rx) = ProgressReporter::channel();
        let mut step = MigrationStep::new("Load customer", "customer");
        step.records_processed = 5;

        reporter.progress(MigrationStatus::Loading, &step, 10, "batch 1");
        reporter.error(MigrationStatus::Loading, "boom");

        assert!(matches!(
            rx.recv().await,
            Some(ProgressEvent::Progress { records_processed: 5, total_records: 10, .. })
        ));
        assert!(matches!(rx.recv().await, Some(ProgressEvent::Error { .. })));
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = ProgressEvent::Error {
            phase: MigrationStatus::Loading,
            message: "boom".to_string(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["phase"], "loading");
    }

    #[test]
    fn test_disabled_reporter_ignores_events() {
        ProgressReporter::disabled().error(MigrationStatus::Failed, "ignored");
    }
}
