use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use conclave_core::event::EventBus;
use conclave_core::types::WorkflowEvent;

use crate::response::preview;

/// JSONL run logger.
///
/// Listens on the EventBus and writes one JSON object per line to
/// `{log_dir}/{run_id}/{timestamp}.jsonl`. The file is opened when the run
/// starts, so a logger can be spawned before the run id is known.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

#[derive(Debug, Serialize)]
struct LogEntry {
    timestamp: String,
    run_id: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `level`: 1 = run summary, 2 = replies and transitions, 3 = state entries.
    pub fn new(log_dir: impl Into<PathBuf>, level: u8) -> Self {
        Self {
            log_dir: log_dir.into(),
            level,
        }
    }

    /// Subscribe now and log the next run in a background task.
    ///
    /// Events from other runs sharing the bus are ignored. The task ends
    /// after that run's `RunCompleted`, on cancellation or when the bus
    /// closes, and yields the path of the written file.
    pub fn spawn(
        self,
        event_bus: &EventBus,
        cancel: CancellationToken,
    ) -> JoinHandle<Option<PathBuf>> {
        let rx = event_bus.subscribe();
        tokio::spawn(self.run(rx, cancel))
    }

    async fn run(
        self,
        mut rx: broadcast::Receiver<WorkflowEvent>,
        cancel: CancellationToken,
    ) -> Option<PathBuf> {
        let mut writer: Option<(PathBuf, tokio::io::BufWriter<tokio::fs::File>)> = None;
        // Only the first run started after subscribing is logged
        let mut logged_run: Option<String> = None;

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => match result {
                    Ok(event) => event,
                    Err(RecvError::Lagged(n)) => {
                        debug!(skipped = n, "RunLogger lagged, skipped events");
                        continue;
                    }
                    Err(RecvError::Closed) => {
                        debug!("EventBus closed, RunLogger stopping");
                        break;
                    }
                },
            };

            if logged_run.is_none() {
                if !matches!(event, WorkflowEvent::RunStarted { .. }) {
                    continue;
                }
                match self.open(&event).await {
                    Some(opened) => writer = Some(opened),
                    None => return None,
                }
                logged_run = Some(event.run_id().0.clone());
            } else if logged_run.as_deref() != Some(event.run_id().0.as_str()) {
                continue;
            }

            let done = matches!(event, WorkflowEvent::RunCompleted { .. });
            if let (Some((_, w)), Some(entry)) = (writer.as_mut(), self.event_to_entry(&event)) {
                if let Ok(json) = serde_json::to_string(&entry) {
                    let line = format!("{}\n", json);
                    if let Err(e) = w.write_all(line.as_bytes()).await {
                        error!(error = %e, "Failed to write log entry");
                        break;
                    }
                    if let Err(e) = w.flush().await {
                        error!(error = %e, "Failed to flush log");
                    }
                }
            }
            if done {
                break;
            }
        }

        let (path, mut w) = writer?;
        w.flush().await.ok();
        debug!(path = %path.display(), "RunLogger finished");
        Some(path)
    }

    async fn open(
        &self,
        started: &WorkflowEvent,
    ) -> Option<(PathBuf, tokio::io::BufWriter<tokio::fs::File>)> {
        let run_dir = self.log_dir.join(&started.run_id().0);
        if let Err(e) = tokio::fs::create_dir_all(&run_dir).await {
            error!(error = %e, "Failed to create log directory");
            return None;
        }
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let path = run_dir.join(format!("{}.jsonl", timestamp));
        match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
        {
            Ok(f) => {
                info!(path = %path.display(), "RunLogger started");
                Some((path, tokio::io::BufWriter::new(f)))
            }
            Err(e) => {
                error!(error = %e, path = %path.display(), "Failed to open log file");
                None
            }
        }
    }

    /// Convert an event to a log entry, or `None` if filtered out by level.
    fn event_to_entry(&self, event: &WorkflowEvent) -> Option<LogEntry> {
        let entry = |event_type, state: Option<&str>, detail| LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            run_id: event.run_id().0.clone(),
            event_type,
            state: state.map(str::to_string),
            detail,
        };

        match event {
            WorkflowEvent::RunStarted { workflow, .. } => Some(entry(
                "run_started",
                None,
                Some(serde_json::json!({ "workflow": workflow })),
            )),
            WorkflowEvent::ExitTriggered { reason, .. } => Some(entry(
                "exit_triggered",
                None,
                Some(serde_json::json!({ "reason": reason })),
            )),
            WorkflowEvent::RunCompleted {
                success,
                total_turns,
                error,
                ..
            } => Some(entry(
                "run_completed",
                None,
                Some(serde_json::json!({
                    "success": success,
                    "total_turns": total_turns,
                    "error": error.as_deref().map(|e| preview(e, 500)),
                })),
            )),

            WorkflowEvent::AgentReplied {
                state,
                agent,
                decisions,
                elapsed_ms,
                ..
            } if self.level >= 2 => Some(entry(
                "agent_replied",
                Some(state),
                Some(serde_json::json!({
                    "agent": agent,
                    "decisions": decisions,
                    "elapsed_ms": elapsed_ms,
                })),
            )),
            WorkflowEvent::Transition {
                from, to, condition, ..
            } if self.level >= 2 => Some(entry(
                "transition",
                Some(from),
                Some(serde_json::json!({ "to": to, "condition": condition })),
            )),

            WorkflowEvent::StateEntered { state, agent, turn, .. } if self.level >= 3 => {
                Some(entry(
                    "state_entered",
                    Some(state),
                    Some(serde_json::json!({ "agent": agent, "turn": turn })),
                ))
            }

            _ => None,
        }
    }
}

/// Start a logger for the next run on `bus` if logging is enabled.
pub fn spawn_if_enabled(
    config: &conclave_core::config::LogConfig,
    log_dir: PathBuf,
    bus: &Arc<EventBus>,
    cancel: CancellationToken,
) -> Option<JoinHandle<Option<PathBuf>>> {
    config
        .enabled
        .then(|| RunLogger::new(log_dir, config.level).spawn(bus, cancel))
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_core::types::RunId;

    fn run_id() -> RunId {
        RunId("run-1".into())
    }

    #[test]
    fn test_entry_format() {
        let logger = RunLogger::new("/tmp", 1);
        let entry = logger
            .event_to_entry(&WorkflowEvent::RunStarted {
                run_id: run_id(),
                workflow: "review".into(),
            })
            .unwrap();
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"event_type\":\"run_started\""));
        assert!(json.contains("\"run_id\":\"run-1\""));
        assert!(!json.contains("\"state\""));
    }

    #[test]
    fn test_level_filtering() {
        let entered = WorkflowEvent::StateEntered {
            run_id: run_id(),
            state: "s".into(),
            agent: "a".into(),
            turn: 0,
        };
        let transition = WorkflowEvent::Transition {
            run_id: run_id(),
            from: "s".into(),
            to: None,
            condition: Some("done".into()),
        };

        let l1 = RunLogger::new("/tmp", 1);
        assert!(l1.event_to_entry(&transition).is_none());
        assert!(l1.event_to_entry(&entered).is_none());

        let l2 = RunLogger::new("/tmp", 2);
        assert!(l2.event_to_entry(&transition).is_some());
        assert!(l2.event_to_entry(&entered).is_none());

        let l3 = RunLogger::new("/tmp", 3);
        assert!(l3.event_to_entry(&entered).is_some());
    }

    #[tokio::test]
    async fn test_writes_one_run() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::default();
        let handle = RunLogger::new(dir.path(), 2).spawn(&bus, CancellationToken::new());

        // Events of no run are skipped until one starts.
        bus.publish(WorkflowEvent::ExitTriggered {
            run_id: RunId("stale".into()),
            reason: "old".into(),
        });
        bus.publish(WorkflowEvent::RunStarted {
            run_id: run_id(),
            workflow: "review".into(),
        });
        bus.publish(WorkflowEvent::Transition {
            run_id: run_id(),
            from: "s".into(),
            to: None,
            condition: Some("true".into()),
        });
        bus.publish(WorkflowEvent::RunCompleted {
            run_id: run_id(),
            success: true,
            total_turns: 1,
            error: None,
        });

        let path = handle.await.unwrap().unwrap();
        assert!(path.starts_with(dir.path().join("run-1")));
        let content = std::fs::read_to_string(path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[2].contains("run_completed"));
    }

    #[tokio::test]
    async fn test_concurrent_runs_are_kept_apart() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::default();
        let handle = RunLogger::new(dir.path(), 2).spawn(&bus, CancellationToken::new());

        let a = || RunId("run-a".into());
        let b = || RunId("run-b".into());
        let transition = |run_id: RunId| WorkflowEvent::Transition {
            run_id,
            from: "s".into(),
            to: None,
            condition: None,
        };
        let completed = |run_id: RunId| WorkflowEvent::RunCompleted {
            run_id,
            success: true,
            total_turns: 1,
            error: None,
        };

        bus.publish(WorkflowEvent::RunStarted {
            run_id: a(),
            workflow: "first".into(),
        });
        bus.publish(WorkflowEvent::RunStarted {
            run_id: b(),
            workflow: "second".into(),
        });
        bus.publish(transition(b()));
        bus.publish(completed(b()));
        bus.publish(transition(a()));
        bus.publish(completed(a()));

        let path = handle.await.unwrap().unwrap();
        assert!(path.starts_with(dir.path().join("run-a")));
        let content = std::fs::read_to_string(path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines.iter().all(|l| l.contains("\"run_id\":\"run-a\"")));
        assert!(lines[0].contains("run_started"));
        assert!(lines[1].contains("transition"));
        assert!(lines[2].contains("run_completed"));
    }

    #[tokio::test]
    async fn test_cancel_before_run() {
        let bus = EventBus::default();
        let cancel = CancellationToken::new();
        let handle = RunLogger::new("/tmp/never-created", 1).spawn(&bus, cancel.clone());
        cancel.cancel();
        assert!(handle.await.unwrap().is_none());
    }
}
