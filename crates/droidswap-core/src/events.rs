//! Events emitted while a run invocation progresses

use serde::Serialize;

use crate::types::ResolutionAction;

/// Which console stream a line belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleStream {
    Stdout,
    Stderr,
}

/// Notification severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Info,
    Error,
}

/// Events produced by launch tasks and the orchestrator.
///
/// Consumers (CLI printer, headless NDJSON writer, tests) receive these over
/// an unbounded channel; sending never blocks a running task.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LaunchEvent {
    /// A task of the run sequence started
    TaskStarted { task_id: String, description: String },

    /// A task of the run sequence finished
    TaskFinished { task_id: String, success: bool },

    /// Progress over the whole run, in `[0.0, 1.0]`
    Progress { fraction: f64 },

    /// A line for the run console
    Console { stream: ConsoleStream, text: String },

    /// Non-modal notification (balloon)
    Notification {
        kind: NotificationKind,
        title: String,
        text: String,
        resolution: Option<ResolutionAction>,
    },
}

impl LaunchEvent {
    pub fn stdout(text: impl Into<String>) -> Self {
        LaunchEvent::Console {
            stream: ConsoleStream::Stdout,
            text: text.into(),
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        LaunchEvent::Console {
            stream: ConsoleStream::Stderr,
            text: text.into(),
        }
    }

    pub fn info(title: impl Into<String>, text: impl Into<String>) -> Self {
        LaunchEvent::Notification {
            kind: NotificationKind::Info,
            title: title.into(),
            text: text.into(),
            resolution: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_event_serialization() {
        let json = serde_json::to_string(&LaunchEvent::stderr("boom")).unwrap();
        assert_eq!(
            json,
            r#"{"event":"console","stream":"stderr","text":"boom"}"#
        );
    }

    #[test]
    fn test_notification_constructor() {
        let event = LaunchEvent::info("Deploy", "done");
        assert!(matches!(
            event,
            LaunchEvent::Notification {
                kind: NotificationKind::Info,
                resolution: None,
                ..
            }
        ));
    }
}
