//! Process lifecycle events

use serde::{Deserialize, Serialize};

/// Events published by the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessEvent {
    /// A model process was spawned
    Started {
        model: String,
        generation: u64,
        pid: Option<u32>,
    },
    /// A cleaned line of engine output
    Output { generation: u64, line: String },
    /// A crashed process was respawned
    Restarted {
        model: String,
        generation: u64,
        attempt: u32,
    },
    /// The model was stopped, or its process ended outside of a run
    Stopped { model: String },
    /// Spawning failed or recovery gave up
    Error { model: String, message: String },
}

impl ProcessEvent {
    /// Short event kind, as used by UI callbacks.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::Output { .. } => "output",
            Self::Restarted { .. } => "restarted",
            Self::Stopped { .. } => "stopped",
            Self::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kinds() {
        let stopped = ProcessEvent::Stopped {
            model: "llama2".to_string(),
        };
        let error = ProcessEvent::Error {
            model: "llama2".to_string(),
            message: "unstable".to_string(),
        };
        assert_eq!(stopped.kind(), "stopped");
        assert_eq!(error.kind(), "error");
    }

    #[test]
    fn event_serialization_is_tagged() {
        let event = ProcessEvent::Restarted {
            model: "llama2".to_string(),
            generation: 4,
            attempt: 2,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"restarted\""));
        let parsed: ProcessEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }
}
