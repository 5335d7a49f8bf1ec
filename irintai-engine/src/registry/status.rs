//! Model status and its transition table

use serde::{Deserialize, Serialize};

/// Lifecycle status of a model as seen by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    NotInstalled,
    Installing,
    Installed,
    Loading,
    Running,
    Generating,
    Uninstalling,
    Error,
}

impl ModelStatus {
    /// Statuses reachable from `self`.
    pub fn allowed_targets(self) -> &'static [ModelStatus] {
        use ModelStatus::*;
        match self {
            NotInstalled => &[Installing, Installed, NotInstalled, Error],
            Installing => &[Installed, Error],
            Installed => &[
                Installing,
                Loading,
                Uninstalling,
                Installed,
                NotInstalled,
                Error,
            ],
            Loading => &[Running, Installed, Error],
            Running => &[Generating, Running, Installed, Error],
            Generating => &[Running, Installed, Error],
            Uninstalling => &[NotInstalled, Error],
            Error => &[
                Installing,
                Installed,
                Loading,
                Uninstalling,
                NotInstalled,
                Error,
            ],
        }
    }

    pub fn can_transition_to(self, next: ModelStatus) -> bool {
        self.allowed_targets().contains(&next)
    }

    /// Whether a process for this model is alive and serving.
    pub fn is_active(self) -> bool {
        matches!(self, ModelStatus::Running | ModelStatus::Generating)
    }

    /// Whether an install/uninstall job currently owns the model.
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            ModelStatus::Installing | ModelStatus::Uninstalling | ModelStatus::Loading
        )
    }
}

impl std::fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::NotInstalled => "Not Installed",
            Self::Installing => "Installing...",
            Self::Installed => "Installed",
            Self::Loading => "Loading...",
            Self::Running => "Running",
            Self::Generating => "Generating...",
            Self::Uninstalling => "Uninstalling...",
            Self::Error => "Error",
        };
        f.write_str(label)
    }
}
