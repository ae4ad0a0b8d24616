use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Harness-level failures. Scenario-level variants are converted into an
/// [`TerminalCause`] by the executor; server-level variants surface to the
/// orchestrator for bounded recovery.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("simulator failed to launch: {0}")]
    Launch(String),

    #[error("connection handshake failed after {attempts} attempts: {last}")]
    Connection { attempts: u32, last: String },

    #[error("scenario setup failed: {0}")]
    Setup(String),

    #[error("invalid scenario descriptor '{id}': {reason}")]
    InvalidScenario { id: String, reason: String },

    #[error("timed out after {timeout:?} waiting for {waiting_for}")]
    TimedOut {
        timeout: Duration,
        waiting_for: String,
    },

    #[error("simulator crashed mid-scenario: {0}")]
    ServerCrashed(String),

    #[error("simulator protocol error: {0}")]
    Protocol(String),

    #[error("restart ceiling of {ceiling} exceeded while recovering scenario '{scenario}'")]
    FatalAbort { ceiling: u32, scenario: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Recording decode failures.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("corrupt recording: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The classified reason a scenario attempt ended. Persisted verbatim in the
/// outcome store, so variants are never renamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalCause {
    GoalReached,
    Collision,
    TimedOut,
    Stuck,
    ActorLost,
    ScenarioFailed,
    InvalidScenario,
    SetupFailed,
    ConnectionFailed,
    ServerCrashed,
    Aborted,
}

impl TerminalCause {
    /// Only a reached goal counts for resume skipping; everything else is
    /// re-attempted on the next batch run.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::GoalReached)
    }

    /// Causes that indict the server rather than the scenario content. These
    /// charge the orchestrator's restart counter.
    #[must_use]
    pub const fn is_server_failure(self) -> bool {
        matches!(self, Self::ConnectionFailed | Self::ServerCrashed)
    }

    #[must_use]
    pub const fn describe(self) -> &'static str {
        match self {
            Self::GoalReached => "ego reached the scenario goal",
            Self::Collision => "collision detected",
            Self::TimedOut => "frame budget exhausted",
            Self::Stuck => "ego stopped making progress",
            Self::ActorLost => "ego despawned or fell through the map",
            Self::ScenarioFailed => "scenario logic reported failure",
            Self::InvalidScenario => "descriptor failed validation",
            Self::SetupFailed => "map load or actor spawn failed",
            Self::ConnectionFailed => "session handshake exhausted retries",
            Self::ServerCrashed => "simulator process died mid-run",
            Self::Aborted => "batch stop requested",
        }
    }
}

impl std::fmt::Display for TerminalCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.describe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_goal_reached_is_success() {
        assert!(TerminalCause::GoalReached.is_success());
        for cause in [
            TerminalCause::Collision,
            TerminalCause::TimedOut,
            TerminalCause::Stuck,
            TerminalCause::ServerCrashed,
            TerminalCause::Aborted,
        ] {
            assert!(!cause.is_success(), "{cause} must not count as success");
        }
    }

    #[test]
    fn server_failures_are_connection_and_crash() {
        assert!(TerminalCause::ConnectionFailed.is_server_failure());
        assert!(TerminalCause::ServerCrashed.is_server_failure());
        assert!(!TerminalCause::SetupFailed.is_server_failure());
        assert!(!TerminalCause::TimedOut.is_server_failure());
    }

    #[test]
    fn cause_serializes_snake_case() {
        let json = serde_json::to_string(&TerminalCause::GoalReached).unwrap();
        assert_eq!(json, "\"goal_reached\"");
        let back: TerminalCause = serde_json::from_str("\"server_crashed\"").unwrap();
        assert_eq!(back, TerminalCause::ServerCrashed);
    }

    #[test]
    fn harness_errors_render_their_context() {
        let err = HarnessError::Connection {
            attempts: 3,
            last: "refused".into(),
        };
        assert!(err.to_string().contains("after 3 attempts"));
        let err = HarnessError::FatalAbort {
            ceiling: 2,
            scenario: "s1".into(),
        };
        assert!(err.to_string().contains("restart ceiling of 2"));
    }
}
