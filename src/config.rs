use std::path::PathBuf;
use std::time::Duration;

use crate::backoff::BackoffPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RenderMode {
    /// Render off-screen (batch default; no window, no GPU vsync stalls)
    Offscreen,
    /// Render to a visible window
    Windowed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum QualityLevel {
    Low,
    Epic,
}

impl QualityLevel {
    #[must_use]
    pub const fn as_arg(self) -> &'static str {
        match self {
            Self::Low => "Low",
            Self::Epic => "Epic",
        }
    }
}

/// Everything needed to launch and supervise one simulator server process.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub binary: PathBuf,
    pub host: String,
    pub port: u16,
    pub render: RenderMode,
    pub quality: QualityLevel,
    /// Directory for per-instance server log files.
    pub log_dir: PathBuf,
    /// Attempts to wait for the RPC port to free up before launch.
    pub port_probe_attempts: u32,
    pub port_probe_pause: Duration,
    /// Upper bound on waiting for the server to answer its first handshake.
    pub startup_timeout: Duration,
    /// How long stop() waits after SIGTERM before force-killing.
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("CarlaUE4.sh"),
            host: "localhost".to_string(),
            port: 2000,
            render: RenderMode::Offscreen,
            quality: QualityLevel::Low,
            log_dir: PathBuf::from("target/server-logs"),
            port_probe_attempts: 5,
            port_probe_pause: Duration::from_secs(3),
            startup_timeout: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Session negotiation: deterministic stepping plus connect/RPC bounds.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Simulated seconds per tick. 100 fps => 0.01.
    pub fixed_delta_seconds: f64,
    /// Always on for batch runs; exposed for one-off debugging sessions.
    pub synchronous: bool,
    /// Bound on every RPC round-trip, ticks included.
    pub rpc_timeout: Duration,
    pub connect_retries: u32,
    pub connect_backoff: BackoffPolicy,
}

impl SessionConfig {
    #[must_use]
    pub fn with_fps(fps: f64) -> Self {
        Self {
            fixed_delta_seconds: 1.0 / fps,
            ..Self::default()
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            fixed_delta_seconds: 0.01,
            synchronous: true,
            rpc_timeout: Duration::from_secs(20),
            connect_retries: 3,
            connect_backoff: BackoffPolicy::default(),
        }
    }
}

/// Per-scenario run policy: budgets and termination tuning.
#[derive(Debug, Clone)]
pub struct RunPolicy {
    /// Frame budget used when a descriptor does not carry its own.
    pub default_timeout_frames: u64,
    /// Transient tick failures retried in place before the attempt aborts.
    pub step_retry_limit: u32,
    /// Sim-seconds of sub-epsilon movement before the ego counts as stuck.
    pub stuck_window_secs: f64,
    /// Movement below this many meters per tick counts as no progress.
    pub stuck_epsilon: f64,
}

impl Default for RunPolicy {
    fn default() -> Self {
        Self {
            default_timeout_frames: 18_000,
            step_retry_limit: 2,
            stuck_window_secs: 2.0,
            stuck_epsilon: 0.1,
        }
    }
}

/// Batch-level knobs.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub dataset: PathBuf,
    pub outcomes: PathBuf,
    pub recording_dir: PathBuf,
    pub resume: bool,
    /// Server restarts tolerated across the whole batch before FatalAbort.
    pub restart_ceiling: u32,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            dataset: PathBuf::from("dataset.json"),
            outcomes: PathBuf::from("outcomes.jsonl"),
            recording_dir: PathBuf::from("recordings"),
            resume: true,
            restart_ceiling: 3,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HarnessConfig {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub run: RunPolicy,
    pub batch: BatchConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_fps_derives_fixed_delta() {
        let cfg = SessionConfig::with_fps(100.0);
        assert!((cfg.fixed_delta_seconds - 0.01).abs() < 1e-12);
        assert!(cfg.synchronous);
    }

    #[test]
    fn quality_maps_to_launch_arg() {
        assert_eq!(QualityLevel::Low.as_arg(), "Low");
        assert_eq!(QualityLevel::Epic.as_arg(), "Epic");
    }
}
