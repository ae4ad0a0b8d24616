//! Simulator process supervision.
//!
//! The simulator is a managed subprocess, never an in-process library: crash
//! isolation and restart require owning its lifecycle from the outside. The
//! process handle never leaves this module; everything else sees only
//! [`HealthState`].

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use log::{info, warn};
use tokio::net::TcpListener;
use tokio::process::{Child, Command};

use crate::config::{RenderMode, ServerConfig};
use crate::error::HarnessError;
use crate::sim::client::{SimulatorApi, TcpSimulator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Starting,
    Ready,
    Unresponsive,
    Stopped,
}

/// One launched simulator instance. Owned exclusively by
/// [`ServerLifecycle`]; other components reference the server only through
/// its host:port.
pub struct ServerHandle {
    pub pid: Option<u32>,
    pub port: u16,
    pub launched_at: chrono::DateTime<Utc>,
    pub state: HealthState,
    pub log_path: PathBuf,
    child: Child,
}

pub struct ServerLifecycle {
    config: ServerConfig,
    handle: Option<ServerHandle>,
}

impl ServerLifecycle {
    #[must_use]
    pub const fn new(config: ServerConfig) -> Self {
        Self {
            config,
            handle: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> HealthState {
        self.handle
            .as_ref()
            .map_or(HealthState::Stopped, |h| h.state)
    }

    /// Launches the simulator and waits until it answers a handshake.
    /// Fails with `Launch` when the binary is missing, the port never frees
    /// up, or the server never becomes responsive within the startup
    /// timeout.
    pub async fn start(&mut self) -> Result<(), HarnessError> {
        if self.handle.is_some() {
            return Ok(());
        }
        self.wait_for_free_port().await?;
        self.launch()?;
        self.wait_until_ready().await
    }

    /// Probes liveness with one bounded handshake round-trip.
    pub async fn health_check(&mut self, timeout: Duration) -> HealthState {
        let Some(handle) = self.handle.as_mut() else {
            return HealthState::Stopped;
        };
        // A reaped child cannot be healthy, skip the probe.
        if let Ok(Some(status)) = handle.child.try_wait() {
            warn!("simulator process exited with {status}");
            handle.state = HealthState::Unresponsive;
            return HealthState::Unresponsive;
        }
        let alive = probe_handshake(&self.config.host, handle.port, timeout).await;
        handle.state = if alive {
            HealthState::Ready
        } else {
            HealthState::Unresponsive
        };
        handle.state
    }

    /// Graceful stop, then force-kill after the grace period. Calling it
    /// with no live handle is a no-op.
    pub async fn stop(&mut self) {
        let Some(mut handle) = self.handle.take() else {
            return;
        };
        info!("stopping simulator (pid {:?})", handle.pid);

        if let Some(pid) = handle.pid {
            // SIGTERM first so the server can flush its recorder files.
            let _ = Command::new("kill")
                .arg("-TERM")
                .arg(pid.to_string())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
        }

        let graceful =
            tokio::time::timeout(self.config.shutdown_grace, handle.child.wait()).await;
        if graceful.is_err() {
            warn!("simulator ignored SIGTERM, force-killing");
            let _ = handle.child.kill().await;
            let _ = handle.child.wait().await;
        }
        info!("simulator stopped");
    }

    /// Stop + start. Returns only after the old process has fully exited,
    /// so the fresh instance can rebind the same port.
    pub async fn restart(&mut self) -> Result<(), HarnessError> {
        self.stop().await;
        self.start().await
    }

    async fn wait_for_free_port(&self) -> Result<(), HarnessError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        for attempt in 0..self.config.port_probe_attempts {
            match TcpListener::bind(&addr).await {
                Ok(listener) => {
                    drop(listener);
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "port {addr} still bound (attempt {}/{}): {e}",
                        attempt + 1,
                        self.config.port_probe_attempts
                    );
                    tokio::time::sleep(self.config.port_probe_pause).await;
                }
            }
        }
        Err(HarnessError::Launch(format!(
            "port {addr} still bound after {} probes",
            self.config.port_probe_attempts
        )))
    }

    fn launch(&mut self) -> Result<(), HarnessError> {
        let binary = &self.config.binary;
        if !binary.is_file() {
            return Err(HarnessError::Launch(format!(
                "simulator binary not found at {}",
                binary.display()
            )));
        }

        std::fs::create_dir_all(&self.config.log_dir)?;
        let ts = Utc::now().format("%Y%m%dT%H%M%S");
        let log_path = self
            .config
            .log_dir
            .join(format!("server-{}-{ts}.log", self.config.port));
        let log_file = std::fs::File::create(&log_path)?;
        let log_file_err = log_file.try_clone()?;

        let mut command = Command::new(binary);
        command
            .arg(format!("-carla-rpc-port={}", self.config.port))
            .arg(format!("-quality-level={}", self.config.quality.as_arg()));
        if self.config.render == RenderMode::Offscreen {
            command.arg("-RenderOffScreen");
        }
        let child = command
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_file_err))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HarnessError::Launch(format!("spawning {}: {e}", binary.display())))?;

        info!(
            "simulator launched (pid {:?}, port {}, log {})",
            child.id(),
            self.config.port,
            log_path.display()
        );
        self.handle = Some(ServerHandle {
            pid: child.id(),
            port: self.config.port,
            launched_at: Utc::now(),
            state: HealthState::Starting,
            log_path,
            child,
        });
        Ok(())
    }

    async fn wait_until_ready(&mut self) -> Result<(), HarnessError> {
        let deadline = tokio::time::Instant::now() + self.config.startup_timeout;
        let probe_timeout = Duration::from_secs(2);
        while tokio::time::Instant::now() < deadline {
            if self.health_check(probe_timeout).await == HealthState::Ready {
                return Ok(());
            }
            // A dead child will never answer, bail early with its log path.
            if let Some(handle) = self.handle.as_mut()
                && let Ok(Some(status)) = handle.child.try_wait()
            {
                let log = handle.log_path.display().to_string();
                self.handle = None;
                return Err(HarnessError::Launch(format!(
                    "simulator exited during startup with {status} (see {log})"
                )));
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        self.stop().await;
        Err(HarnessError::Launch(format!(
            "simulator not responsive within {:?}",
            self.config.startup_timeout
        )))
    }
}

/// Lightweight liveness probe: connect and exchange one handshake within
/// `timeout`.
pub async fn probe_handshake(host: &str, port: u16, timeout: Duration) -> bool {
    let probe = async {
        let mut client = TcpSimulator::connect(host, port, timeout).await.ok()?;
        client.handshake().await.ok()
    };
    tokio::time::timeout(timeout, probe)
        .await
        .ok()
        .flatten()
        .is_some()
}
