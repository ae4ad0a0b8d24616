//! Session establishment with bounded retry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};

use crate::backoff::{BackoffPolicy, Clock, SystemClock};
use crate::config::SessionConfig;
use crate::error::HarnessError;
use crate::sim::client::{SimulatorApi, TcpSimulator};

/// Negotiated stepping settings, recorded on the session once applied.
#[derive(Debug, Clone, Copy)]
pub struct StepSettings {
    pub fixed_delta_seconds: f64,
    pub synchronous: bool,
}

/// A live connection plus its negotiated settings. Valid only while the
/// server behind it is up; [`Session::close`] is safe to call repeatedly.
pub struct Session {
    api: Option<Box<dyn SimulatorApi>>,
    pub server_version: String,
    pub settings: Option<StepSettings>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("open", &self.is_open())
            .field("server_version", &self.server_version)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Session {
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.api.is_some()
    }

    pub fn api(&mut self) -> Result<&mut (dyn SimulatorApi + '_), HarnessError> {
        match self.api.as_deref_mut() {
            Some(api) => Ok(api),
            None => Err(HarnessError::Protocol(
                "session already disconnected".to_string(),
            )),
        }
    }

    pub fn close(&mut self) {
        if self.api.take().is_some() {
            info!("session disconnected");
        }
    }
}

/// Seam between retry policy and the actual transport: production opens a
/// TCP connection, tests script refusals.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self) -> Result<Box<dyn SimulatorApi>, HarnessError>;
}

pub struct TcpConnector {
    pub host: String,
    pub port: u16,
    pub rpc_timeout: Duration,
}

#[async_trait]
impl Connector for TcpConnector {
    async fn open(&self) -> Result<Box<dyn SimulatorApi>, HarnessError> {
        let client = TcpSimulator::connect(&self.host, self.port, self.rpc_timeout).await?;
        Ok(Box::new(client))
    }
}

pub struct ConnectionManager {
    connector: Box<dyn Connector>,
    retries: u32,
    backoff: BackoffPolicy,
    clock: Arc<dyn Clock>,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(host: &str, port: u16, config: &SessionConfig) -> Self {
        Self::with_connector(
            Box::new(TcpConnector {
                host: host.to_string(),
                port,
                rpc_timeout: config.rpc_timeout,
            }),
            config.connect_retries,
            config.connect_backoff.clone(),
            Arc::new(SystemClock),
        )
    }

    #[must_use]
    pub fn with_connector(
        connector: Box<dyn Connector>,
        retries: u32,
        backoff: BackoffPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            connector,
            retries: retries.max(1),
            backoff,
            clock,
        }
    }

    /// Attempts up to `retries` handshakes, sleeping the backoff delay
    /// between failures. Never makes an extra attempt after the last one.
    pub async fn connect(&self) -> Result<Session, HarnessError> {
        let mut last = String::new();
        for attempt in 0..self.retries {
            match self.try_once().await {
                Ok(session) => {
                    info!(
                        "connected on attempt {}/{} (server {})",
                        attempt + 1,
                        self.retries,
                        session.server_version
                    );
                    return Ok(session);
                }
                Err(e) => {
                    warn!(
                        "handshake attempt {}/{} failed: {e}",
                        attempt + 1,
                        self.retries
                    );
                    last = e.to_string();
                    if attempt + 1 < self.retries {
                        self.clock.sleep(self.backoff.delay_for(attempt)).await;
                    }
                }
            }
        }
        Err(HarnessError::Connection {
            attempts: self.retries,
            last,
        })
    }

    async fn try_once(&self) -> Result<Session, HarnessError> {
        let mut api = self.connector.open().await?;
        let server_version = api.handshake().await?;
        Ok(Session {
            api: Some(api),
            server_version,
            settings: None,
        })
    }

    /// Applies deterministic stepping to a fresh session. Without
    /// synchronous mode scenario outcomes depend on host load, so batch runs
    /// never skip this.
    pub async fn configure(
        &self,
        session: &mut Session,
        fixed_delta_seconds: f64,
        synchronous: bool,
        no_rendering: bool,
    ) -> Result<(), HarnessError> {
        session
            .api()?
            .apply_settings(fixed_delta_seconds, synchronous, no_rendering)
            .await?;
        session.settings = Some(StepSettings {
            fixed_delta_seconds,
            synchronous,
        });
        Ok(())
    }

    /// Releases the session. Calling it on an already-closed session is a
    /// no-op.
    pub fn disconnect(&self, session: &mut Session) {
        session.close();
    }
}
