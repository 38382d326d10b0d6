use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use super::scrape::OutputScraper;
use super::supervisor::Supervisor;
use super::supervisor::SupervisorOptions;
use crate::connection::ConnectParams;
use crate::connection::SharedState;
use crate::connection::VpnConnection;
use crate::error::Result;
use crate::error::VpnError;
use crate::metrics::NetworkMetrics;
use crate::protocol::Protocol;

/// Builds the command line for one subprocess backend.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Files that must outlive the process (rendered configs, secrets).
    type Resources: Send + Sync;

    fn protocol(&self) -> Protocol;

    fn scraper(&self) -> Arc<dyn OutputScraper>;

    fn prepare(&self, params: &ConnectParams) -> Result<(Command, Self::Resources)>;

    /// Runs once the process is up, e.g. to send a dial request.
    async fn after_spawn(&self, _resources: &Self::Resources) -> Result<()> {
        Ok(())
    }
}

struct Session<R> {
    supervisor: Supervisor,
    resources: R,
}

pub struct ProcessConnection<L: ProcessLauncher> {
    launcher: L,
    state: Arc<SharedState>,
    metrics: NetworkMetrics,
    options: SupervisorOptions,
    session: Option<Session<L::Resources>>,
}

impl<L: ProcessLauncher> ProcessConnection<L> {
    pub fn new(launcher: L, metrics: NetworkMetrics, options: SupervisorOptions) -> Self {
        Self {
            launcher,
            state: Arc::new(SharedState::new()),
            metrics,
            options,
            session: None,
        }
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    pub fn pid(&self) -> Option<u32> {
        self.session.as_ref().and_then(|s| s.supervisor.pid())
    }

    async fn close_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.supervisor.stop().await;
            drop(session.resources);
        }
    }

    async fn start(&mut self, params: &ConnectParams) -> Result<()> {
        let (command, resources) = self.launcher.prepare(params)?;
        let supervisor = Supervisor::launch(
            self.launcher.protocol(),
            command,
            self.launcher.scraper(),
            self.state.clone(),
            self.options,
        )?;
        self.session = Some(Session {
            supervisor,
            resources,
        });

        let dialed = match &self.session {
            Some(session) => self.launcher.after_spawn(&session.resources).await,
            None => Ok(()),
        };
        if let Err(e) = dialed {
            self.close_session().await;
            return Err(e);
        }
        Ok(())
    }
}

#[async_trait]
impl<L: ProcessLauncher> VpnConnection for ProcessConnection<L> {
    fn protocol(&self) -> Protocol {
        self.launcher.protocol()
    }

    fn state(&self) -> &SharedState {
        &self.state
    }

    fn metrics(&self) -> &NetworkMetrics {
        &self.metrics
    }

    async fn connect(&mut self, params: &ConnectParams) -> Result<()> {
        let protocol = self.launcher.protocol();
        params.validate(protocol)?;

        let current = self.state.status();
        if current.is_active() {
            return Err(VpnError::InvalidState(current));
        }
        // A previous attempt may have left an exited process behind.
        self.close_session().await;

        self.state.begin_connect()?;
        if let Some(server) = &params.server {
            self.metrics.set_target_host(server.clone());
        }

        info!("Connecting via {}", protocol);
        if let Err(e) = self.start(params).await {
            self.state.fail(e.to_string());
            return Err(e);
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Err(e) = self.state.begin_disconnect() {
            // Reap whatever a dropped or failed backend left behind.
            self.close_session().await;
            return Err(e);
        }
        self.close_session().await;
        self.state.finish_disconnect();
        info!("{} disconnected", self.launcher.protocol());
        Ok(())
    }
}
