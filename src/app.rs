use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::AppConfig;
use crate::connection::ConnectParams;
use crate::connection::ConnectionInfo;
use crate::connection::ConnectionStatus;
use crate::connection::Throughput;
use crate::connection::VpnConnection;
use crate::credentials::CredentialStore;
use crate::credentials::Credentials;
use crate::error::Result;
use crate::error::VpnError;
use crate::metrics::MetricsSample;
use crate::metrics::NetworkMetrics;
use crate::protocol::Protocol;
use crate::retry::RetryPolicy;

const MONITOR_JOIN_BUDGET: Duration = Duration::from_secs(2);

type SharedConnection = Arc<Mutex<Box<dyn VpnConnection>>>;

struct Monitor {
    stop_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Monitor {
    async fn stop(self) {
        let _ = self.stop_tx.send(true);
        for mut task in self.tasks {
            if tokio::time::timeout(MONITOR_JOIN_BUDGET, &mut task)
                .await
                .is_err()
            {
                debug!("Monitor task did not stop in time, aborting");
                task.abort();
            }
        }
    }
}

/// Owns the active connection, its monitor and the credential store.
pub struct VpnClientApp {
    config: AppConfig,
    store: Box<dyn CredentialStore>,
    metrics: NetworkMetrics,
    connection: Option<SharedConnection>,
    status_rx: Option<watch::Receiver<ConnectionStatus>>,
    monitor: Option<Monitor>,
    latest_sample: Arc<StdMutex<Option<MetricsSample>>>,
}

impl VpnClientApp {
    pub fn new(config: AppConfig) -> Self {
        let store = crate::credentials::open_store(&config.credentials);
        Self::with_store(config, store)
    }

    pub fn with_store(config: AppConfig, store: Box<dyn CredentialStore>) -> Self {
        let metrics = NetworkMetrics::from_config(&config.metrics);
        Self {
            config,
            store,
            metrics,
            connection: None,
            status_rx: None,
            monitor: None,
            latest_sample: Arc::new(StdMutex::new(None)),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn metrics(&self) -> &NetworkMetrics {
        &self.metrics
    }

    pub fn credential_store(&self) -> &dyn CredentialStore {
        self.store.as_ref()
    }

    pub async fn connect(&mut self, protocol: Protocol, params: ConnectParams) -> Result<()> {
        let connection = crate::protocols::create_connection(protocol, &self.config)?;
        self.connect_with(connection, params).await
    }

    /// Connects through an already constructed backend.
    pub async fn connect_with(
        &mut self,
        mut connection: Box<dyn VpnConnection>,
        params: ConnectParams,
    ) -> Result<()> {
        if self.status().is_active() {
            info!("Disconnecting the current connection first");
            if let Err(e) = self.disconnect().await {
                warn!("Failed to disconnect the previous connection: {}", e);
            }
        } else {
            self.stop_monitor().await;
        }

        let protocol = connection.protocol();
        let status_rx = connection.subscribe();
        let result = connection.connect(&params).await;

        let shared: SharedConnection = Arc::new(Mutex::new(connection));
        self.connection = Some(shared.clone());
        self.status_rx = Some(status_rx.clone());

        if let Err(e) = result {
            error!("{} connection failed: {}", protocol, e);
            return Err(e);
        }

        self.start_monitor(shared, params, status_rx);
        Ok(())
    }

    pub async fn disconnect(&mut self) -> Result<()> {
        self.stop_monitor().await;

        let Some(connection) = self.connection.clone() else {
            return Err(VpnError::InvalidState(ConnectionStatus::Disconnected));
        };
        let mut connection = connection.lock().await;
        connection.disconnect().await
    }

    pub fn status(&self) -> ConnectionStatus {
        match &self.status_rx {
            Some(rx) => *rx.borrow(),
            None => ConnectionStatus::Disconnected,
        }
    }

    pub fn subscribe(&self) -> Option<watch::Receiver<ConnectionStatus>> {
        self.status_rx.clone()
    }

    /// True while the status watcher may still redial the connection.
    pub fn is_monitoring(&self) -> bool {
        self.monitor
            .as_ref()
            .and_then(|m| m.tasks.first())
            .is_some_and(|task| !task.is_finished())
    }

    pub async fn protocol(&self) -> Option<Protocol> {
        let connection = self.connection.as_ref()?;
        Some(connection.lock().await.protocol())
    }

    pub async fn connection_info(&self) -> Option<ConnectionInfo> {
        let connection = self.connection.as_ref()?;
        connection.lock().await.connection_info()
    }

    pub async fn last_error(&self) -> Option<String> {
        let connection = self.connection.as_ref()?;
        connection.lock().await.last_error()
    }

    pub async fn test_latency(&self) -> Option<f64> {
        let connection = self.connection.as_ref()?;
        connection.lock().await.test_latency().await
    }

    pub async fn test_throughput(&self) -> Throughput {
        match &self.connection {
            Some(connection) => connection.lock().await.test_throughput().await,
            None => Throughput::default(),
        }
    }

    /// Most recent background measurement of the active connection.
    pub fn latest_metrics(&self) -> Option<MetricsSample> {
        self.latest_sample
            .lock()
            .map(|sample| sample.clone())
            .unwrap_or_default()
    }

    pub fn save_credentials(&self, service: &str, creds: &Credentials) -> Result<()> {
        self.store.store(service, creds)?;
        info!("Saved credentials for {} ({})", service, self.store.name());
        Ok(())
    }

    pub fn load_credentials(&self, service: &str) -> Result<Option<Credentials>> {
        Ok(self.store.retrieve(service)?)
    }

    pub fn delete_credentials(&self, service: &str) -> Result<bool> {
        Ok(self.store.delete(service)?)
    }

    /// Disconnects when a session is still active.
    pub async fn shutdown(&mut self) {
        if self.status().is_active()
            && let Err(e) = self.disconnect().await
        {
            warn!("Disconnect during shutdown failed: {}", e);
        }
        self.stop_monitor().await;
    }

    async fn stop_monitor(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.stop().await;
        }
    }

    fn start_monitor(
        &mut self,
        connection: SharedConnection,
        params: ConnectParams,
        status_rx: watch::Receiver<ConnectionStatus>,
    ) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let policy = self
            .config
            .reconnect
            .enabled
            .then(|| self.config.reconnect.policy());

        let mut tasks = vec![tokio::spawn(watch_connection(
            connection,
            params.clone(),
            status_rx,
            policy,
            stop_rx.clone(),
        ))];

        if let Some(server) = params.server.filter(|s| !s.trim().is_empty()) {
            let mut metrics = self.metrics.clone();
            metrics.set_target_host(server.trim());
            let interval = Duration::from_secs(self.config.metrics.monitor_interval_secs.max(1));
            let (sample_tx, sample_rx) = mpsc::channel(8);

            tasks.push(tokio::spawn(async move {
                metrics.monitor(interval, sample_tx, stop_rx).await;
            }));
            tasks.push(tokio::spawn(keep_latest(
                sample_rx,
                self.latest_sample.clone(),
            )));
        }

        self.monitor = Some(Monitor { stop_tx, tasks });
    }
}

async fn keep_latest(
    mut samples: mpsc::Receiver<MetricsSample>,
    latest: Arc<StdMutex<Option<MetricsSample>>>,
) {
    while let Some(sample) = samples.recv().await {
        if let Some(latency) = &sample.latency {
            debug!("Latency avg {:.1} ms, jitter {:.1} ms", latency.avg, latency.jitter);
        }
        if let Ok(mut slot) = latest.lock() {
            *slot = Some(sample);
        }
    }
}

/// Follows status changes and re-dials a dropped connection per `policy`.
async fn watch_connection(
    connection: SharedConnection,
    params: ConnectParams,
    mut status: watch::Receiver<ConnectionStatus>,
    policy: Option<RetryPolicy>,
    mut stop: watch::Receiver<bool>,
) {
    let mut watching = *status.borrow() == ConnectionStatus::Connected;
    let mut attempt: u32 = 0;

    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = stop.changed() => return,
        }

        let current = *status.borrow_and_update();
        match current {
            ConnectionStatus::Connected => {
                if attempt > 0 {
                    info!("Reconnected after {} attempt(s)", attempt);
                }
                watching = true;
                attempt = 0;
            }
            ConnectionStatus::Error => {
                warn!("Connection entered the error state, monitoring stopped");
                return;
            }
            ConnectionStatus::Disconnected if watching => {
                let Some(policy) = &policy else {
                    warn!("Connection was lost");
                    return;
                };
                if attempt == 0 {
                    warn!("Connection was lost");
                }

                if !redial(&connection, &params, policy, &mut attempt, &mut stop).await {
                    return;
                }
            }
            ConnectionStatus::Disconnected => {
                debug!("Backend ended before the tunnel came up");
                return;
            }
            _ => {}
        }
    }
}

/// Returns true once a reconnect attempt was launched.
async fn redial(
    connection: &SharedConnection,
    params: &ConnectParams,
    policy: &RetryPolicy,
    attempt: &mut u32,
    stop: &mut watch::Receiver<bool>,
) -> bool {
    while policy.should_retry(*attempt) {
        let delay = policy.delay_for_attempt(*attempt);
        *attempt += 1;
        info!("Reconnect attempt {} in {:?}", attempt, delay);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop.changed() => return false,
        }

        let mut connection = connection.lock().await;
        match connection.connect(params).await {
            Ok(()) => return true,
            Err(e) => warn!("Reconnect attempt {} failed: {}", attempt, e),
        }
    }

    error!("Giving up after {} reconnect attempt(s)", attempt);
    false
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use async_trait::async_trait;

    use super::*;
    use crate::config::MaxAttempts;
    use crate::connection::SharedState;
    use crate::credentials::FileStore;

    /// Connects instantly; the test drives drops through the shared state.
    struct FakeConnection {
        state: Arc<SharedState>,
        metrics: NetworkMetrics,
        connects: Arc<AtomicUsize>,
        fail: bool,
    }

    impl FakeConnection {
        fn new(fail: bool) -> (Self, Arc<SharedState>, Arc<AtomicUsize>) {
            let state = Arc::new(SharedState::new());
            let connects = Arc::new(AtomicUsize::new(0));
            let conn = Self {
                state: state.clone(),
                metrics: NetworkMetrics::default(),
                connects: connects.clone(),
                fail,
            };
            (conn, state, connects)
        }
    }

    #[async_trait]
    impl VpnConnection for FakeConnection {
        fn protocol(&self) -> Protocol {
            Protocol::OpenVpn
        }

        fn state(&self) -> &SharedState {
            &self.state
        }

        fn metrics(&self) -> &NetworkMetrics {
            &self.metrics
        }

        async fn connect(&mut self, _params: &ConnectParams) -> Result<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.state.begin_connect()?;
            if self.fail {
                self.state.fail("refused");
                return Err(VpnError::Connection("refused".into()));
            }
            let mut info = ConnectionInfo::new(Protocol::OpenVpn);
            info.server_ip = Some("127.0.0.1".parse().unwrap());
            self.state.set_info(info);
            self.state.set_status(ConnectionStatus::Connected);
            Ok(())
        }

        async fn disconnect(&mut self) -> Result<()> {
            self.state.begin_disconnect()?;
            self.state.finish_disconnect();
            Ok(())
        }
    }

    fn app(reconnect: bool) -> (VpnClientApp, tempfile::TempDir) {
        let temp = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.reconnect.enabled = reconnect;
        config.reconnect.initial_delay_ms = 10;
        config.reconnect.max_attempts = MaxAttempts::Count(2);
        let store = Box::new(FileStore::new(temp.path()));
        (VpnClientApp::with_store(config, store), temp)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_status_without_connection() {
        let (mut app, _temp) = app(false);
        assert_eq!(app.status(), ConnectionStatus::Disconnected);
        assert!(app.connection_info().await.is_none());
        assert_eq!(app.test_throughput().await, Throughput::default());
        assert!(matches!(
            app.disconnect().await,
            Err(VpnError::InvalidState(ConnectionStatus::Disconnected))
        ));
    }

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let (mut app, _temp) = app(false);
        let (conn, _state, connects) = FakeConnection::new(false);

        app.connect_with(Box::new(conn), ConnectParams::default())
            .await
            .unwrap();
        assert_eq!(app.status(), ConnectionStatus::Connected);
        assert_eq!(app.protocol().await, Some(Protocol::OpenVpn));
        assert!(app.connection_info().await.is_some());
        assert_eq!(connects.load(Ordering::SeqCst), 1);

        app.disconnect().await.unwrap();
        assert_eq!(app.status(), ConnectionStatus::Disconnected);
        assert!(app.connection_info().await.is_none());
    }

    #[tokio::test]
    async fn test_connect_replaces_active_connection() {
        let (mut app, _temp) = app(false);
        let (first, first_state, _) = FakeConnection::new(false);
        let (second, _, _) = FakeConnection::new(false);

        app.connect_with(Box::new(first), ConnectParams::default())
            .await
            .unwrap();
        app.connect_with(Box::new(second), ConnectParams::default())
            .await
            .unwrap();

        assert_eq!(first_state.status(), ConnectionStatus::Disconnected);
        assert_eq!(app.status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_failed_connect_reports_error() {
        let (mut app, _temp) = app(false);
        let (conn, _, _) = FakeConnection::new(true);

        let err = app
            .connect_with(Box::new(conn), ConnectParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, VpnError::Connection(_)));
        assert_eq!(app.status(), ConnectionStatus::Error);
        assert_eq!(app.last_error().await.as_deref(), Some("refused"));
    }

    #[tokio::test]
    async fn test_lost_connection_is_redialed() {
        let (mut app, _temp) = app(true);
        let (conn, state, connects) = FakeConnection::new(false);

        app.connect_with(Box::new(conn), ConnectParams::default())
            .await
            .unwrap();

        state.finish_disconnect();
        wait_until(|| connects.load(Ordering::SeqCst) == 2).await;
        wait_until(|| state.status() == ConnectionStatus::Connected).await;

        app.disconnect().await.unwrap();
        assert_eq!(app.status(), ConnectionStatus::Disconnected);
        assert_eq!(connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_lost_connection_without_reconnect() {
        let (mut app, _temp) = app(false);
        let (conn, state, connects) = FakeConnection::new(false);

        app.connect_with(Box::new(conn), ConnectParams::default())
            .await
            .unwrap();
        state.finish_disconnect();

        wait_until(|| !app.is_monitoring()).await;
        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert_eq!(app.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_credentials_round_trip_through_app() {
        let (app, _temp) = app(false);
        let creds = Credentials::new("alice", "pw");

        app.save_credentials("office", &creds).unwrap();
        assert_eq!(app.load_credentials("office").unwrap(), Some(creds));
        assert!(app.delete_credentials("office").unwrap());
        assert_eq!(app.load_credentials("office").unwrap(), None);

        let err = app
            .save_credentials("", &Credentials::new("a", "b"))
            .unwrap_err();
        assert!(matches!(err, VpnError::CredentialStorage(_)));
    }
}
