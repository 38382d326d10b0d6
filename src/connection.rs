//! Protocol-independent connection interface.
//!
//! Every backend wraps an external program or OS dialer. The backend owns a
//! [`SharedState`] that its watcher task updates from scraped output, and
//! callers observe transitions through [`VpnConnection::subscribe`].

use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;
use std::time::SystemTime;

use async_trait::async_trait;
use ipnet::IpNet;
use serde::Serialize;
use tokio::sync::watch;

use crate::error::Result;
use crate::error::VpnError;
use crate::metrics::NetworkMetrics;
use crate::protocol::Protocol;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Error,
}

impl ConnectionStatus {
    pub fn name(self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "DISCONNECTED",
            ConnectionStatus::Connecting => "CONNECTING",
            ConnectionStatus::Connected => "CONNECTED",
            ConnectionStatus::Disconnecting => "DISCONNECTING",
            ConnectionStatus::Error => "ERROR",
        }
    }

    /// Connected or on the way there.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ConnectionStatus::Connected | ConnectionStatus::Connecting
        )
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub protocol: Protocol,
    pub assigned_ip: Option<IpAddr>,
    pub assigned_network: Option<IpNet>,
    pub server_ip: Option<IpAddr>,
    pub interface: Option<String>,
    pub connected_since: SystemTime,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl ConnectionInfo {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            assigned_ip: None,
            assigned_network: None,
            server_ip: None,
            interface: None,
            connected_since: SystemTime::now(),
            bytes_sent: 0,
            bytes_received: 0,
        }
    }

    pub fn uptime(&self) -> Duration {
        self.connected_since.elapsed().unwrap_or_default()
    }

    /// Re-reads the interface byte counters when the OS exposes them.
    pub fn refresh_counters(&mut self) {
        if let Some(iface) = &self.interface
            && let Some((sent, received)) = crate::netinfo::interface_counters(iface)
        {
            self.bytes_sent = sent;
            self.bytes_received = received;
        }
    }
}

/// Formats a duration as `HH:MM:SS`.
pub fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    let (minutes, seconds) = (secs / 60, secs % 60);
    let (hours, minutes) = (minutes / 60, minutes % 60);
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Throughput {
    pub download_mbps: f64,
    pub upload_mbps: f64,
}

/// Per-connection parameters collected from the CLI, the dashboard or saved credentials.
#[derive(Debug, Clone, Default)]
pub struct ConnectParams {
    pub server: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub config_file: Option<PathBuf>,
    /// OpenVPN transport (`udp`/`tcp`).
    pub transport: Option<String>,
    pub ca_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    /// L2TP/IPsec pre-shared key.
    pub psk: Option<String>,
    /// Name of the OS VPN profile for native dialers (rasdial entry, macOS service).
    pub profile: Option<String>,
}

fn present(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

impl ConnectParams {
    pub fn validate(&self, protocol: Protocol) -> Result<()> {
        let missing = |what: &str| {
            Err(VpnError::Configuration(format!(
                "missing {what} in {protocol} config"
            )))
        };

        match protocol {
            Protocol::OpenVpn => {
                if self.config_file.is_none() && !present(&self.server) {
                    return missing("config file or server address");
                }
            }
            Protocol::Sstp | Protocol::L2tp => {
                if !present(&self.server) {
                    return missing("server address");
                }
            }
            Protocol::Pptp => {
                if !present(&self.server) {
                    return missing("server address");
                }
                if !present(&self.username) || !present(&self.password) {
                    return missing("credentials");
                }
            }
        }

        Ok(())
    }

    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => Some((user, pass)),
            _ => None,
        }
    }
}

/// State shared between a connection handle and its watcher task.
pub struct SharedState {
    status: watch::Sender<ConnectionStatus>,
    info: Mutex<Option<ConnectionInfo>>,
    last_error: Mutex<Option<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SharedState {
    pub fn new() -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            status,
            info: Mutex::new(None),
            last_error: Mutex::new(None),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn set_status(&self, status: ConnectionStatus) {
        self.status.send_replace(status);
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn info(&self) -> Option<ConnectionInfo> {
        lock(&self.info).clone()
    }

    pub fn set_info(&self, info: ConnectionInfo) {
        *lock(&self.info) = Some(info);
    }

    pub fn update_info(&self, f: impl FnOnce(&mut ConnectionInfo)) {
        if let Some(info) = lock(&self.info).as_mut() {
            f(info);
        }
    }

    pub fn clear_info(&self) {
        *lock(&self.info) = None;
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.last_error).clone()
    }

    pub fn set_error(&self, message: impl Into<String>) {
        *lock(&self.last_error) = Some(message.into());
    }

    pub fn clear_error(&self) {
        *lock(&self.last_error) = None;
    }

    /// Moves to Connecting, refusing if a session is already active.
    pub fn begin_connect(&self) -> Result<()> {
        let current = self.status();
        if current.is_active() {
            return Err(VpnError::InvalidState(current));
        }
        self.clear_error();
        self.set_status(ConnectionStatus::Connecting);
        Ok(())
    }

    /// Moves to Disconnecting, refusing unless a session is active.
    pub fn begin_disconnect(&self) -> Result<()> {
        let current = self.status();
        if !current.is_active() {
            return Err(VpnError::InvalidState(current));
        }
        self.set_status(ConnectionStatus::Disconnecting);
        Ok(())
    }

    pub fn fail(&self, message: impl Into<String>) {
        self.set_error(message);
        self.set_status(ConnectionStatus::Error);
    }

    pub fn finish_disconnect(&self) {
        self.clear_info();
        self.set_status(ConnectionStatus::Disconnected);
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
pub trait VpnConnection: Send + Sync {
    fn protocol(&self) -> Protocol;

    fn state(&self) -> &SharedState;

    fn metrics(&self) -> &NetworkMetrics;

    /// Starts the backend. Returns once it is launched, not once the tunnel is up.
    async fn connect(&mut self, params: &ConnectParams) -> Result<()>;

    async fn disconnect(&mut self) -> Result<()>;

    fn status(&self) -> ConnectionStatus {
        self.state().status()
    }

    fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.state().subscribe()
    }

    fn connection_info(&self) -> Option<ConnectionInfo> {
        let mut info = self.state().info()?;
        info.refresh_counters();
        Some(info)
    }

    fn last_error(&self) -> Option<String> {
        self.state().last_error()
    }

    /// Average latency in milliseconds to the VPN server.
    async fn test_latency(&self) -> Option<f64> {
        if self.status() != ConnectionStatus::Connected {
            return None;
        }
        let server_ip = self.state().info()?.server_ip?;

        let mut metrics = self.metrics().clone();
        metrics.set_target_host(server_ip.to_string());
        metrics.measure_latency(Some(5)).await.map(|stats| stats.avg)
    }

    async fn test_throughput(&self) -> Throughput {
        if self.status() != ConnectionStatus::Connected {
            return Throughput::default();
        }

        self.metrics()
            .measure_throughput(Some(Duration::from_secs(3)))
            .await
            .unwrap_or_default()
    }
}
