use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub openvpn: OpenVpnConfig,
    #[serde(default)]
    pub binaries: BinaryPaths,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Loads `path` when given, else the file in the platform config dir.
    /// A missing default file yields the defaults; a missing explicit file is an error.
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }

        let default_path = crate::platform::config_dir().join("config.toml");
        if default_path.exists() {
            Self::load(&default_path)
        } else {
            Ok(Self::default())
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Never zero; a zero period would stall the native poller.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            stop_grace_ms: default_stop_grace_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_connect_timeout_secs() -> u64 {
    60
}

fn default_stop_grace_ms() -> u64 {
    5000
}

fn default_poll_interval_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenVpnConfig {
    #[serde(default = "default_transport")]
    pub transport: String,
    #[serde(default = "default_cipher")]
    pub cipher: String,
    #[serde(default = "default_auth_digest")]
    pub auth: String,
    #[serde(default = "default_verb")]
    pub verb: u8,
    #[serde(default)]
    pub extra: Vec<String>,
}

impl Default for OpenVpnConfig {
    fn default() -> Self {
        Self {
            transport: default_transport(),
            cipher: default_cipher(),
            auth: default_auth_digest(),
            verb: default_verb(),
            extra: Vec::new(),
        }
    }
}

fn default_transport() -> String {
    "udp".to_string()
}

fn default_cipher() -> String {
    "AES-256-GCM".to_string()
}

fn default_auth_digest() -> String {
    "SHA256".to_string()
}

fn default_verb() -> u8 {
    3
}

/// Executables used for each backend. Bare names are resolved through `PATH`.
#[derive(Debug, Clone, Deserialize)]
pub struct BinaryPaths {
    #[serde(default = "default_openvpn_bin")]
    pub openvpn: PathBuf,
    #[serde(default = "default_sstpc_bin")]
    pub sstpc: PathBuf,
    #[serde(default = "default_xl2tpd_bin")]
    pub xl2tpd: PathBuf,
    #[serde(default = "default_pptp_bin")]
    pub pptp: PathBuf,
    #[serde(default = "default_rasdial_bin")]
    pub rasdial: PathBuf,
    #[serde(default = "default_powershell_bin")]
    pub powershell: PathBuf,
    #[serde(default = "default_scutil_bin")]
    pub scutil: PathBuf,
}

impl Default for BinaryPaths {
    fn default() -> Self {
        Self {
            openvpn: default_openvpn_bin(),
            sstpc: default_sstpc_bin(),
            xl2tpd: default_xl2tpd_bin(),
            pptp: default_pptp_bin(),
            rasdial: default_rasdial_bin(),
            powershell: default_powershell_bin(),
            scutil: default_scutil_bin(),
        }
    }
}

fn default_openvpn_bin() -> PathBuf {
    PathBuf::from("openvpn")
}

fn default_sstpc_bin() -> PathBuf {
    PathBuf::from("sstpc")
}

fn default_xl2tpd_bin() -> PathBuf {
    PathBuf::from("xl2tpd")
}

fn default_pptp_bin() -> PathBuf {
    PathBuf::from("pptp")
}

fn default_rasdial_bin() -> PathBuf {
    PathBuf::from("rasdial")
}

fn default_powershell_bin() -> PathBuf {
    PathBuf::from("powershell")
}

fn default_scutil_bin() -> PathBuf {
    PathBuf::from("scutil")
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_ping_count")]
    pub ping_count: usize,
    #[serde(default = "default_latency_port")]
    pub latency_port: u16,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    #[serde(default = "default_throughput_duration_secs")]
    pub throughput_duration_secs: u64,
    #[serde(default = "default_download_url")]
    pub download_url: String,
    #[serde(default = "default_upload_url")]
    pub upload_url: String,
    #[serde(default = "default_upload_chunk_bytes")]
    pub upload_chunk_bytes: usize,
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            ping_count: default_ping_count(),
            latency_port: default_latency_port(),
            probe_timeout_ms: default_probe_timeout_ms(),
            probe_interval_ms: default_probe_interval_ms(),
            throughput_duration_secs: default_throughput_duration_secs(),
            download_url: default_download_url(),
            upload_url: default_upload_url(),
            upload_chunk_bytes: default_upload_chunk_bytes(),
            monitor_interval_secs: default_monitor_interval_secs(),
        }
    }
}

fn default_ping_count() -> usize {
    10
}

fn default_latency_port() -> u16 {
    80
}

fn default_probe_timeout_ms() -> u64 {
    2000
}

fn default_probe_interval_ms() -> u64 {
    200
}

fn default_throughput_duration_secs() -> u64 {
    5
}

fn default_download_url() -> String {
    "https://speed.cloudflare.com/__down?bytes=100000000".to_string()
}

fn default_upload_url() -> String {
    "https://speed.cloudflare.com/__up".to_string()
}

fn default_upload_chunk_bytes() -> usize {
    1_000_000
}

fn default_monitor_interval_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_reconnect_enabled")]
    pub enabled: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: MaxAttempts,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_backoff")]
    pub backoff: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl ReconnectConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: match self.max_attempts {
                MaxAttempts::Inf => None,
                MaxAttempts::Count(n) => Some(n),
            },
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            backoff: self.backoff,
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: default_reconnect_enabled(),
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            backoff: default_backoff(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_reconnect_enabled() -> bool {
    true
}

fn default_max_attempts() -> MaxAttempts {
    MaxAttempts::Count(3)
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_backoff() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxAttempts {
    Inf,
    Count(u32),
}

impl<'de> Deserialize<'de> for MaxAttempts {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum SelfDeser {
            Str(String),
            Int(u32),
        }

        match SelfDeser::deserialize(deserializer)? {
            SelfDeser::Str(x) if x.eq_ignore_ascii_case("inf") => Ok(MaxAttempts::Inf),
            SelfDeser::Str(x) => Err(serde::de::Error::custom(format!(
                "expected \"inf\" or a number, got: {x}"
            ))),
            SelfDeser::Int(x) => Ok(MaxAttempts::Count(x)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialBackend {
    #[default]
    Auto,
    Keyring,
    File,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CredentialsConfig {
    #[serde(default)]
    pub backend: CredentialBackend,
    /// Directory for the encrypted file store; `~/.vpnclient` when unset.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
