//! Connections dialed by the operating system itself: `rasdial` on Windows and
//! `scutil --nc` on macOS. Both are polled because neither streams events.

use std::net::IpAddr;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::scrape::Hint;
use crate::connection::ConnectParams;
use crate::connection::ConnectionInfo;
use crate::connection::ConnectionStatus;
use crate::connection::SharedState;
use crate::connection::VpnConnection;
use crate::error::Result;
use crate::error::VpnError;
use crate::metrics::NetworkMetrics;
use crate::protocol::Protocol;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(90);
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);
/// Consecutive `Disconnected` polls after dialing that count as a failed start.
const DEAD_POLLS_BEFORE_FAILURE: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialState {
    Connecting,
    Connected(Vec<Hint>),
    Disconnected,
}

struct CommandOutput {
    success: bool,
    text: String,
}

async fn run(program: &Path, args: &[String]) -> Result<CommandOutput> {
    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output();
    let output = tokio::time::timeout(COMMAND_TIMEOUT, output)
        .await
        .map_err(|_| VpnError::Timeout(format!("{} did not return", program.display())))?
        .map_err(|e| VpnError::Protocol(format!("cannot run {}: {e}", program.display())))?;

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(CommandOutput {
        success: output.status.success(),
        text,
    })
}

#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, entry: &str, params: &ConnectParams) -> Result<()>;

    async fn poll(&self, entry: &str) -> Result<DialState>;

    async fn hang_up(&self, entry: &str) -> Result<()>;
}

/// Single-quotes a PowerShell string literal.
fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

pub struct RasDialer {
    protocol: Protocol,
    rasdial: PathBuf,
    powershell: PathBuf,
}

impl RasDialer {
    pub fn new(protocol: Protocol, rasdial: PathBuf, powershell: PathBuf) -> Self {
        Self {
            protocol,
            rasdial,
            powershell,
        }
    }

    /// Recreates the phonebook entry so server and tunnel type always match the request.
    pub fn entry_script(&self, entry: &str, params: &ConnectParams) -> String {
        let tunnel = match self.protocol {
            Protocol::Sstp => "Sstp",
            Protocol::L2tp => "L2tp",
            Protocol::Pptp => "Pptp",
            Protocol::OpenVpn => "Automatic",
        };
        let server = params.server.as_deref().unwrap_or_default().trim();

        let mut add = format!(
            "Add-VpnConnection -Name {} -ServerAddress {} -TunnelType {} \
             -AuthenticationMethod MSChapv2 -EncryptionLevel Optional -Force",
            ps_quote(entry),
            ps_quote(server),
            tunnel
        );
        if self.protocol == Protocol::L2tp
            && let Some(psk) = &params.psk
        {
            add.push_str(&format!(" -L2tpPsk {}", ps_quote(psk)));
        }

        format!(
            "Remove-VpnConnection -Name {} -Force -ErrorAction SilentlyContinue; {}",
            ps_quote(entry),
            add
        )
    }
}

/// Whether `rasdial` with no arguments lists `entry` as connected.
pub fn rasdial_lists(output: &str, entry: &str) -> bool {
    output
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("Connected to"))
        .skip(1)
        .any(|line| line.trim().eq_ignore_ascii_case(entry))
}

/// Remote Access error number reported by rasdial, if any.
pub fn rasdial_error_code(output: &str) -> Option<u32> {
    let (_, rest) = output.split_once("Remote Access error")?;
    rest.trim_start()
        .split(|c: char| !c.is_ascii_digit())
        .next()
        .and_then(|code| code.parse().ok())
}

#[async_trait]
impl Dialer for RasDialer {
    async fn dial(&self, entry: &str, params: &ConnectParams) -> Result<()> {
        let script = self.entry_script(entry, params);
        let created = run(&self.powershell, &[
            "-NoProfile".to_string(),
            "-Command".to_string(),
            script,
        ])
        .await?;
        if !created.success {
            return Err(VpnError::Configuration(format!(
                "cannot create VPN entry {entry}: {}",
                created.text.trim()
            )));
        }

        let mut args = vec![entry.to_string()];
        if let Some((user, pass)) = params.credentials() {
            args.push(user.to_string());
            args.push(pass.to_string());
        }
        let dialed = run(&self.rasdial, &args).await?;
        if dialed.success {
            return Ok(());
        }

        match rasdial_error_code(&dialed.text) {
            Some(691) => Err(VpnError::Authentication(
                "Remote Access error 691: credentials rejected".into(),
            )),
            Some(code) => Err(VpnError::Connection(format!(
                "Remote Access error {code}"
            ))),
            None => Err(VpnError::Connection(dialed.text.trim().to_string())),
        }
    }

    async fn poll(&self, entry: &str) -> Result<DialState> {
        let listed = run(&self.rasdial, &[]).await?;
        if rasdial_lists(&listed.text, entry) {
            Ok(DialState::Connected(Vec::new()))
        } else {
            Ok(DialState::Disconnected)
        }
    }

    async fn hang_up(&self, entry: &str) -> Result<()> {
        let out = run(&self.rasdial, &[entry.to_string(), "/disconnect".to_string()]).await?;
        if !out.success {
            return Err(VpnError::Disconnection(out.text.trim().to_string()));
        }
        Ok(())
    }
}

pub struct ScutilDialer {
    scutil: PathBuf,
}

impl ScutilDialer {
    pub fn new(scutil: PathBuf) -> Self {
        Self { scutil }
    }

    pub fn start_args(entry: &str, params: &ConnectParams) -> Vec<String> {
        let mut args = vec!["--nc".to_string(), "start".to_string(), entry.to_string()];
        if let Some((user, pass)) = params.credentials() {
            args.extend([
                "--user".to_string(),
                user.to_string(),
                "--password".to_string(),
                pass.to_string(),
            ]);
        }
        if let Some(psk) = &params.psk {
            args.extend(["--secret".to_string(), psk.clone()]);
        }
        args
    }
}

fn value_after<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let (name, value) = line.split_once(" : ")?;
    (name.trim() == key).then(|| value.trim())
}

/// Parses `scutil --nc status <service>`. The first line is the state.
pub fn parse_scutil_status(output: &str) -> DialState {
    let mut lines = output.lines();
    let state = lines.next().map(str::trim).unwrap_or_default();

    match state {
        "Connected" => {}
        "Connecting" => return DialState::Connecting,
        _ => return DialState::Disconnected,
    }

    let mut hints = Vec::new();
    let mut in_addresses = false;
    for line in lines {
        if line.contains("Addresses : <array>") {
            in_addresses = !line.contains("DestAddresses");
            continue;
        }
        if in_addresses {
            if line.trim() == "}" {
                in_addresses = false;
            } else if let Some(ip) = line
                .split_once(" : ")
                .and_then(|(_, v)| v.trim().parse::<IpAddr>().ok())
            {
                hints.push(Hint::LocalAddr(ip));
                in_addresses = false;
            }
            continue;
        }
        if let Some(name) = value_after(line, "InterfaceName") {
            hints.push(Hint::Interface(name.to_string()));
        } else if let Some(ip) =
            value_after(line, "ServerAddress").and_then(|v| v.parse::<IpAddr>().ok())
        {
            hints.push(Hint::RemoteAddr(ip));
        }
    }

    DialState::Connected(hints)
}

#[async_trait]
impl Dialer for ScutilDialer {
    async fn dial(&self, entry: &str, params: &ConnectParams) -> Result<()> {
        let out = run(&self.scutil, &Self::start_args(entry, params)).await?;
        if !out.success || out.text.contains("No service") {
            return Err(VpnError::Configuration(format!(
                "cannot start VPN service {entry}: {}",
                out.text.trim()
            )));
        }
        Ok(())
    }

    async fn poll(&self, entry: &str) -> Result<DialState> {
        let out = run(&self.scutil, &[
            "--nc".to_string(),
            "status".to_string(),
            entry.to_string(),
        ])
        .await?;
        Ok(parse_scutil_status(&out.text))
    }

    async fn hang_up(&self, entry: &str) -> Result<()> {
        let out = run(&self.scutil, &[
            "--nc".to_string(),
            "stop".to_string(),
            entry.to_string(),
        ])
        .await?;
        if !out.success {
            return Err(VpnError::Disconnection(out.text.trim().to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PollOptions {
    pub interval: Duration,
    pub connect_timeout: Duration,
}

struct Poller {
    protocol: Protocol,
    dialer: Arc<dyn Dialer>,
    entry: String,
    state: Arc<SharedState>,
    options: PollOptions,
    server_ip: Option<IpAddr>,
}

impl Poller {
    async fn run(self, mut stop: watch::Receiver<bool>) {
        let deadline = Instant::now() + self.options.connect_timeout;
        let mut ticker = tokio::time::interval(self.options.interval.max(MIN_POLL_INTERVAL));
        let mut dead_polls: u32 = 0;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.changed() => return,
            }

            if self.state.status() == ConnectionStatus::Connecting && Instant::now() >= deadline {
                let secs = self.options.connect_timeout.as_secs();
                error!("{} connection timed out after {}s", self.protocol, secs);
                self.state
                    .fail(format!("connection timed out after {secs}s"));
                if let Err(e) = self.dialer.hang_up(&self.entry).await {
                    debug!("hang up after timeout failed: {}", e);
                }
                return;
            }

            let polled = match self.dialer.poll(&self.entry).await {
                Ok(polled) => polled,
                Err(e) => {
                    debug!("{} status poll failed: {}", self.protocol, e);
                    continue;
                }
            };

            match polled {
                DialState::Connected(hints) => {
                    dead_polls = 0;
                    if self.state.status() == ConnectionStatus::Connecting {
                        self.on_connected(&hints);
                    }
                }
                DialState::Connecting => dead_polls = 0,
                DialState::Disconnected => match self.state.status() {
                    ConnectionStatus::Connected => {
                        warn!("{} connection dropped", self.protocol);
                        self.state.finish_disconnect();
                        return;
                    }
                    ConnectionStatus::Connecting => {
                        dead_polls += 1;
                        if dead_polls >= DEAD_POLLS_BEFORE_FAILURE {
                            error!("{} service stopped before connecting", self.protocol);
                            self.state
                                .fail(format!("{} service stopped before connecting", self.protocol));
                            return;
                        }
                    }
                    _ => {}
                },
            }
        }
    }

    fn on_connected(&self, hints: &[Hint]) {
        let mut info = ConnectionInfo::new(self.protocol);
        info.server_ip = self.server_ip;
        for hint in hints {
            hint.apply_to(&mut info);
        }
        self.state.set_info(info);
        self.state.set_status(ConnectionStatus::Connected);
        info!("{} connection established", self.protocol);
    }
}

struct Dialed {
    entry: String,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct NativeConnection {
    protocol: Protocol,
    dialer: Arc<dyn Dialer>,
    state: Arc<SharedState>,
    metrics: NetworkMetrics,
    options: PollOptions,
    active: Option<Dialed>,
}

impl NativeConnection {
    pub fn new(
        protocol: Protocol,
        dialer: Arc<dyn Dialer>,
        metrics: NetworkMetrics,
        options: PollOptions,
    ) -> Self {
        Self {
            protocol,
            dialer,
            state: Arc::new(SharedState::new()),
            metrics,
            options,
            active: None,
        }
    }

    async fn stop_poller(&mut self) -> Option<String> {
        let dialed = self.active.take()?;
        let _ = dialed.stop_tx.send(true);
        let mut task = dialed.task;
        if tokio::time::timeout(Duration::from_secs(2), &mut task)
            .await
            .is_err()
        {
            task.abort();
        }
        Some(dialed.entry)
    }
}

fn entry_name(params: &ConnectParams) -> String {
    params
        .profile
        .as_deref()
        .or(params.server.as_deref())
        .map(str::trim)
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl VpnConnection for NativeConnection {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn state(&self) -> &SharedState {
        &self.state
    }

    fn metrics(&self) -> &NetworkMetrics {
        &self.metrics
    }

    async fn connect(&mut self, params: &ConnectParams) -> Result<()> {
        params.validate(self.protocol)?;
        let current = self.state.status();
        if current.is_active() {
            return Err(VpnError::InvalidState(current));
        }
        self.stop_poller().await;
        self.state.begin_connect()?;

        let entry = entry_name(params);
        if let Some(server) = &params.server {
            self.metrics.set_target_host(server.clone());
        }

        info!("Dialing {} entry {}", self.protocol, entry);
        if let Err(e) = self.dialer.dial(&entry, params).await {
            self.state.fail(e.to_string());
            return Err(e);
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let poller = Poller {
            protocol: self.protocol,
            dialer: self.dialer.clone(),
            entry: entry.clone(),
            state: self.state.clone(),
            options: self.options,
            server_ip: params.server.as_deref().and_then(|s| s.trim().parse().ok()),
        };
        let task = tokio::spawn(poller.run(stop_rx));
        self.active = Some(Dialed {
            entry,
            stop_tx,
            task,
        });
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        let current = self.state.status();
        let entry = self.stop_poller().await;
        let Some(entry) = entry.filter(|_| current.is_active()) else {
            return Err(VpnError::InvalidState(current));
        };

        self.state.set_status(ConnectionStatus::Disconnecting);
        let result = self.dialer.hang_up(&entry).await;
        self.state.finish_disconnect();

        match result {
            Ok(()) => {
                info!("{} disconnected", self.protocol);
                Ok(())
            }
            Err(e) => {
                warn!("Hang up of {} reported: {}", entry, e);
                Err(e)
            }
        }
    }
}

impl Drop for NativeConnection {
    fn drop(&mut self) {
        if let Some(dialed) = &self.active {
            dialed.task.abort();
        }
    }
}
