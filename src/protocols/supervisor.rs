use std::io;
use std::process::ExitStatus;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncRead;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::scrape::Hint;
use super::scrape::LineEvent;
use super::scrape::OutputScraper;
use crate::connection::ConnectionInfo;
use crate::connection::ConnectionStatus;
use crate::connection::SharedState;
use crate::error::Result;
use crate::error::VpnError;
use crate::protocol::Protocol;

const DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy)]
pub struct SupervisorOptions {
    pub connect_timeout: Duration,
    pub stop_grace: Duration,
    /// Fill missing addresses from the routing table once connected.
    pub discover_addresses: bool,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(60),
            stop_grace: Duration::from_secs(5),
            discover_addresses: false,
        }
    }
}

/// A running backend process and the task scraping its output.
pub struct Supervisor {
    pid: Option<u32>,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    grace: Duration,
}

fn spawn_error(program: &str, e: io::Error) -> VpnError {
    match e.kind() {
        io::ErrorKind::NotFound => {
            VpnError::Protocol(format!("{program} not found, is it installed?"))
        }
        io::ErrorKind::PermissionDenied => {
            VpnError::Permission(format!("not allowed to run {program}: {e}"))
        }
        _ => VpnError::Connection(format!("failed to start {program}: {e}")),
    }
}

impl Supervisor {
    pub fn launch(
        protocol: Protocol,
        mut command: Command,
        scraper: Arc<dyn OutputScraper>,
        state: Arc<SharedState>,
        options: SupervisorOptions,
    ) -> Result<Self> {
        let program = command
            .as_std()
            .get_program()
            .to_string_lossy()
            .into_owned();

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| spawn_error(&program, e))?;
        let pid = child.id();
        info!("Started {} (pid {:?})", program, pid);

        let (line_tx, line_rx) = mpsc::channel(64);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, line_tx.clone()));
        }
        drop(line_tx);

        let (stop_tx, stop_rx) = watch::channel(false);
        let watcher = Watcher {
            protocol,
            scraper,
            state,
            options,
            pending: Vec::new(),
        };
        let task = tokio::spawn(watcher.run(child, line_rx, stop_rx));

        Ok(Self {
            pid,
            stop_tx,
            task,
            grace: options.stop_grace,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Asks the process to terminate and waits for the watcher to finish.
    pub async fn stop(&mut self) {
        let _ = self.stop_tx.send(true);

        let budget = self.grace + Duration::from_secs(5);
        if tokio::time::timeout(budget, &mut self.task).await.is_err() {
            warn!("Watcher did not finish within {:?}, aborting", budget);
            self.task.abort();
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        // Dropping the task drops the child, which kills it.
        self.task.abort();
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: R, tx: mpsc::Sender<String>) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("Output stream closed: {}", e);
                break;
            }
        }
    }
}

#[cfg(unix)]
fn send_sigterm(child: &mut Child) -> io::Result<()> {
    let Some(pid) = child.id() else {
        return Ok(());
    };
    let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn send_sigterm(child: &mut Child) -> io::Result<()> {
    child.start_kill()
}

fn exit_code(status: &ExitStatus) -> String {
    match status.code() {
        Some(code) => code.to_string(),
        None => "signal".to_string(),
    }
}

struct Watcher {
    protocol: Protocol,
    scraper: Arc<dyn OutputScraper>,
    state: Arc<SharedState>,
    options: SupervisorOptions,
    /// Hints seen before the connected marker.
    pending: Vec<Hint>,
}

impl Watcher {
    async fn run(
        mut self,
        mut child: Child,
        mut lines: mpsc::Receiver<String>,
        mut stop: watch::Receiver<bool>,
    ) {
        let deadline = Instant::now() + self.options.connect_timeout;
        let mut lines_open = true;

        let exit = loop {
            tokio::select! {
                line = lines.recv(), if lines_open => match line {
                    Some(line) => self.on_line(&line),
                    None => lines_open = false,
                },
                status = child.wait() => break status,
                _ = tokio::time::sleep_until(deadline),
                    if self.state.status() == ConnectionStatus::Connecting =>
                {
                    let secs = self.options.connect_timeout.as_secs();
                    error!("{} connection timed out after {}s", self.protocol, secs);
                    self.state
                        .fail(format!("connection timed out after {secs}s"));
                    break self.terminate(&mut child).await;
                }
                _ = stop.changed() => {
                    break self.terminate(&mut child).await;
                }
            }
        };

        // Lines written just before exit may still be buffered.
        while let Ok(Some(line)) = tokio::time::timeout(DRAIN_TIMEOUT, lines.recv()).await {
            self.on_line(&line);
        }

        self.on_exit(exit);
    }

    async fn terminate(&self, child: &mut Child) -> io::Result<ExitStatus> {
        if let Err(e) = send_sigterm(child) {
            debug!("SIGTERM failed: {}", e);
        }

        match tokio::time::timeout(self.options.stop_grace, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                warn!(
                    "{} did not exit within {:?}, killing",
                    self.protocol, self.options.stop_grace
                );
                child.kill().await?;
                child.wait().await
            }
        }
    }

    fn on_line(&mut self, line: &str) {
        debug!("[{}] {}", self.protocol, line);

        let hints = self.scraper.hints(line);
        if !hints.is_empty() {
            if self.state.status() == ConnectionStatus::Connected {
                self.state.update_info(|info| {
                    for hint in &hints {
                        hint.apply_to(info);
                    }
                });
            } else {
                self.pending.extend(hints);
            }
        }

        let Some(event) = self.scraper.classify(line) else {
            return;
        };

        match event {
            LineEvent::Connected => self.on_connected(),
            LineEvent::Disconnected => {
                self.state.clear_info();
                if self.state.status() != ConnectionStatus::Error {
                    info!("{} connection closed", self.protocol);
                    self.state.set_status(ConnectionStatus::Disconnected);
                }
            }
            LineEvent::AuthFailed | LineEvent::Failed => {
                let message = line.trim().to_string();
                if event == LineEvent::AuthFailed {
                    error!("{} authentication failed", self.protocol);
                } else {
                    warn!("{} reported: {}", self.protocol, message);
                }
                self.state.set_error(message);
                if self.state.status() != ConnectionStatus::Connected {
                    self.state.set_status(ConnectionStatus::Error);
                }
            }
        }
    }

    fn on_connected(&mut self) {
        let mut info = ConnectionInfo::new(self.protocol);
        for hint in self.pending.drain(..) {
            hint.apply_to(&mut info);
        }
        let needs_discovery = info.server_ip.is_none() || info.assigned_ip.is_none();

        self.state.set_info(info);
        self.state.set_status(ConnectionStatus::Connected);
        info!("{} connection established", self.protocol);

        if self.options.discover_addresses && needs_discovery {
            let state = self.state.clone();
            tokio::spawn(async move {
                let found = crate::netinfo::discover().await;
                if state.status() != ConnectionStatus::Connected {
                    return;
                }
                state.update_info(|info| {
                    if info.server_ip.is_none() {
                        info.server_ip = found.server_ip;
                    }
                    if info.assigned_ip.is_none() {
                        info.assigned_ip = found.assigned_ip;
                    }
                    if info.interface.is_none() {
                        info.interface = found.interface;
                    }
                });
            });
        }
    }

    fn on_exit(&self, exit: io::Result<ExitStatus>) {
        self.state.clear_info();

        let status = self.state.status();
        match (&exit, status) {
            (_, ConnectionStatus::Error) => {
                debug!("{} exited after an error", self.protocol);
            }
            (Ok(code), ConnectionStatus::Connecting) if !code.success() => {
                let message = format!("{} exited with status {}", self.protocol, exit_code(code));
                error!("{}", message);
                self.state.fail(message);
            }
            (Err(e), ConnectionStatus::Connecting) => {
                self.state
                    .fail(format!("lost track of {} process: {}", self.protocol, e));
            }
            _ => {
                info!("{} process ended", self.protocol);
                self.state.set_status(ConnectionStatus::Disconnected);
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::protocols::scrape::OpenVpnScraper;

    fn sh(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        command
    }

    fn launch(script: &str, options: SupervisorOptions) -> (Supervisor, Arc<SharedState>) {
        let state = Arc::new(SharedState::new());
        state.begin_connect().unwrap();
        let supervisor = Supervisor::launch(
            Protocol::OpenVpn,
            sh(script),
            Arc::new(OpenVpnScraper),
            state.clone(),
            options,
        )
        .unwrap();
        (supervisor, state)
    }

    async fn wait_for(state: &SharedState, want: ConnectionStatus) {
        let mut rx = state.subscribe();
        tokio::time::timeout(Duration::from_secs(10), rx.wait_for(|s| *s == want))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_connected_then_stopped() {
        let (mut supervisor, state) = launch(
            "echo 'TUN/TAP device tun0 opened'; \
             echo 'Peer Connection Initiated with [AF_INET]203.0.113.7:1194'; \
             echo 'Initialization Sequence Completed'; \
             exec sleep 30",
            SupervisorOptions::default(),
        );

        wait_for(&state, ConnectionStatus::Connected).await;
        let info = state.info().unwrap();
        assert_eq!(info.interface.as_deref(), Some("tun0"));
        assert_eq!(info.server_ip, Some("203.0.113.7".parse().unwrap()));

        supervisor.stop().await;
        assert!(!supervisor.is_running());
        assert_eq!(state.status(), ConnectionStatus::Disconnected);
        assert!(state.info().is_none());
    }

    #[tokio::test]
    async fn test_auth_failure_stays_error_after_exit() {
        let (mut supervisor, state) = launch(
            "echo 'AUTH: Received control message: AUTH_FAILED'; \
             echo 'SIGTERM[soft,auth-failure] received, process exiting'; \
             exit 1",
            SupervisorOptions::default(),
        );

        wait_for(&state, ConnectionStatus::Error).await;
        supervisor.stop().await;
        assert_eq!(state.status(), ConnectionStatus::Error);
        assert!(state.last_error().unwrap().contains("AUTH_FAILED"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_while_connecting() {
        let (mut supervisor, state) = launch("exit 3", SupervisorOptions::default());

        wait_for(&state, ConnectionStatus::Error).await;
        supervisor.stop().await;
        assert_eq!(
            state.last_error().as_deref(),
            Some("OpenVPN exited with status 3")
        );
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let options = SupervisorOptions {
            connect_timeout: Duration::from_millis(300),
            stop_grace: Duration::from_millis(500),
            ..Default::default()
        };
        let (mut supervisor, state) = launch("exec sleep 30", options);

        wait_for(&state, ConnectionStatus::Error).await;
        supervisor.stop().await;
        assert!(state.last_error().unwrap().contains("timed out"));
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn test_error_while_connected_keeps_status() {
        let (mut supervisor, state) = launch(
            "echo 'Initialization Sequence Completed'; \
             echo 'ERROR: route addition failed'; \
             exec sleep 30",
            SupervisorOptions::default(),
        );

        wait_for(&state, ConnectionStatus::Connected).await;
        tokio::time::timeout(Duration::from_secs(10), async {
            while state.last_error().is_none() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(state.status(), ConnectionStatus::Connected);

        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_term_ignored_gets_killed() {
        let options = SupervisorOptions {
            stop_grace: Duration::from_millis(300),
            ..Default::default()
        };
        let (mut supervisor, state) = launch(
            "trap '' TERM; echo 'Initialization Sequence Completed'; \
             while true; do sleep 1; done",
            options,
        );

        wait_for(&state, ConnectionStatus::Connected).await;
        supervisor.stop().await;
        assert!(!supervisor.is_running());
        assert_eq!(state.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_missing_binary_is_protocol_error() {
        let state = Arc::new(SharedState::new());
        let result = Supervisor::launch(
            Protocol::OpenVpn,
            Command::new("/nonexistent/openvpn"),
            Arc::new(OpenVpnScraper),
            state,
            SupervisorOptions::default(),
        );
        assert!(matches!(result, Err(VpnError::Protocol(_))));
    }
}
