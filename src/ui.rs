//! Menu-driven text dashboard.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use tokio::io::AsyncBufRead;
use tokio::io::AsyncBufReadExt;
use tokio::io::Lines;

use crate::app::VpnClientApp;
use crate::connection::ConnectParams;
use crate::connection::ConnectionStatus;
use crate::connection::format_uptime;
use crate::credentials::Credentials;
use crate::protocol::Protocol;

enum Flow {
    Continue,
    Exit,
}

pub struct Dashboard<'a, R, W> {
    app: &'a mut VpnClientApp,
    input: Lines<R>,
    out: W,
}

fn show<T: ToString>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

fn yes(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

impl<'a, R, W> Dashboard<'a, R, W>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    pub fn new(app: &'a mut VpnClientApp, input: R, out: W) -> Self {
        Self {
            app,
            input: input.lines(),
            out,
        }
    }

    pub fn into_output(self) -> W {
        self.out
    }

    pub async fn run(&mut self) -> Result<()> {
        loop {
            self.render_status().await?;
            writeln!(self.out)?;
            writeln!(self.out, "1. Connect")?;
            writeln!(self.out, "2. Disconnect")?;
            writeln!(self.out, "3. Show metrics")?;
            writeln!(self.out, "4. Exit")?;

            let Some(choice) = self.prompt("Select an option: ").await? else {
                self.app.shutdown().await;
                return Ok(());
            };

            let flow = match choice.trim() {
                "1" => self.connect_dialog().await?,
                "2" => self.disconnect().await?,
                "3" => self.show_metrics().await?,
                "4" => self.exit().await?,
                other => {
                    writeln!(self.out, "Invalid option: {other}")?;
                    Flow::Continue
                }
            };

            if let Flow::Exit = flow {
                return Ok(());
            }
        }
    }

    async fn prompt(&mut self, label: &str) -> Result<Option<String>> {
        write!(self.out, "{label}")?;
        self.out.flush()?;
        let line = self.input.next_line().await?;
        Ok(line.map(|l| l.trim().to_string()))
    }

    async fn prompt_or_empty(&mut self, label: &str) -> Result<String> {
        Ok(self.prompt(label).await?.unwrap_or_default())
    }

    async fn render_status(&mut self) -> Result<()> {
        let status = self.app.status();
        writeln!(self.out)?;
        writeln!(self.out, "===== VPN Client =====")?;
        writeln!(self.out, "Status: {status}")?;

        if status == ConnectionStatus::Connected
            && let Some(info) = self.app.connection_info().await
        {
            writeln!(self.out, "Protocol: {}", info.protocol)?;
            writeln!(self.out, "Server IP: {}", show(info.server_ip))?;
            writeln!(self.out, "Assigned IP: {}", show(info.assigned_ip))?;
            writeln!(self.out, "Connected for: {}", format_uptime(info.uptime()))?;
            writeln!(self.out, "Bytes sent: {}", info.bytes_sent)?;
            writeln!(self.out, "Bytes received: {}", info.bytes_received)?;
        }

        if status == ConnectionStatus::Error
            && let Some(error) = self.app.last_error().await
        {
            writeln!(self.out, "Last error: {error}")?;
        }
        Ok(())
    }

    async fn choose_protocol(&mut self) -> Result<Option<Protocol>> {
        writeln!(self.out, "Select protocol:")?;
        for (i, protocol) in Protocol::ALL.iter().enumerate() {
            writeln!(self.out, "  {}. {}", i + 1, protocol)?;
        }

        let answer = self.prompt_or_empty("Protocol [1-4]: ").await?;
        let protocol = answer
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| Protocol::ALL.get(i).copied());
        if protocol.is_none() {
            writeln!(self.out, "Invalid protocol: {answer}")?;
        }
        Ok(protocol)
    }

    async fn connect_dialog(&mut self) -> Result<Flow> {
        let Some(protocol) = self.choose_protocol().await? else {
            return Ok(Flow::Continue);
        };

        let mut params = ConnectParams::default();
        if protocol == Protocol::OpenVpn {
            let path = self.prompt_or_empty("Config file: ").await?;
            let path = PathBuf::from(path);
            if !path.is_file() {
                writeln!(self.out, "Config file not found: {}", path.display())?;
                return Ok(Flow::Continue);
            }
            params.config_file = Some(path);
        } else {
            let server = self.prompt_or_empty("Server: ").await?;
            if server.is_empty() {
                writeln!(self.out, "A server address is required")?;
                return Ok(Flow::Continue);
            }
            params.server = Some(server);

            if protocol == Protocol::L2tp {
                let psk = self.prompt_or_empty("Pre-shared key (optional): ").await?;
                params.psk = Some(psk).filter(|p| !p.is_empty());
            }
        }

        self.collect_credentials(&mut params).await?;

        writeln!(self.out, "Connecting via {protocol}...")?;
        if let Err(e) = self.app.connect(protocol, params).await {
            writeln!(self.out, "Connection failed: {e}")?;
            return Ok(Flow::Continue);
        }

        let status = self.wait_for_outcome().await;
        match status {
            ConnectionStatus::Connected => writeln!(self.out, "Connected.")?,
            ConnectionStatus::Connecting => writeln!(self.out, "Still connecting...")?,
            other => {
                let error = self.app.last_error().await;
                writeln!(self.out, "Connection ended: {other} ({})", show(error))?;
            }
        }
        Ok(Flow::Continue)
    }

    async fn collect_credentials(&mut self, params: &mut ConnectParams) -> Result<()> {
        let saved = self.prompt_or_empty("Use saved credentials? [y/N]: ").await?;
        if yes(&saved) {
            let service = self.prompt_or_empty("Service name: ").await?;
            match self.app.load_credentials(&service) {
                Ok(Some(creds)) => {
                    params.username = Some(creds.username);
                    params.password = Some(creds.password);
                    if params.psk.is_none() {
                        params.psk = creds.extra.get("psk").cloned();
                    }
                    return Ok(());
                }
                Ok(None) => writeln!(self.out, "No saved credentials for {service}")?,
                Err(e) => writeln!(self.out, "Cannot load credentials: {e}")?,
            }
        }

        let username = self.prompt_or_empty("Username (blank for none): ").await?;
        if username.is_empty() {
            return Ok(());
        }
        let password = self.prompt_or_empty("Password: ").await?;
        params.username = Some(username.clone());
        params.password = Some(password.clone());

        let save = self.prompt_or_empty("Save these credentials? [y/N]: ").await?;
        if yes(&save) {
            let service = self.prompt_or_empty("Service name: ").await?;
            let mut creds = Credentials::new(username, password);
            if let Some(psk) = &params.psk {
                creds.extra.insert("psk".to_string(), psk.clone());
            }
            match self.app.save_credentials(&service, &creds) {
                Ok(()) => writeln!(self.out, "Credentials saved.")?,
                Err(e) => writeln!(self.out, "Cannot save credentials: {e}")?,
            }
        }
        Ok(())
    }

    async fn wait_for_outcome(&self) -> ConnectionStatus {
        let Some(mut rx) = self.app.subscribe() else {
            return ConnectionStatus::Disconnected;
        };
        let budget = self.app.config().connection.connect_timeout() + Duration::from_secs(5);
        let settled = tokio::time::timeout(
            budget,
            rx.wait_for(|s| *s != ConnectionStatus::Connecting),
        )
        .await;
        match settled {
            Ok(Ok(status)) => *status,
            _ => self.app.status(),
        }
    }

    async fn disconnect(&mut self) -> Result<Flow> {
        if !self.app.status().is_active() {
            writeln!(self.out, "Not connected.")?;
            return Ok(Flow::Continue);
        }
        match self.app.disconnect().await {
            Ok(()) => writeln!(self.out, "Disconnected.")?,
            Err(e) => writeln!(self.out, "Disconnect failed: {e}")?,
        }
        Ok(Flow::Continue)
    }

    async fn show_metrics(&mut self) -> Result<Flow> {
        if self.app.status() != ConnectionStatus::Connected {
            writeln!(self.out, "Not connected.")?;
            return Ok(Flow::Continue);
        }

        writeln!(self.out, "Measuring...")?;
        match self.app.test_latency().await {
            Some(ms) => writeln!(self.out, "Latency: {ms:.2} ms")?,
            None => writeln!(self.out, "Latency: unavailable")?,
        }
        let throughput = self.app.test_throughput().await;
        writeln!(
            self.out,
            "Download: {:.2} Mbps",
            throughput.download_mbps
        )?;
        writeln!(self.out, "Upload: {:.2} Mbps", throughput.upload_mbps)?;

        if let Some(sample) = self.app.latest_metrics()
            && let Some(latency) = sample.latency
        {
            writeln!(
                self.out,
                "Background latency: avg {:.2} ms, jitter {:.2} ms",
                latency.avg, latency.jitter
            )?;
        }
        Ok(Flow::Continue)
    }

    async fn exit(&mut self) -> Result<Flow> {
        if self.app.status().is_active() {
            let answer = self
                .prompt_or_empty("A connection is active. Disconnect and exit? [y/N]: ")
                .await?;
            if !yes(&answer) {
                return Ok(Flow::Continue);
            }
        }
        self.app.shutdown().await;
        writeln!(self.out, "Goodbye.")?;
        Ok(Flow::Exit)
    }
}
