use std::ffi::OsString;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;
use tracing::warn;

use super::ppp::render_options;
use super::process::ProcessLauncher;
use super::scrape::OutputScraper;
use super::scrape::Xl2tpdScraper;
use crate::connection::ConnectParams;
use crate::error::Result;
use crate::error::VpnError;
use crate::protocol::Protocol;

const LAC_NAME: &str = "vpnclient";
const CONTROL_WAIT: Duration = Duration::from_secs(5);

pub struct Xl2tpdLauncher {
    binary: PathBuf,
}

/// Scratch directory holding the daemon config, pppd options, control pipe and pid file.
pub struct Xl2tpdFiles {
    dir: TempDir,
}

impl Xl2tpdFiles {
    pub fn config(&self) -> PathBuf {
        self.dir.path().join("xl2tpd.conf")
    }

    pub fn ppp_options(&self) -> PathBuf {
        self.dir.path().join("options.l2tpd.client")
    }

    pub fn control(&self) -> PathBuf {
        self.dir.path().join("l2tp-control")
    }

    pub fn pid(&self) -> PathBuf {
        self.dir.path().join("xl2tpd.pid")
    }
}

pub fn render_daemon_config(server: &str, ppp_options: &Path) -> String {
    format!(
        "[lac {LAC_NAME}]\n\
         lns = {server}\n\
         ppp debug = yes\n\
         pppoptfile = {}\n\
         length bit = yes\n\
         refuse pap = yes\n\
         require authentication = no\n",
        ppp_options.display()
    )
}

fn write_private(path: &Path, contents: &str) -> std::io::Result<()> {
    std::fs::write(path, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

impl Xl2tpdLauncher {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }

    pub fn build_args(files: &Xl2tpdFiles) -> Vec<OsString> {
        vec![
            "-D".into(),
            "-c".into(),
            files.config().into(),
            "-C".into(),
            files.control().into(),
            "-p".into(),
            files.pid().into(),
        ]
    }
}

async fn send_control(control: &Path, request: &str) -> std::io::Result<()> {
    let mut pipe = tokio::fs::OpenOptions::new()
        .write(true)
        .open(control)
        .await?;
    pipe.write_all(request.as_bytes()).await?;
    pipe.flush().await
}

#[async_trait]
impl ProcessLauncher for Xl2tpdLauncher {
    type Resources = Xl2tpdFiles;

    fn protocol(&self) -> Protocol {
        Protocol::L2tp
    }

    fn scraper(&self) -> Arc<dyn OutputScraper> {
        Arc::new(Xl2tpdScraper)
    }

    fn prepare(&self, params: &ConnectParams) -> Result<(Command, Xl2tpdFiles)> {
        let server = params
            .server
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| VpnError::Configuration("missing server address".into()))?;

        if params.psk.is_some() {
            warn!("L2TP pre-shared key is not applied here; IPsec is left to the system IKE daemon");
        }

        let files = Xl2tpdFiles {
            dir: tempfile::Builder::new().prefix("vpnclient-l2tp-").tempdir()?,
        };

        // pppd inherits xl2tpd's stderr.
        let mut ppp_options = render_options(Protocol::L2tp, params);
        ppp_options.push_str("ipcp-accept-local\nipcp-accept-remote\nnoccp\nnodetach\nlogfd 2\n");
        write_private(&files.ppp_options(), &ppp_options)?;
        write_private(
            &files.config(),
            &render_daemon_config(server, &files.ppp_options()),
        )?;

        let mut command = Command::new(&self.binary);
        command.args(Self::build_args(&files));
        Ok((command, files))
    }

    async fn after_spawn(&self, files: &Xl2tpdFiles) -> Result<()> {
        let control = files.control();
        let request = format!("c {LAC_NAME}\n");

        let dial = async {
            while !control.exists() {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            send_control(&control, &request).await
        };

        match tokio::time::timeout(CONTROL_WAIT, dial).await {
            Ok(Ok(())) => {
                debug!("Requested L2TP call via {}", control.display());
                Ok(())
            }
            Ok(Err(e)) => Err(VpnError::Connection(format!(
                "cannot write to xl2tpd control pipe: {e}"
            ))),
            Err(_) => Err(VpnError::Timeout(
                "xl2tpd did not create its control pipe".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daemon_config() {
        let config = render_daemon_config("vpn.example.com", Path::new("/tmp/x/options"));
        assert!(config.starts_with("[lac vpnclient]\n"));
        assert!(config.contains("lns = vpn.example.com\n"));
        assert!(config.contains("pppoptfile = /tmp/x/options\n"));
    }

    #[test]
    fn test_prepare_layout_and_args() {
        let launcher = Xl2tpdLauncher::new(PathBuf::from("xl2tpd"));
        let params = ConnectParams {
            server: Some("vpn.example.com".into()),
            username: Some("alice".into()),
            password: Some("pw".into()),
            psk: Some("shared".into()),
            ..Default::default()
        };

        let (command, files) = launcher.prepare(&params).unwrap();
        let options = std::fs::read_to_string(files.ppp_options()).unwrap();
        assert!(options.contains("name \"alice\""));
        assert!(options.contains("ipcp-accept-local"));
        assert!(options.lines().any(|l| l == "nodetach"));
        assert!(options.lines().any(|l| l == "logfd 2"));
        assert!(!options.contains("shared"));

        let args: Vec<_> = command.as_std().get_args().collect();
        assert_eq!(args[0], "-D");
        assert_eq!(args[2], files.config().as_os_str());

        let dir = files.config().parent().unwrap().to_path_buf();
        drop(files);
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_after_spawn_writes_dial_request() {
        let files = Xl2tpdFiles {
            dir: tempfile::tempdir().unwrap(),
        };
        std::fs::write(files.control(), "").unwrap();

        let launcher = Xl2tpdLauncher::new(PathBuf::from("xl2tpd"));
        launcher.after_spawn(&files).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(files.control()).unwrap(),
            "c vpnclient\n"
        );
    }
}
