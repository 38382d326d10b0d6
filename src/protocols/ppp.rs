//! SSTP (`sstpc`) and PPTP (`pptp`) clients, both of which hand the link to pppd.

use std::ffi::OsString;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use tempfile::NamedTempFile;
use tokio::process::Command;

use super::process::ProcessLauncher;
use super::scrape::OutputScraper;
use super::scrape::PppScraper;
use crate::connection::ConnectParams;
use crate::error::Result;
use crate::error::VpnError;
use crate::protocol::Protocol;

/// Quotes a word for a pppd options file.
pub fn pppd_quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

/// pppd options shared by both clients, with credentials when given.
pub fn render_options(protocol: Protocol, params: &ConnectParams) -> String {
    let mut lines = Vec::new();
    if let Some((user, pass)) = params.credentials() {
        lines.push(format!("name {}", pppd_quote(user)));
        lines.push(format!("password {}", pppd_quote(pass)));
    }
    lines.extend(
        [
            "remotename vpnclient",
            "noauth",
            "refuse-eap",
            "require-mschap-v2",
            "noipdefault",
            "defaultroute",
            "usepeerdns",
        ]
        .map(String::from),
    );
    if protocol == Protocol::Pptp {
        lines.push("require-mppe-128".to_string());
    }

    let mut options = lines.join("\n");
    options.push('\n');
    options
}

pub struct PppLauncher {
    protocol: Protocol,
    binary: PathBuf,
}

impl PppLauncher {
    pub fn sstp(binary: PathBuf) -> Self {
        Self {
            protocol: Protocol::Sstp,
            binary,
        }
    }

    pub fn pptp(binary: PathBuf) -> Self {
        Self {
            protocol: Protocol::Pptp,
            binary,
        }
    }

    pub fn build_args(&self, server: &str, port: Option<u16>, options: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        match self.protocol {
            Protocol::Sstp => {
                args.extend(["--log-stderr", "--cert-warn"].map(OsString::from));
                args.push(match port {
                    Some(port) => format!("{server}:{port}").into(),
                    None => server.into(),
                });
            }
            _ => args.push(server.into()),
        }
        args.extend([
            OsString::from("file"),
            options.into(),
            OsString::from("nodetach"),
            OsString::from("logfd"),
            OsString::from("2"),
        ]);
        args
    }
}

impl ProcessLauncher for PppLauncher {
    type Resources = NamedTempFile;

    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn scraper(&self) -> Arc<dyn OutputScraper> {
        Arc::new(PppScraper)
    }

    fn prepare(&self, params: &ConnectParams) -> Result<(Command, NamedTempFile)> {
        let server = params
            .server
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| VpnError::Configuration("missing server address".into()))?;

        let mut options = tempfile::Builder::new()
            .prefix("vpnclient-ppp-")
            .tempfile()?;
        options.write_all(render_options(self.protocol, params).as_bytes())?;
        options.flush()?;

        let mut command = Command::new(&self.binary);
        command.args(self.build_args(server, params.port, options.path()));
        Ok((command, options))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pppd_quote() {
        assert_eq!(pppd_quote("alice"), "\"alice\"");
        assert_eq!(pppd_quote(r#"pa"ss\word"#), r#""pa\"ss\\word""#);
    }

    #[test]
    fn test_options_with_credentials() {
        let params = ConnectParams {
            server: Some("vpn.example.com".into()),
            username: Some("alice".into()),
            password: Some("hunter2".into()),
            ..Default::default()
        };
        let options = render_options(Protocol::Pptp, &params);
        let lines: Vec<&str> = options.lines().collect();
        assert_eq!(lines[0], "name \"alice\"");
        assert_eq!(lines[1], "password \"hunter2\"");
        assert!(lines.contains(&"require-mppe-128"));

        let options = render_options(Protocol::Sstp, &params);
        assert!(!options.contains("require-mppe-128"));
    }

    #[test]
    fn test_options_without_credentials() {
        let options = render_options(Protocol::Sstp, &ConnectParams::default());
        assert!(!options.contains("name "));
        assert!(!options.contains("password"));
    }

    #[test]
    fn test_sstp_args() {
        let launcher = PppLauncher::sstp(PathBuf::from("sstpc"));
        let args = launcher.build_args("vpn.example.com", Some(4433), Path::new("/tmp/opts"));
        let args: Vec<String> = args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args, vec![
            "--log-stderr",
            "--cert-warn",
            "vpn.example.com:4433",
            "file",
            "/tmp/opts",
            "nodetach",
            "logfd",
            "2",
        ]);
    }

    #[test]
    fn test_pptp_args() {
        let launcher = PppLauncher::pptp(PathBuf::from("pptp"));
        let args = launcher.build_args("10.0.0.1", None, Path::new("/tmp/opts"));
        assert_eq!(args[0], OsString::from("10.0.0.1"));
        assert_eq!(args[1], OsString::from("file"));
        assert_eq!(args.len(), 6);
    }

    #[test]
    fn test_prepare_options_file_is_private_and_removed() {
        let launcher = PppLauncher::pptp(PathBuf::from("pptp"));
        let params = ConnectParams {
            server: Some("vpn.example.com".into()),
            username: Some("alice".into()),
            password: Some("hunter2".into()),
            ..Default::default()
        };
        let (_command, options) = launcher.prepare(&params).unwrap();
        let path = options.path().to_path_buf();
        assert!(std::fs::read_to_string(&path).unwrap().contains("hunter2"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        drop(options);
        assert!(!path.exists());
    }
}
