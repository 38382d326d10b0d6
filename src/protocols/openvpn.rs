use std::ffi::OsString;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use tempfile::NamedTempFile;
use tokio::process::Command;

use super::process::ProcessLauncher;
use super::scrape::OpenVpnScraper;
use super::scrape::OutputScraper;
use crate::config::OpenVpnConfig;
use crate::connection::ConnectParams;
use crate::error::Result;
use crate::error::VpnError;
use crate::protocol::Protocol;

const DEFAULT_PORT: u16 = 1194;

pub struct OpenVpnLauncher {
    binary: PathBuf,
    settings: OpenVpnConfig,
}

/// Temp files removed when the session ends.
#[derive(Default)]
pub struct OpenVpnFiles {
    pub config: Option<NamedTempFile>,
    pub auth: Option<NamedTempFile>,
}

fn push_path(lines: &mut Vec<String>, directive: &str, path: &Option<PathBuf>) {
    if let Some(path) = path {
        lines.push(format!("{directive} {}", path.display()));
    }
}

/// Client config for a server given by address instead of a profile file.
pub fn render_config(params: &ConnectParams, settings: &OpenVpnConfig) -> Result<String> {
    let server = params
        .server
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| VpnError::Configuration("missing server address".into()))?;

    let transport = params.transport.as_deref().unwrap_or(&settings.transport);
    let mut lines = vec![
        "client".to_string(),
        format!("remote {} {}", server.trim(), params.port.unwrap_or(DEFAULT_PORT)),
        format!("proto {transport}"),
        "dev tun".to_string(),
    ];
    push_path(&mut lines, "ca", &params.ca_cert);
    push_path(&mut lines, "cert", &params.client_cert);
    push_path(&mut lines, "key", &params.client_key);
    lines.extend(
        ["resolv-retry infinite", "nobind", "persist-key", "persist-tun"].map(String::from),
    );
    lines.push(format!("cipher {}", settings.cipher));
    lines.push(format!("auth {}", settings.auth));
    lines.push(format!("verb {}", settings.verb));
    lines.extend(settings.extra.iter().cloned());

    let mut config = lines.join("\n");
    config.push('\n');
    Ok(config)
}

pub fn build_args(config: &Path, auth: Option<&Path>) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["--config".into(), config.into()];
    if let Some(auth) = auth {
        args.push("--auth-user-pass".into());
        args.push(auth.into());
    }
    args
}

fn write_temp(prefix: &str, suffix: &str, contents: &str) -> Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix(prefix)
        .suffix(suffix)
        .tempfile()?;
    file.write_all(contents.as_bytes())?;
    file.flush()?;
    Ok(file)
}

impl OpenVpnLauncher {
    pub fn new(binary: PathBuf, settings: OpenVpnConfig) -> Self {
        Self { binary, settings }
    }
}

impl ProcessLauncher for OpenVpnLauncher {
    type Resources = OpenVpnFiles;

    fn protocol(&self) -> Protocol {
        Protocol::OpenVpn
    }

    fn scraper(&self) -> Arc<dyn OutputScraper> {
        Arc::new(OpenVpnScraper)
    }

    fn prepare(&self, params: &ConnectParams) -> Result<(Command, OpenVpnFiles)> {
        let mut files = OpenVpnFiles::default();

        let config_path = match &params.config_file {
            Some(path) => {
                if !path.is_file() {
                    return Err(VpnError::Configuration(format!(
                        "config file {} does not exist",
                        path.display()
                    )));
                }
                path.clone()
            }
            None => {
                let rendered = render_config(params, &self.settings)?;
                let file = write_temp("vpnclient-", ".ovpn", &rendered)?;
                let path = file.path().to_path_buf();
                files.config = Some(file);
                path
            }
        };

        let auth_path = match params.credentials() {
            Some((user, pass)) => {
                // NamedTempFile is created 0600.
                let file = write_temp("vpnclient-auth-", ".txt", &format!("{user}\n{pass}\n"))?;
                let path = file.path().to_path_buf();
                files.auth = Some(file);
                Some(path)
            }
            None => None,
        };

        let mut command = Command::new(&self.binary);
        command.args(build_args(&config_path, auth_path.as_deref()));
        Ok((command, files))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_minimal_config() {
        let params = ConnectParams {
            server: Some("vpn.example.com".into()),
            ..Default::default()
        };
        let config = render_config(&params, &OpenVpnConfig::default()).unwrap();
        assert_eq!(
            config,
            "client\n\
             remote vpn.example.com 1194\n\
             proto udp\n\
             dev tun\n\
             resolv-retry infinite\n\
             nobind\n\
             persist-key\n\
             persist-tun\n\
             cipher AES-256-GCM\n\
             auth SHA256\n\
             verb 3\n"
        );
    }

    #[test]
    fn test_render_with_certs_and_overrides() {
        let params = ConnectParams {
            server: Some("10.0.0.1".into()),
            port: Some(443),
            transport: Some("tcp".into()),
            ca_cert: Some(PathBuf::from("/etc/vpn/ca.crt")),
            client_cert: Some(PathBuf::from("/etc/vpn/client.crt")),
            client_key: Some(PathBuf::from("/etc/vpn/client.key")),
            ..Default::default()
        };
        let settings = OpenVpnConfig {
            extra: vec!["remote-cert-tls server".into()],
            ..Default::default()
        };
        let config = render_config(&params, &settings).unwrap();
        let lines: Vec<&str> = config.lines().collect();

        assert_eq!(lines[1], "remote 10.0.0.1 443");
        assert_eq!(lines[2], "proto tcp");
        assert_eq!(lines[4], "ca /etc/vpn/ca.crt");
        assert_eq!(lines[5], "cert /etc/vpn/client.crt");
        assert_eq!(lines[6], "key /etc/vpn/client.key");
        assert_eq!(lines.last(), Some(&"remote-cert-tls server"));
    }

    #[test]
    fn test_render_requires_server() {
        let err = render_config(&ConnectParams::default(), &OpenVpnConfig::default()).unwrap_err();
        assert!(matches!(err, VpnError::Configuration(_)));
    }

    #[test]
    fn test_build_args() {
        let args = build_args(Path::new("/tmp/a.ovpn"), Some(Path::new("/tmp/auth")));
        assert_eq!(args, vec![
            OsString::from("--config"),
            OsString::from("/tmp/a.ovpn"),
            OsString::from("--auth-user-pass"),
            OsString::from("/tmp/auth"),
        ]);
        assert_eq!(build_args(Path::new("x.ovpn"), None).len(), 2);
    }

    #[test]
    fn test_prepare_writes_and_cleans_temp_files() {
        let launcher = OpenVpnLauncher::new(PathBuf::from("openvpn"), OpenVpnConfig::default());
        let params = ConnectParams {
            server: Some("vpn.example.com".into()),
            username: Some("alice".into()),
            password: Some("hunter2".into()),
            ..Default::default()
        };

        let (command, files) = launcher.prepare(&params).unwrap();
        let config_path = files.config.as_ref().unwrap().path().to_path_buf();
        let auth_path = files.auth.as_ref().unwrap().path().to_path_buf();

        assert!(
            std::fs::read_to_string(&config_path)
                .unwrap()
                .contains("remote vpn.example.com 1194")
        );
        assert_eq!(
            std::fs::read_to_string(&auth_path).unwrap(),
            "alice\nhunter2\n"
        );
        let args: Vec<_> = command.as_std().get_args().collect();
        assert_eq!(args.len(), 4);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&auth_path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        drop(files);
        assert!(!config_path.exists());
        assert!(!auth_path.exists());
    }

    #[test]
    fn test_prepare_missing_profile_file() {
        let launcher = OpenVpnLauncher::new(PathBuf::from("openvpn"), OpenVpnConfig::default());
        let params = ConnectParams {
            config_file: Some(PathBuf::from("/nonexistent/client.ovpn")),
            ..Default::default()
        };
        assert!(matches!(
            launcher.prepare(&params),
            Err(VpnError::Configuration(_))
        ));
    }
}
