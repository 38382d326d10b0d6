use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::path::PathBuf;

use tempfile::TempDir;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use vpnclient::config::AppConfig;
use vpnclient::config::BinaryPaths;
use vpnclient::config::CredentialBackend;

/// Shell scripts standing in for VPN backend executables.
pub struct FakeBackends {
    dir: TempDir,
}

impl FakeBackends {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("Failed to create temp dir"),
        }
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Writes an executable `sh` script named `name` and returns its path.
    pub fn script(&self, name: &str, body: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("Failed to write script");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
                .expect("Failed to chmod script");
        }
        path
    }

    /// An openvpn that brings the tunnel up and stays until SIGTERM.
    pub fn openvpn_ok(&self) -> PathBuf {
        self.script(
            "openvpn",
            r#"trap 'echo "SIGTERM[hard,] received, process exiting"; exit 0' TERM
echo "OpenVPN 2.6.9 x86_64-pc-linux-gnu"
echo "TUN/TAP device tun7 opened"
echo "PUSH: Received control message: 'PUSH_REPLY,route-gateway 10.8.0.1,ifconfig 10.8.0.6 255.255.255.0'"
echo "Peer Connection Initiated with [AF_INET]127.0.0.1:1194"
echo "Initialization Sequence Completed"
while true; do sleep 0.1; done"#,
        )
    }

    /// An openvpn whose credentials are rejected.
    pub fn openvpn_auth_failed(&self) -> PathBuf {
        self.script(
            "openvpn",
            r#"echo "AUTH: Received control message: AUTH_FAILED"
echo "SIGTERM[soft,auth-failure] received, process exiting"
exit 1"#,
        )
    }

    /// An openvpn that connects, then drops the tunnel after `secs`.
    pub fn openvpn_drops_after(&self, secs: f32) -> PathBuf {
        self.script(
            "openvpn",
            &format!(
                r#"echo "TUN/TAP device tun7 opened"
echo "Initialization Sequence Completed"
sleep {secs}
echo "Connection reset, restarting"
exit 0"#
            ),
        )
    }

    pub fn binaries(&self, openvpn: PathBuf) -> BinaryPaths {
        BinaryPaths {
            openvpn,
            ..BinaryPaths::default()
        }
    }

    /// Default config pointed at `openvpn`, with short timeouts.
    pub fn config(&self, openvpn: PathBuf) -> AppConfig {
        let mut config = AppConfig::default();
        config.binaries = self.binaries(openvpn);
        config.connection.connect_timeout_secs = 5;
        config.connection.stop_grace_ms = 1000;
        config.reconnect.enabled = false;
        config.credentials.backend = CredentialBackend::File;
        config.credentials.dir = Some(self.dir.path().join("store"));
        config
    }
}

impl Default for FakeBackends {
    fn default() -> Self {
        Self::new()
    }
}

/// Minimal HTTP/1.1 server for throughput tests: GET streams `payload_bytes`,
/// POST swallows the body and answers 200.
pub struct SpeedServer {
    pub addr: SocketAddr,
    task: JoinHandle<()>,
}

impl SpeedServer {
    pub async fn start(payload_bytes: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind");
        let addr = listener.local_addr().expect("Failed to get addr");

        let task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let _ = serve(socket, payload_bytes).await;
                });
            }
        });

        Self { addr, task }
    }

    pub fn download_url(&self) -> String {
        format!("http://{}/down", self.addr)
    }

    pub fn upload_url(&self) -> String {
        format!("http://{}/up", self.addr)
    }
}

impl Drop for SpeedServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(socket: TcpStream, payload_bytes: usize) -> std::io::Result<()> {
    let mut reader = BufReader::new(socket);
    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;

    let mut content_length = 0usize;
    loop {
        let mut header = String::new();
        if reader.read_line(&mut header).await? == 0 {
            break;
        }
        let header = header.trim_end();
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':')
            && name.eq_ignore_ascii_case("content-length")
        {
            content_length = value.trim().parse().unwrap_or(0);
        }
    }

    if request_line.starts_with("POST") {
        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body).await?;
        let socket = reader.get_mut();
        socket
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
            .await?;
        return socket.flush().await;
    }

    let socket = reader.get_mut();
    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {payload_bytes}\r\nConnection: close\r\n\r\n"
    );
    socket.write_all(head.as_bytes()).await?;
    let chunk = vec![b'x'; 16 * 1024];
    let mut left = payload_bytes;
    while left > 0 {
        let n = left.min(chunk.len());
        socket.write_all(&chunk[..n]).await?;
        left -= n;
    }
    socket.flush().await
}
