use std::fmt;
use std::path::Path;
use std::path::PathBuf;

use tracing::debug;

use crate::config::BinaryPaths;
use crate::protocol::Protocol;

const APP_NAME: &str = "vpnclient";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    MacOs,
    Linux,
    Android,
    Ios,
    Unknown,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else if cfg!(target_os = "ios") {
            Platform::Ios
        } else if cfg!(target_os = "android") || (cfg!(target_os = "linux") && looks_like_android())
        {
            Platform::Android
        } else if cfg!(target_os = "linux") {
            Platform::Linux
        } else {
            Platform::Unknown
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Platform::Windows => "windows",
            Platform::MacOs => "macos",
            Platform::Linux => "linux",
            Platform::Android => "android",
            Platform::Ios => "ios",
            Platform::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn looks_like_android() -> bool {
    std::env::var_os("ANDROID_ROOT").is_some() || Path::new("/system/bin/adb").exists()
}

/// True when running as root (Unix) or from an elevated prompt (Windows).
pub fn is_admin() -> bool {
    #[cfg(unix)]
    {
        unsafe { libc::geteuid() == 0 }
    }

    #[cfg(windows)]
    {
        // `net session` is refused for non-elevated processes.
        std::process::Command::new("net")
            .arg("session")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    #[cfg(not(any(unix, windows)))]
    {
        false
    }
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn appdata_dir() -> PathBuf {
    std::env::var_os("APPDATA")
        .map(PathBuf::from)
        .unwrap_or_else(home_dir)
}

fn env_dir(var: &str) -> Option<PathBuf> {
    std::env::var_os(var)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

pub fn config_dir() -> PathBuf {
    config_dir_for(Platform::current())
}

pub fn config_dir_for(platform: Platform) -> PathBuf {
    match platform {
        Platform::Windows => appdata_dir().join(APP_NAME),
        Platform::MacOs => home_dir()
            .join("Library")
            .join("Application Support")
            .join(APP_NAME),
        Platform::Linux => env_dir("XDG_CONFIG_HOME")
            .unwrap_or_else(|| home_dir().join(".config"))
            .join(APP_NAME),
        Platform::Android => home_dir().join(".config").join(APP_NAME),
        Platform::Ios | Platform::Unknown => home_dir().join(format!(".{APP_NAME}")),
    }
}

pub fn logs_dir() -> PathBuf {
    logs_dir_for(Platform::current())
}

pub fn logs_dir_for(platform: Platform) -> PathBuf {
    match platform {
        Platform::Windows => appdata_dir().join(APP_NAME).join("logs"),
        Platform::MacOs => home_dir().join("Library").join("Logs").join(APP_NAME),
        Platform::Linux => env_dir("XDG_STATE_HOME")
            .unwrap_or_else(|| home_dir().join(".local").join("state"))
            .join(APP_NAME)
            .join("logs"),
        Platform::Android => home_dir()
            .join(".local")
            .join("share")
            .join(APP_NAME)
            .join("logs"),
        Platform::Ios | Platform::Unknown => home_dir().join(format!(".{APP_NAME}")).join("logs"),
    }
}

pub fn ensure_dir(dir: &Path) -> std::io::Result<()> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
    }
    Ok(())
}

/// Names of the network interfaces on this machine. Errors yield an empty list.
pub async fn network_interfaces() -> Vec<String> {
    if cfg!(windows) {
        return match run_capture("ipconfig", &["/all"]).await {
            Some(out) => parse_ipconfig_adapters(&out),
            None => Vec::new(),
        };
    }

    if let Ok(mut entries) = tokio::fs::read_dir("/sys/class/net").await {
        let mut names = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        return names;
    }

    match run_capture("ifconfig", &[]).await {
        Some(out) => parse_ifconfig_interfaces(&out),
        None => Vec::new(),
    }
}

pub fn parse_ipconfig_adapters(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| line.to_lowercase().contains("adapter") && line.contains(':'))
        .filter_map(|line| line.split(':').next())
        .map(|name| name.trim().to_string())
        .collect()
}

pub fn parse_ifconfig_interfaces(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| !line.starts_with([' ', '\t']) && line.contains(':'))
        .filter_map(|line| line.split(':').next())
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

async fn run_capture(program: &str, args: &[&str]) -> Option<String> {
    let output = tokio::process::Command::new(program)
        .args(args)
        .output()
        .await
        .inspect_err(|e| debug!("{} failed to run: {}", program, e))
        .ok()?;
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Backend executable for `protocol` on `platform`, or None when the OS dials it natively.
pub fn backend_binary<'a>(
    protocol: Protocol,
    platform: Platform,
    binaries: &'a BinaryPaths,
) -> Option<&'a Path> {
    match (protocol, platform) {
        (Protocol::OpenVpn, _) => Some(&binaries.openvpn),
        (_, Platform::Windows) => None,
        (Protocol::L2tp | Protocol::Pptp, Platform::MacOs) => None,
        (Protocol::Sstp, _) => Some(&binaries.sstpc),
        (Protocol::L2tp, _) => Some(&binaries.xl2tpd),
        (Protocol::Pptp, _) => Some(&binaries.pptp),
    }
}

pub fn is_protocol_supported(protocol: Protocol, binaries: &BinaryPaths) -> bool {
    match backend_binary(protocol, Platform::current(), binaries) {
        Some(bin) => which::which(bin).is_ok(),
        None => true,
    }
}

/// First non-empty line printed by `<binary> --version`.
pub async fn binary_version(binary: &Path) -> Option<String> {
    let output = tokio::process::Command::new(binary)
        .arg("--version")
        .output()
        .await
        .ok()?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    stdout
        .lines()
        .chain(stderr.lines())
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}
