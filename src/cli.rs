use std::path::PathBuf;

use clap::Args;
use clap::Parser;
use clap::Subcommand;
use vpnclient::connection::ConnectParams;
use vpnclient::protocol::Protocol;

#[derive(Parser, Debug)]
#[command(name = "vpnclient", version)]
#[command(about = "Cross-platform VPN client driving OpenVPN, SSTP, L2TP and PPTP backends")]
pub struct Cli {
    /// Print the detected platform and exit
    #[arg(long)]
    pub platform: bool,

    /// Application settings file (TOML)
    #[arg(long, value_name = "FILE", global = true)]
    pub settings: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `vpnclient=trace`
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Connect and stay in the foreground until the tunnel ends or Ctrl+C
    Connect(ConnectArgs),

    /// Show which protocols have a usable backend
    Check,

    /// List network interfaces
    Interfaces,

    /// Manage saved credentials
    Credentials {
        #[command(subcommand)]
        action: CredentialsAction,
    },

    /// Measure TCP connect latency to a host
    Latency {
        host: String,

        #[arg(short = 'c', long, value_name = "N")]
        count: Option<usize>,
    },

    /// Measure download and upload throughput
    Throughput {
        #[arg(short = 'd', long, value_name = "SECS")]
        duration: Option<u64>,
    },
}

#[derive(Args, Debug)]
pub struct ConnectArgs {
    #[arg(long, value_enum)]
    pub protocol: Protocol,

    #[arg(long, value_name = "HOST")]
    pub server: Option<String>,

    #[arg(long)]
    pub port: Option<u16>,

    #[arg(long)]
    pub username: Option<String>,

    #[arg(long)]
    pub password: Option<String>,

    /// OpenVPN profile (.ovpn)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// OpenVPN transport (udp or tcp)
    #[arg(long, value_name = "PROTO")]
    pub transport: Option<String>,

    #[arg(long, value_name = "FILE")]
    pub ca_cert: Option<PathBuf>,

    #[arg(long, value_name = "FILE")]
    pub client_cert: Option<PathBuf>,

    #[arg(long, value_name = "FILE")]
    pub client_key: Option<PathBuf>,

    /// L2TP/IPsec pre-shared key
    #[arg(long)]
    pub psk: Option<String>,

    /// Name of the OS VPN profile used by native dialers
    #[arg(long, value_name = "NAME")]
    pub profile: Option<String>,

    /// Load username and password saved under SERVICE
    #[arg(long, value_name = "SERVICE")]
    pub credentials: Option<String>,

    /// Save the given username and password under SERVICE once connected
    #[arg(long, value_name = "SERVICE")]
    pub save_credentials: Option<String>,
}

impl ConnectArgs {
    pub fn params(&self) -> ConnectParams {
        ConnectParams {
            server: self.server.clone(),
            port: self.port,
            username: self.username.clone(),
            password: self.password.clone(),
            config_file: self.config.clone(),
            transport: self.transport.clone(),
            ca_cert: self.ca_cert.clone(),
            client_cert: self.client_cert.clone(),
            client_key: self.client_key.clone(),
            psk: self.psk.clone(),
            profile: self.profile.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum CredentialsAction {
    Store {
        service: String,

        #[arg(long)]
        username: String,

        #[arg(long)]
        password: String,

        #[arg(long)]
        psk: Option<String>,
    },
    Show {
        service: String,
    },
    Delete {
        service: String,
    },
}
