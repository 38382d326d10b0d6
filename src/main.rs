mod cli;

use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use cli::Cli;
use cli::Command;
use cli::ConnectArgs;
use cli::CredentialsAction;
use tokio::io::BufReader;
use vpnclient::app::VpnClientApp;
use vpnclient::config::AppConfig;
use vpnclient::connection::ConnectionStatus;
use vpnclient::connection::format_uptime;
use vpnclient::credentials::Credentials;
use vpnclient::metrics::NetworkMetrics;
use vpnclient::platform;
use vpnclient::platform::Platform;
use vpnclient::protocol::Protocol;
use vpnclient::ui::Dashboard;

const STATUS_TICK: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.platform {
        println!("{}", Platform::current());
        return Ok(());
    }

    let config = AppConfig::load_or_default(cli.settings.as_deref())?;
    vpnclient::logging::init(&config.logging, cli.log_level.as_deref())?;
    tracing::debug!("Running on {}", Platform::current());

    match cli.command {
        None => run_dashboard(config).await,
        Some(Command::Connect(args)) => run_connect(config, args).await,
        Some(Command::Check) => run_check(&config).await,
        Some(Command::Interfaces) => {
            for iface in platform::network_interfaces().await {
                println!("{iface}");
            }
            Ok(())
        }
        Some(Command::Credentials { action }) => run_credentials(config, action),
        Some(Command::Latency { host, count }) => run_latency(&config, host, count).await,
        Some(Command::Throughput { duration }) => run_throughput(&config, duration).await,
    }
}

async fn run_dashboard(config: AppConfig) -> anyhow::Result<()> {
    warn_if_not_admin();
    let mut app = VpnClientApp::new(config);
    let input = BufReader::new(tokio::io::stdin());
    let mut dashboard = Dashboard::new(&mut app, input, std::io::stdout());
    dashboard.run().await
}

async fn run_connect(config: AppConfig, args: ConnectArgs) -> anyhow::Result<()> {
    warn_if_not_admin();
    let mut app = VpnClientApp::new(config);
    let mut params = args.params();

    if let Some(service) = &args.credentials {
        let saved = app
            .load_credentials(service)?
            .with_context(|| format!("no credentials stored for {service}"))?;
        params.username = params.username.or(Some(saved.username));
        params.password = params.password.or(Some(saved.password));
        params.psk = params.psk.or_else(|| saved.extra.get("psk").cloned());
    }

    tracing::info!("Connecting via {}", args.protocol);
    app.connect(args.protocol, params.clone())
        .await
        .with_context(|| format!("{} connection failed", args.protocol))?;

    if let Some(service) = &args.save_credentials
        && let Some((username, password)) = params.credentials()
    {
        let mut creds = Credentials::new(username, password);
        if let Some(psk) = &params.psk {
            creds.extra.insert("psk".to_string(), psk.clone());
        }
        if let Err(e) = app.save_credentials(service, &creds) {
            tracing::warn!("Could not save credentials: {}", e);
        }
    }

    let result = wait_for_end(&mut app).await;
    app.shutdown().await;
    result
}

/// Blocks until the tunnel is gone for good, or Ctrl+C.
async fn wait_for_end(app: &mut VpnClientApp) -> anyhow::Result<()> {
    let Some(mut status_rx) = app.subscribe() else {
        return Ok(());
    };
    let mut ticker = tokio::time::interval(STATUS_TICK);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut reported = None;

    loop {
        let status = app.status();
        if reported != Some(status) {
            reported = Some(status);
            report_status(app, status).await;
        }

        match status {
            ConnectionStatus::Error => {
                let reason = app.last_error().await.unwrap_or_default();
                anyhow::bail!("connection failed: {reason}");
            }
            ConnectionStatus::Disconnected if !app.is_monitoring() => {
                tracing::info!("Connection ended");
                return Ok(());
            }
            _ => {}
        }

        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("Interrupted, disconnecting");
                return Ok(());
            }
            changed = status_rx.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
            _ = ticker.tick() => {}
        }
    }
}

async fn report_status(app: &VpnClientApp, status: ConnectionStatus) {
    println!("Status: {status}");
    if status != ConnectionStatus::Connected {
        return;
    }
    if let Some(info) = app.connection_info().await {
        let show = |v: Option<String>| v.unwrap_or_else(|| "-".to_string());
        println!("  Assigned IP: {}", show(info.assigned_ip.map(|ip| ip.to_string())));
        println!("  Server IP:   {}", show(info.server_ip.map(|ip| ip.to_string())));
        println!("  Interface:   {}", show(info.interface.clone()));
        println!("  Uptime:      {}", format_uptime(info.uptime()));
    }
}

async fn run_check(config: &AppConfig) -> anyhow::Result<()> {
    let current = Platform::current();
    println!("Platform: {current}");
    println!(
        "Administrator: {}",
        if platform::is_admin() { "yes" } else { "no" }
    );

    for protocol in Protocol::ALL {
        let Some(binary) = platform::backend_binary(protocol, current, &config.binaries) else {
            println!("{:<8} native OS dialer", protocol.display_name());
            continue;
        };
        match which::which(binary) {
            Ok(path) => {
                let version = platform::binary_version(&path)
                    .await
                    .unwrap_or_else(|| "unknown version".to_string());
                println!(
                    "{:<8} {} ({})",
                    protocol.display_name(),
                    path.display(),
                    version
                );
            }
            Err(_) => println!(
                "{:<8} missing: {} not found",
                protocol.display_name(),
                binary.display()
            ),
        }
    }
    Ok(())
}

fn run_credentials(config: AppConfig, action: CredentialsAction) -> anyhow::Result<()> {
    let app = VpnClientApp::new(config);
    match action {
        CredentialsAction::Store {
            service,
            username,
            password,
            psk,
        } => {
            let mut creds = Credentials::new(username, password);
            if let Some(psk) = psk {
                creds.extra.insert("psk".to_string(), psk);
            }
            app.save_credentials(&service, &creds)?;
            println!("Stored credentials for {service}");
        }
        CredentialsAction::Show { service } => {
            let creds = app
                .load_credentials(&service)?
                .with_context(|| format!("no credentials stored for {service}"))?;
            println!("Username: {}", creds.username);
            println!("Password: ********");
            for key in creds.extra.keys() {
                println!("{key}: ********");
            }
        }
        CredentialsAction::Delete { service } => {
            if app.delete_credentials(&service)? {
                println!("Deleted credentials for {service}");
            } else {
                println!("No credentials stored for {service}");
            }
        }
    }
    Ok(())
}

async fn run_latency(config: &AppConfig, host: String, count: Option<usize>) -> anyhow::Result<()> {
    let mut metrics = NetworkMetrics::from_config(&config.metrics);
    metrics.set_target_host(host.as_str());
    let stats = metrics
        .measure_latency(count)
        .await
        .with_context(|| format!("no successful probes to {host}"))?;

    println!("min {:.1} ms", stats.min);
    println!("avg {:.1} ms", stats.avg);
    println!("median {:.1} ms", stats.median);
    println!("max {:.1} ms", stats.max);
    println!("jitter {:.1} ms", stats.jitter);
    Ok(())
}

async fn run_throughput(config: &AppConfig, duration: Option<u64>) -> anyhow::Result<()> {
    let metrics = NetworkMetrics::from_config(&config.metrics);
    let throughput = metrics
        .measure_throughput(duration.map(Duration::from_secs))
        .await
        .context("throughput test failed")?;

    println!("Download: {:.2} Mbps", throughput.download_mbps);
    println!("Upload:   {:.2} Mbps", throughput.upload_mbps);
    Ok(())
}

fn warn_if_not_admin() {
    if !platform::is_admin() {
        tracing::warn!("Not running with administrator privileges; VPN backends will likely fail");
    }
}
